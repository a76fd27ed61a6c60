//! # scanrust
//!
//! Scanner driver framework: device discovery, capability negotiation and
//! raw image acquisition over heterogeneous backends.
//!
//! ## Features
//!
//! - One [`ScannerDriver`] contract over an in-process SANE emulation and
//!   register-programmed USB/network chipsets
//! - [`DeviceSession`] state machine with a background scan worker and a
//!   latest-value status channel
//! - [`DriverRegistry`] resolving descriptors to drivers
//! - Typed errors classified as recoverable or not
//!
//! ## Quick Start
//!
//! ```no_run
//! use scanrust::{ColorMode, DriverRegistry, ScanArea, ScanParameters};
//!
//! #[tokio::main]
//! async fn main() -> scanrust::Result<()> {
//!     let registry = DriverRegistry::builder().with_emulation_defaults().build();
//!
//!     for device in registry.discover().await?.iter() {
//!         println!("{}", device);
//!     }
//!
//!     let session = registry.open_id("test:0").await?;
//!     let params = ScanParameters::new(300, ColorMode::Gray, ScanArea::new(0.0, 0.0, 210.0, 297.0));
//!     session.configure(&params).await?;
//!     session.start_scan().await?;
//!
//!     let image = session.wait_for_scan().await?;
//!     println!("{} frame(s), {} bytes", image.frames.len(), image.total_bytes());
//!
//!     session.close().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod driver;
pub mod emulation;
pub mod error;
pub mod handle;
pub mod hardware;
pub mod registry;
pub mod session;

// Re-exports
pub use config::{AdapterConfig, SessionConfig};
pub use driver::{AnyDriver, DriverKind, ReadOutcome, ScannerDriver};
pub use error::{Error, Result};
pub use handle::{DeviceHandle, HandleArena, HandleId};
pub use registry::{DriverRegistry, DriverRegistryBuilder};
pub use session::{DeviceSession, SessionStatus};

// Re-export types
pub use scanrust_core::{ChipsetKind, ScanProgress, SessionState};
pub use scanrust_types::{
    classify, CapabilityDescriptor, CapabilityFlags, ColorMode, DeviceDescriptor, ErrorKind,
    ErrorRecord, FrameFormat, FrameParameters, OutputEncoding, ParameterKind, ParameterValue,
    ScanArea, ScanParameters, ScanSource, ScannedFrame, ScannedImage, TransportKind,
};
