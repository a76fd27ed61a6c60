//! # scanrust-core
//!
//! Core register-protocol implementation for USB and network scanners.
//!
//! This crate provides the low-level protocol primitives:
//! - Request/response frame encoding and decoding
//! - Command and status definitions
//! - Chipset identification table
//! - Session lifecycle state tracking
//! - Protocol constants

pub mod chipset;
pub mod command;
pub mod constants;
pub mod error;
pub mod frame;
pub mod state;

pub use chipset::{ChipsetInfo, ChipsetKind, RegisterMap, CHIPSETS};
pub use command::{Command, Status};
pub use error::{Error, Result};
pub use frame::{RequestFrame, ResponseFrame, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use state::{ScanProgress, SessionState, StateTracker};

/// Protocol version information
pub const PROTOCOL_VERSION: &str = "1.0";
