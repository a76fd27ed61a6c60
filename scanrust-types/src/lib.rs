//! Type definitions for scanrust
//!
//! Data model shared by every layer: device descriptors, capabilities,
//! scan parameters, frame layout, and the error taxonomy.

pub mod capability;
pub mod descriptor;
pub mod error;
pub mod kind;
pub mod layout;
pub mod parameters;

pub use capability::{CapabilityDescriptor, CapabilityFlags, VendorConstraint, VendorOption};
pub use descriptor::{DeviceDescriptor, TransportKind};
pub use error::{Error, Result};
pub use kind::{classify, Classification, ErrorKind, ErrorRecord};
pub use layout::{mm_to_pixels, FrameFormat, FrameParameters, ScannedFrame, ScannedImage};
pub use parameters::{
    ColorMode, OutputEncoding, ParameterKind, ParameterValue, ScanArea, ScanParameters, ScanSource,
    MM_PER_INCH,
};
