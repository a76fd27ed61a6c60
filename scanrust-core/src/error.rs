//! Error types for scanrust-core

use scanrust_types::ErrorKind;

use crate::command::{Command, Status};
use crate::state::SessionState;

/// Result type alias for core protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core protocol errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Frame is too short to hold a header
    #[error("Frame too short: expected at least {expected} bytes, got {actual} bytes")]
    FrameTooShort { expected: usize, actual: usize },

    /// Declared payload length differs from the bytes received
    #[error("Length mismatch: header declares {declared} bytes, got {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Payload too large: {size} bytes (max: {max} bytes)")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Unknown command code: 0x{0:02X}")]
    UnknownCommand(u8),

    #[error("Unknown status code: 0x{0:02X}")]
    UnknownStatus(u8),

    /// Identification returned an ID absent from the chipset table
    #[error("Unknown chipset id: 0x{0:04X}")]
    UnknownChipset(u16),

    /// Identification returned a known chipset other than the expected one
    #[error("Chipset mismatch: expected {expected}, found {found}")]
    ChipsetMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// Device answered with a failure status
    #[error("Device rejected {command}: {status}")]
    Device { command: Command, status: Status },

    /// Response payload has the wrong size for the command
    #[error("Unexpected payload for {command}: expected {expected} bytes, got {actual} bytes")]
    UnexpectedPayload {
        command: Command,
        expected: usize,
        actual: usize,
    },

    /// Operation not legal in the current session state
    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
}

impl Error {
    /// Taxonomy kind for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::FrameTooShort { .. }
            | Self::LengthMismatch { .. }
            | Self::PayloadTooLarge { .. }
            | Self::UnknownCommand(_)
            | Self::UnknownStatus(_)
            | Self::UnexpectedPayload { .. } => ErrorKind::CommunicationError,
            Self::UnknownChipset(_) | Self::ChipsetMismatch { .. } => ErrorKind::IncompatibleDevice,
            Self::Device { status, .. } => match status {
                Status::Busy => ErrorKind::DeviceBusy,
                Status::NotReady => ErrorKind::DeviceNotReady,
                Status::InvalidArgument => ErrorKind::InvalidParameter,
                Status::Unsupported => ErrorKind::NotSupported,
                Status::Ok | Status::EndOfData | Status::DeviceError => {
                    ErrorKind::CommunicationError
                }
            },
            Self::InvalidTransition { from, to } => from.misuse_kind(*to),
        }
    }

    /// Check if error is recoverable (retry on the same device might succeed)
    pub fn is_recoverable(&self) -> bool {
        self.kind().is_recoverable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_errors_are_communication() {
        let err = Error::LengthMismatch { declared: 4, actual: 2 };
        assert_eq!(err.kind(), ErrorKind::CommunicationError);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_unknown_chipset_is_incompatible() {
        assert_eq!(Error::UnknownChipset(0xBEEF).kind(), ErrorKind::IncompatibleDevice);
    }

    #[test]
    fn test_device_status_mapping() {
        let err = Error::Device {
            command: Command::StartScan,
            status: Status::Busy,
        };
        assert_eq!(err.kind(), ErrorKind::DeviceBusy);
        assert!(err.is_recoverable());
    }
}
