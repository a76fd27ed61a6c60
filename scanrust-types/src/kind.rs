//! Error taxonomy and recoverability classification
//!
//! Every layer maps its own error type onto an [`ErrorKind`]. The session
//! consults [`classify`] to decide whether a failed operation returns the
//! device to `Ready` or forces it into `Error`.

use std::fmt;

/// Error taxonomy shared by all layers
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DeviceNotFound,
    /// Device already opened by another session
    DeviceBusy,
    DeviceNotReady,
    /// Identification did not match any known chipset
    IncompatibleDevice,
    /// Transport-level framing or I/O failure
    CommunicationError,
    /// Parameters failed capability validation
    InvalidParameter,
    ScanInProgress,
    ScanNotInProgress,
    Cancelled,
    CalibrationError,
    InitializationError,
    Timeout,
    OutOfMemory,
    PermissionDenied,
    NotSupported,
    /// Delivered data does not match the declared frame layout
    DataCorruption,
}

impl ErrorKind {
    /// All kinds, in declaration order
    pub const ALL: [ErrorKind; 16] = [
        Self::DeviceNotFound,
        Self::DeviceBusy,
        Self::DeviceNotReady,
        Self::IncompatibleDevice,
        Self::CommunicationError,
        Self::InvalidParameter,
        Self::ScanInProgress,
        Self::ScanNotInProgress,
        Self::Cancelled,
        Self::CalibrationError,
        Self::InitializationError,
        Self::Timeout,
        Self::OutOfMemory,
        Self::PermissionDenied,
        Self::NotSupported,
        Self::DataCorruption,
    ];

    /// Stable identifier used in logs
    pub fn name(self) -> &'static str {
        match self {
            Self::DeviceNotFound => "device_not_found",
            Self::DeviceBusy => "device_busy",
            Self::DeviceNotReady => "device_not_ready",
            Self::IncompatibleDevice => "incompatible_device",
            Self::CommunicationError => "communication_error",
            Self::InvalidParameter => "invalid_parameter",
            Self::ScanInProgress => "scan_in_progress",
            Self::ScanNotInProgress => "scan_not_in_progress",
            Self::Cancelled => "cancelled",
            Self::CalibrationError => "calibration_error",
            Self::InitializationError => "initialization_error",
            Self::Timeout => "timeout",
            Self::OutOfMemory => "out_of_memory",
            Self::PermissionDenied => "permission_denied",
            Self::NotSupported => "not_supported",
            Self::DataCorruption => "data_corruption",
        }
    }

    /// Shorthand for `classify(self).recoverable`
    pub fn is_recoverable(self) -> bool {
        classify(self).recoverable
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of classifying an [`ErrorKind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Caller may retry on the same open device
    pub recoverable: bool,

    /// What the caller should do next
    pub suggested_action: &'static str,
}

/// Classify an error kind
///
/// Recoverable kinds leave the session usable (`Ready`). Unrecoverable kinds
/// force the session into `Error`, from which only `reset()` or `close()`
/// lead out.
///
/// # Examples
///
/// ```
/// use scanrust_types::{classify, ErrorKind};
///
/// assert!(classify(ErrorKind::Timeout).recoverable);
/// assert!(!classify(ErrorKind::IncompatibleDevice).recoverable);
/// ```
pub fn classify(kind: ErrorKind) -> Classification {
    let (recoverable, suggested_action) = match kind {
        ErrorKind::DeviceBusy => (true, "wait for the other session to close the device and retry"),
        ErrorKind::DeviceNotReady => (true, "wait for the device to become ready and retry"),
        ErrorKind::InvalidParameter => (true, "adjust the parameters to the reported capabilities"),
        ErrorKind::ScanInProgress => (true, "cancel or finish the current scan first"),
        ErrorKind::ScanNotInProgress => (true, "start a scan before reading or cancelling"),
        ErrorKind::Cancelled => (true, "start a new scan"),
        ErrorKind::CalibrationError => (true, "clean the calibration strip and retry the scan"),
        ErrorKind::Timeout => (true, "retry the operation"),
        ErrorKind::DeviceNotFound => (false, "rediscover devices and open again"),
        ErrorKind::IncompatibleDevice => (false, "this device is not supported by any driver"),
        ErrorKind::CommunicationError => (false, "check the connection, then reset or reopen the device"),
        ErrorKind::InitializationError => (false, "power-cycle the device and reopen it"),
        ErrorKind::OutOfMemory => (false, "reduce resolution or scan area"),
        ErrorKind::PermissionDenied => (false, "grant access to the device node"),
        ErrorKind::NotSupported => (false, "this operation is not available on this device"),
        ErrorKind::DataCorruption => (false, "reset the device and rescan"),
    };

    Classification {
        recoverable,
        suggested_action,
    }
}

/// Caller-facing error record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub recoverable: bool,
    pub suggested_action: Option<String>,
}

impl ErrorRecord {
    /// Build a record, filling recoverability from [`classify`]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let class = classify(kind);
        Self {
            kind,
            message: message.into(),
            recoverable: class.recoverable,
            suggested_action: class
                .recoverable
                .then(|| class.suggested_action.to_string()),
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if let Some(action) = &self.suggested_action {
            write!(f, " ({})", action)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_documented_recoverable_kinds() {
        for kind in [
            ErrorKind::DeviceBusy,
            ErrorKind::Timeout,
            ErrorKind::InvalidParameter,
            ErrorKind::Cancelled,
        ] {
            assert!(classify(kind).recoverable, "{kind} should be recoverable");
        }
    }

    #[test]
    fn test_documented_unrecoverable_kinds() {
        for kind in [
            ErrorKind::IncompatibleDevice,
            ErrorKind::OutOfMemory,
            ErrorKind::PermissionDenied,
            ErrorKind::DataCorruption,
        ] {
            assert!(!classify(kind).recoverable, "{kind} should not be recoverable");
        }
    }

    #[test]
    fn test_every_kind_has_action() {
        for kind in ErrorKind::ALL {
            assert!(!classify(kind).suggested_action.is_empty());
        }
    }

    #[test]
    fn test_record_only_suggests_retry_when_recoverable() {
        let busy = ErrorRecord::new(ErrorKind::DeviceBusy, "held by session 2");
        assert!(busy.recoverable);
        assert!(busy.suggested_action.is_some());

        let denied = ErrorRecord::new(ErrorKind::PermissionDenied, "/dev/bus/usb/001/004");
        assert!(!denied.recoverable);
        assert_eq!(denied.suggested_action, None);
    }

    #[test]
    fn test_record_display() {
        let record = ErrorRecord::new(ErrorKind::IncompatibleDevice, "chip id 0x1234");
        assert_eq!(record.to_string(), "[incompatible_device] chip id 0x1234");
    }
}
