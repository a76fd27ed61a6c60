//! Transport errors

use std::io;

use scanrust_types::ErrorKind;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Connection timeout")]
    ConnectionTimeout,

    /// Fewer bytes than requested arrived before the deadline
    #[error("Read timeout: got {received} of {expected} bytes")]
    ReadTimeout { expected: usize, received: usize },

    #[error("Connection closed by remote")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Device claimed by another process or driver
    #[error("Device busy: {0}")]
    Busy(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[cfg(feature = "usb")]
    #[error("USB error: {0}")]
    Usb(rusb::Error),
}

impl Error {
    /// Taxonomy kind for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionTimeout | Self::ReadTimeout { .. } => ErrorKind::Timeout,
            Self::AlreadyConnected | Self::Busy(_) => ErrorKind::DeviceBusy,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::InvalidAddress(_) | Self::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            Self::Io(e) => match e.kind() {
                io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => {
                    ErrorKind::DeviceNotFound
                }
                io::ErrorKind::TimedOut => ErrorKind::Timeout,
                io::ErrorKind::OutOfMemory => ErrorKind::OutOfMemory,
                _ => ErrorKind::CommunicationError,
            },
            Self::NotConnected | Self::ConnectionClosed => ErrorKind::CommunicationError,
            #[cfg(feature = "usb")]
            Self::Usb(_) => ErrorKind::CommunicationError,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

#[cfg(feature = "usb")]
impl From<rusb::Error> for Error {
    fn from(e: rusb::Error) -> Self {
        match e {
            rusb::Error::Access => Self::PermissionDenied(e.to_string()),
            rusb::Error::Busy => Self::Busy(e.to_string()),
            rusb::Error::NotFound | rusb::Error::NoDevice => Self::DeviceNotFound(e.to_string()),
            rusb::Error::Timeout => Self::ReadTimeout {
                expected: 0,
                received: 0,
            },
            other => Self::Usb(other),
        }
    }
}
