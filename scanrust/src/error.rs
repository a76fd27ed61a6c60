//! High-level error types

use scanrust_types::{ErrorKind, ErrorRecord};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Core protocol error: {0}")]
    Core(#[from] scanrust_core::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] scanrust_transport::Error),

    #[error("Type error: {0}")]
    Types(#[from] scanrust_types::Error),

    /// Driver or session failure tagged with its taxonomy kind
    #[error("{kind}: {message}")]
    Device { kind: ErrorKind, message: String },
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Device {
            kind,
            message: message.into(),
        }
    }

    pub fn not_supported(operation: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSupported, operation)
    }

    pub fn timeout(operation: &str, after: std::time::Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("{operation} did not complete within {after:?}"),
        )
    }

    /// Taxonomy kind for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Core(e) => e.kind(),
            Self::Transport(e) => e.kind(),
            Self::Types(e) => e.kind(),
            Self::Device { kind, .. } => *kind,
        }
    }

    /// Caller-facing record with message and suggested action
    pub fn record(&self) -> ErrorRecord {
        ErrorRecord::new(self.kind(), self.to_string())
    }

    /// Check if error is recoverable (retry on the same session might succeed)
    pub fn is_recoverable(&self) -> bool {
        self.kind().is_recoverable()
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}
