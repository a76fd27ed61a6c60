use crate::kind::ErrorKind;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Parameters do not satisfy the device capabilities
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// Descriptor field is malformed
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// Value of the wrong type for a parameter
    #[error("Type mismatch for {name}: expected {expected}")]
    TypeMismatch { name: String, expected: &'static str },
}

impl Error {
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Taxonomy kind for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidDescriptor(_) => ErrorKind::DeviceNotFound,
            Self::InvalidParameter { .. } | Self::Parse(_) | Self::TypeMismatch { .. } => {
                ErrorKind::InvalidParameter
            }
        }
    }
}
