//! Error types for dmp
//!
//! Errors raised outside the I/O path: configuration loading and parsing of
//! operator-supplied arguments.

use thiserror::Error;

/// Common result type for dmp operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for dmp
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts() {
        let err: Error = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().starts_with("I/O error: "));
    }

    #[test]
    fn test_error_display() {
        let err = Error::invalid_argument("missing '='");
        assert_eq!(err.to_string(), "invalid argument: missing '='");
    }
}
