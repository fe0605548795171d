//! Error codes shared by the parser, the background tasks and the maintenance
//! operations.
//!
//! A task finishes with at most one [`ErrorCode`]. Listeners receive the code
//! as-is, so the variants stay coarse: they describe what the user can do
//! about a failure, not every way it can happen.
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrorCode {
    /// Document is not RSS 2.0 or Atom, or is not well-formed XML.
    #[error("Unsupported feed format")]
    UnsupportedFormat,
    /// Reserved for feed versions the parser refuses to handle.
    #[error("Unsupported feed version")]
    UnsupportedVersion,
    /// The URL could not be opened (bad URL, connect failure, HTTP status).
    #[error("Failed to open URL")]
    IoOpenUrl,
    /// The connection broke while reading the body.
    #[error("Network error")]
    IoNet,
    /// Cancellation was observed mid-operation.
    #[error("Interrupted")]
    Interrupted,
    #[error("Unknown error")]
    Unknown,
    /// Explicit user abort. Not shown to the user as an error.
    #[error("Cancelled by user")]
    UserCancelled,
    #[error("Database failure")]
    DbCrash,
    #[error("File I/O failure")]
    IoFile,
}

impl ErrorCode {
    /// Whether the code represents a cancellation rather than a failure.
    pub fn is_cancellation(self) -> bool {
        matches!(self, ErrorCode::Interrupted | ErrorCode::UserCancelled)
    }
}

impl From<crate::storage::DatabaseError> for ErrorCode {
    fn from(err: crate::storage::DatabaseError) -> Self {
        tracing::warn!(error = %err, "Database operation failed");
        ErrorCode::DbCrash
    }
}

impl From<std::io::Error> for ErrorCode {
    fn from(err: std::io::Error) -> Self {
        tracing::warn!(error = %err, "File operation failed");
        ErrorCode::IoFile
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_codes() {
        assert!(ErrorCode::Interrupted.is_cancellation());
        assert!(ErrorCode::UserCancelled.is_cancellation());
        assert!(!ErrorCode::IoNet.is_cancellation());
        assert!(!ErrorCode::UnsupportedFormat.is_cancellation());
    }

    #[test]
    fn test_io_error_maps_to_io_file() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(ErrorCode::from(err), ErrorCode::IoFile);
    }
}
