//! Error types for dedupe_core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using dedupe_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during store and engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Payload is larger than the configured maximum.
    #[error("Payload too large: {size} bytes (max {max})")]
    SizeExceeded { size: usize, max: usize },

    /// No content exists for the given ID, digest or key.
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// The reference is not recorded against the content.
    #[error("Reference {reference} not found for id {id}")]
    ReferenceNotFound { id: u32, reference: String },

    /// An index key already exists.
    #[error("Key already exists: {key}")]
    AlreadyExists { key: String },

    /// The store or engine has been closed.
    #[error("Store is closed")]
    Closed,

    /// Stored data is inconsistent or cannot be decoded.
    #[error("Corrupted data: {reason}")]
    Corrupted { reason: String },

    /// Invalid digest format or encoding.
    #[error("Invalid digest: {reason}")]
    InvalidDigest { reason: String },

    /// Store directory is invalid or misconfigured.
    #[error("Invalid store at {path}: {reason}")]
    InvalidStore { path: PathBuf, reason: String },

    /// Unsupported algorithm.
    #[error("Unsupported algorithm: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },
}

impl Error {
    /// Create a SizeExceeded error.
    pub fn size_exceeded(size: usize, max: usize) -> Self {
        Error::SizeExceeded { size, max }
    }

    /// Create a NotFound error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound { what: what.into() }
    }

    /// Create a ReferenceNotFound error.
    pub fn reference_not_found(id: u32, reference: impl Into<String>) -> Self {
        Error::ReferenceNotFound {
            id,
            reference: reference.into(),
        }
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(key: impl Into<String>) -> Self {
        Error::AlreadyExists { key: key.into() }
    }

    /// Create a Corrupted error.
    pub fn corrupted(reason: impl Into<String>) -> Self {
        Error::Corrupted {
            reason: reason.into(),
        }
    }

    /// Create an InvalidDigest error.
    pub fn invalid_digest(reason: impl Into<String>) -> Self {
        Error::InvalidDigest {
            reason: reason.into(),
        }
    }

    /// Create an InvalidStore error.
    pub fn invalid_store(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidStore {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an UnsupportedAlgorithm error.
    pub fn unsupported_algorithm(algorithm: impl Into<String>) -> Self {
        Error::UnsupportedAlgorithm {
            algorithm: algorithm.into(),
        }
    }

    /// Whether this is an engine "not found" (used by the existence checks).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_not_found() {
        assert!(Error::not_found("id 7").is_not_found());
        assert!(!Error::Closed.is_not_found());
        assert!(!Error::reference_not_found(7, "owner").is_not_found());
    }

    #[test]
    fn test_display() {
        let err = Error::size_exceeded(10, 5);
        assert_eq!(err.to_string(), "Payload too large: 10 bytes (max 5)");

        let err = Error::reference_not_found(3, "ownerA");
        assert_eq!(err.to_string(), "Reference ownerA not found for id 3");
    }

    #[test]
    fn test_io_from() {
        let err: Error = std::io::Error::other("boom").into();
        assert!(matches!(err, Error::Io { .. }));
    }
}
