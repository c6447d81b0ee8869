//! Error types for image source resolution.

use std::path::PathBuf;
use std::sync::Arc;

/// Result type alias for image source operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving or materializing an image source.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Invalid Input Errors
    // =========================================================================
    /// Failed to parse or validate an image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// The identifier is not an image identifier.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Unrecognized resolve-mode string.
    #[error("invalid resolve mode: {0}")]
    InvalidResolveMode(String),

    // =========================================================================
    // Pull Errors
    // =========================================================================
    /// Manifest or config pull failed.
    #[error("failed to pull manifests for '{reference}': {reason}")]
    ManifestPullFailed { reference: String, reason: String },

    /// Remote blob fetch failed.
    #[error("failed to fetch content {digest}: {reason}")]
    ContentFetchFailed { digest: String, reason: String },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Blob not found in the content store.
    #[error("blob not found: {digest}")]
    BlobNotFound { digest: String },

    /// Storage initialization failed.
    #[error("failed to initialize storage at {path}: {reason}")]
    StorageInitFailed { path: PathBuf, reason: String },

    /// Storage write failed.
    #[error("failed to write to storage: {0}")]
    StorageWriteFailed(String),

    // =========================================================================
    // Lease Errors
    // =========================================================================
    /// Lease creation, registration, or release failed.
    #[error("lease operation failed: {0}")]
    LeaseFailed(String),

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Failure replayed from a shared in-flight or memoized operation.
    #[error(transparent)]
    Shared(Arc<Error>),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error means "content not present", as opposed to a
    /// hard storage failure. Callers use this to tell eviction (recoverable
    /// by re-pulling) apart from real errors.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::BlobNotFound { .. } => true,
            Error::Shared(inner) => inner.is_not_found(),
            _ => false,
        }
    }
}
