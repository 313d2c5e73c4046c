//! Error types for the CardStor storage engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the CardStor storage engine
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Backend Availability Errors
    // =========================================================================
    /// A single backend probe or call failed; usually non-fatal and absorbed
    /// into the mode decision
    #[error("Backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// The mode-appropriate backend failed during a write with no further
    /// fallback; fatal to the calling operation
    #[error("Storage unavailable during {operation}: {reason}")]
    StorageUnavailable { operation: String, reason: String },

    /// MetadataStore unreachable in a mode that requires it
    #[error("Metadata database unavailable: {0}")]
    DatabaseUnavailable(String),

    // =========================================================================
    // Request Errors
    // =========================================================================
    /// Ownership mismatch on a template operation
    #[error("Not authorized to access template: {template_id}")]
    Unauthorized { template_id: String },

    /// Template not found
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Resource storage attempted without required owner/project/template scoping
    #[error("Invalid storage context: {0}")]
    InvalidContext(String),

    /// Resource payload exceeds the configured maximum size
    #[error("Resource of {size} bytes exceeds limit of {limit} bytes")]
    ResourceTooLarge { size: usize, limit: usize },

    /// Resource payload could not be decoded
    #[error("Invalid resource payload: {0}")]
    InvalidPayload(String),

    /// A storage URL could not be parsed
    #[error("Invalid storage URL: {0}")]
    InvalidUrl(String),

    // =========================================================================
    // Configuration / Internal
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors a caller should treat as "retry later" rather than
    /// a permanent rejection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::BackendUnavailable { .. }
                | Error::StorageUnavailable { .. }
                | Error::DatabaseUnavailable(_)
        )
    }

    /// True for authorization / not-found class errors.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::Unauthorized { .. } | Error::TemplateNotFound(_) | Error::ResourceNotFound(_)
        )
    }

    /// True for caller errors (bad input, missing scoping context).
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidContext(_)
                | Error::ResourceTooLarge { .. }
                | Error::InvalidPayload(_)
                | Error::InvalidUrl(_)
        )
    }
}
