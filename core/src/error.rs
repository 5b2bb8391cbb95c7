use thiserror::Error;

/// vmpull error types
#[derive(Error, Debug)]
pub enum VmError {
    /// Malformed remote VM reference
    #[error("Invalid reference '{reference}': {reason}")]
    InvalidReferenceError { reference: String, reason: String },

    /// Registry rejected the supplied (or missing) credentials
    #[error("Authentication failed for {registry}: {message}")]
    AuthenticationError { registry: String, message: String },

    /// Unsupported or malformed manifest, or no manifest for this platform
    #[error("Manifest error: {0}")]
    ManifestError(String),

    /// Connection reset, timeout, 5xx and similar recoverable failures
    #[error("Transient network error: {0}")]
    TransientNetworkError(String),

    /// Received bytes do not hash to the expected digest
    #[error("Digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatchError { expected: String, actual: String },

    /// Not enough free space even after pruning
    #[error(
        "Insufficient disk space: {required} bytes required, {available} bytes available ({shortfall} bytes short)"
    )]
    InsufficientSpaceError {
        required: u64,
        available: u64,
        shortfall: u64,
    },

    /// Another pull for the same local VM name is in flight
    #[error("Pull already in progress for {0}")]
    ConcurrentPullConflictError(String),

    /// Non-retryable HTTP status from the registry
    #[error("Registry error: {registry} - {status} {message}")]
    RegistryError {
        registry: String,
        status: u16,
        message: String,
    },

    /// Invalid user-supplied option
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Content store or VM storage failure
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Work aborted because a sibling task failed
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl VmError {
    /// Whether the failed operation may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VmError::TransientNetworkError(_))
    }

    /// Whether this error only reports that work was aborted on behalf of
    /// another failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, VmError::Cancelled(_))
    }
}

impl From<serde_json::Error> for VmError {
    fn from(err: serde_json::Error) -> Self {
        VmError::SerializationError(err.to_string())
    }
}

/// Result type alias for vmpull operations
pub type Result<T> = std::result::Result<T, VmError>;
