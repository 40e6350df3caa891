use thiserror::Error;

/// Errors raised while parsing references, talking to registries,
/// and rebasing or pushing images.
#[derive(Error, Debug)]
pub enum OciError {
    /// Reference string could not be decomposed into registry/repository/[tag|digest]
    #[error("Malformed reference '{reference}': {reason}")]
    MalformedReference { reference: String, reason: String },

    /// Digest string is not `<algorithm>:<hex>`
    #[error("Invalid digest '{0}'")]
    InvalidDigest(String),

    /// Credential resolution or the token exchange failed
    #[error("Authentication failed for {registry}: {reason}")]
    AuthenticationFailed { registry: String, reason: String },

    /// The registry rejected the requested scope
    #[error("Permission denied for {reference}: {reason}")]
    PermissionDenied { reference: String, reason: String },

    /// Upload session could not be opened
    #[error("Upload initiation failed for {reference}: {status} - {reason}")]
    UploadInitiationFailed {
        reference: String,
        status: u16,
        reason: String,
    },

    /// Fetched bytes do not hash to the requested digest
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Old base layers are not a prefix of the original image's layers
    #[error("Base mismatch at layer {position}: old base has {expected}, original has {found}")]
    BaseMismatch {
        position: usize,
        expected: String,
        found: String,
    },

    /// No new base given and the original manifest lacks the annotation
    #[error("Either a new base or the '{annotation}' annotation is required")]
    MissingBaseReference { annotation: String },

    /// No old base given and the original manifest lacks the annotation
    #[error("Either an old base or the '{annotation}' annotation is required")]
    MissingBaseDigest { annotation: String },

    /// Manifest could not be fetched or parsed
    #[error("Failed to fetch manifest {reference}: {reason}")]
    ManifestFetchFailed { reference: String, reason: String },

    /// Blob read or write failed
    #[error("Blob transfer failed for {digest}: {reason}")]
    BlobTransferFailed { digest: String, reason: String },

    /// The registry refused the manifest
    #[error("Failed to submit manifest {reference}: {reason}")]
    ManifestSubmissionFailed { reference: String, reason: String },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for OciError {
    fn from(err: serde_json::Error) -> Self {
        OciError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for OciError {
    fn from(err: serde_yaml::Error) -> Self {
        OciError::SerializationError(err.to_string())
    }
}

/// Result type alias for registry and rebase operations
pub type Result<T> = std::result::Result<T, OciError>;
