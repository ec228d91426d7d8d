use thiserror::Error;

/// The error taxonomy shared by every store in this crate.
///
/// Sandbox failures are deliberately excluded from aborting a lens build:
/// the lens engine records each failed map-function run in the lens's build
/// log and moves on. [`CoreError::Sandbox`] exists for sandbox
/// implementations that need to surface a fault through an ordinary
/// `Result` outside the build loop.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("already exists: {what}")]
    AlreadyExists { what: String },

    #[error("missing attachments: {}", .hash_urls.join(", "))]
    MissingAttachments { hash_urls: Vec<String> },

    #[error("validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("attachment too large: {bytes} bytes (max {max})")]
    TooLarge { bytes: u64, max: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sandbox error on {input}: {message}")]
    Sandbox {
        input: String,
        message: String,
        stack: Option<String>,
    },
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        CoreError::NotFound { what: what.into() }
    }

    pub fn already_exists(what: impl Into<String>) -> Self {
        CoreError::AlreadyExists { what: what.into() }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        CoreError::ValidationFailed {
            reason: reason.into(),
        }
    }

    pub fn missing_attachments(hash_urls: Vec<String>) -> Self {
        CoreError::MissingAttachments { hash_urls }
    }
}
