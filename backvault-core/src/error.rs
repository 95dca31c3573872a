/*!
Error types for the Backvault core engine.
*/

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type used throughout the Backvault core.
pub type Result<T> = std::result::Result<T, BackupError>;

/// Failures raised by the chunked encryption layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoFailure {
    /// A chunk failed AEAD verification (wrong password or tampered data)
    #[error("authentication failed on chunk {chunk}")]
    AuthenticationFailed { chunk: u64 },

    /// Input ended inside the header or inside a frame
    #[error("encrypted container is truncated")]
    Truncated,

    /// A frame length prefix outside the allowed range
    #[error("invalid frame length {length} on chunk {chunk}")]
    InvalidFrame { chunk: u64, length: u32 },

    /// The 96-bit nonce counter would wrap
    #[error("nonce space exhausted")]
    NonceExhausted,

    /// Encryption was requested without a password
    #[error("encryption password is not configured")]
    MissingPassword,

    /// Cipher or key derivation setup failed
    #[error("cipher error: {0}")]
    Cipher(String),
}

/// Errors that can occur during backup and restore operations.
#[derive(Error, Debug)]
pub enum BackupError {
    /// Connection failures, timeouts and server-side (5xx) errors
    #[error("Transient network error during {operation}: {message}")]
    TransientNetwork {
        operation: &'static str,
        message: String,
    },

    /// Client-side (4xx) or request validation errors that must not be retried
    #[error("Client error{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    PermanentClient { status: Option<u16>, message: String },

    /// Local filesystem failures
    #[error("I/O error on {}: {source}", .path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Encryption or decryption failures
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoFailure),

    /// Restored content does not hash to the recorded checksum
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// State store read or write failures
    #[error("State store error: {0}")]
    StateStore(String),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Malformed restore manifest
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),
}

impl BackupError {
    /// Create a new transient network error
    pub fn transient<S: Into<String>>(operation: &'static str, msg: S) -> Self {
        Self::TransientNetwork {
            operation,
            message: msg.into(),
        }
    }

    /// Create a new permanent client error
    pub fn client<S: Into<String>>(status: Option<u16>, msg: S) -> Self {
        Self::PermanentClient {
            status,
            message: msg.into(),
        }
    }

    /// Wrap an I/O error with the path it occurred on
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::LocalIo {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Create a new state store error
    pub fn state_store<S: Into<String>>(msg: S) -> Self {
        Self::StateStore(msg.into())
    }

    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new invalid manifest error
    pub fn invalid_manifest<S: Into<String>>(msg: S) -> Self {
        Self::InvalidManifest(msg.into())
    }

    /// True for authentication failures of the encryption layer
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            Self::Crypto(CryptoFailure::AuthenticationFailed { .. })
        )
    }
}

impl backvault_retry::RetryableError for BackupError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork { .. })
    }
}

impl From<backvault_retry::RetryError> for BackupError {
    fn from(err: backvault_retry::RetryError) -> Self {
        use backvault_retry::RetryError;

        match err {
            RetryError::MaxRetriesExceeded {
                operation,
                attempts,
                source,
            } => Self::TransientNetwork {
                operation,
                message: format!("gave up after {attempts} attempts: {source}"),
            },
            other => {
                let operation = other.operation();
                let permanent = other.is_permanent();
                match other.into_source().downcast::<BackupError>() {
                    Ok(inner) => *inner,
                    Err(source) if permanent => Self::client(None, source.to_string()),
                    Err(source) => Self::transient(operation, source.to_string()),
                }
            }
        }
    }
}
