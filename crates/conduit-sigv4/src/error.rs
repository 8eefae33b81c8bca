//! Error types for the conduit-sigv4 crate

use thiserror::Error;

/// Result type alias using `SigningError`
pub type Result<T> = std::result::Result<T, SigningError>;

/// Errors that can occur while signing requests
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SigningError {
    /// URL could not be parsed or built
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// URL has no host component to sign
    #[error("url has no host: {0}")]
    MissingHost(String),

    /// Presigned URL expiry out of range
    #[error("invalid presign expiry: {seconds}s (allowed 1..={max}s)")]
    InvalidExpiry { seconds: u64, max: u64 },

    /// Bucket name cannot be used with the requested addressing style
    #[error("invalid bucket name: {0}")]
    InvalidBucket(String),

    /// Header value is not printable ASCII
    #[error("invalid header value for {0}")]
    InvalidHeader(String),
}

impl From<url::ParseError> for SigningError {
    fn from(err: url::ParseError) -> Self {
        SigningError::InvalidUrl(err.to_string())
    }
}
