//! Gateway assembly errors

use conduit_storage::StorageError;
use thiserror::Error;

/// Result type alias using `GatewayError`
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors raised while loading configuration or assembling the driver graph
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration could not be read or parsed
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration parsed but is inconsistent
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// Topology references a backend that is not defined
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    /// Presigning requested without signing credentials
    #[error("no signing credentials configured")]
    SigningDisabled,

    /// Error from a driver
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Error from the signer
    #[error(transparent)]
    Signing(#[from] conduit_sigv4::SigningError),
}
