//! Error types for the storage contract
//!
//! One taxonomy is shared by every adapter and wrapper so that wrapping a
//! driver never changes what its callers can match on.

use thiserror::Error;

/// Result type alias using `StorageError`
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors surfaced through the storage contract
#[derive(Error, Debug)]
pub enum StorageError {
    /// Object not found
    #[error("object not found: {container}/{artifact}")]
    NotFound { container: String, artifact: String },

    /// Circuit breaker is open; the wrapped call was not attempted
    #[error("circuit open for {backend}")]
    CircuitOpen { backend: String },

    /// Request queue at capacity
    #[error("request queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Per-tenant egress quota hit
    #[error("quota exceeded for tenant {tenant}: requested {requested} bytes, {remaining} remaining")]
    QuotaExceeded {
        tenant: String,
        requested: u64,
        remaining: u64,
    },

    /// Every link of a fallback or failover chain failed
    #[error("all backends exhausted in {chain}: {last}")]
    AllBackendsFailed {
        chain: String,
        last: Box<StorageError>,
    },

    /// Request scope was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Request scope deadline passed
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// An internal timeout fired
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// No tenant in scope and the namespace requires one
    #[error("request scope carries no tenant")]
    MissingTenant,

    /// Tenant identifier failed validation
    #[error("invalid tenant id: {0}")]
    InvalidTenant(String),

    /// Container, artifact or prefix failed validation
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Backend answered with an error
    #[error("backend {backend}: {message}")]
    Backend { backend: String, message: String },

    /// HTTP transport error
    #[error("http error: {0}")]
    Http(String),

    /// Connection error
    #[error("connection error: {0}")]
    Connection(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or response parsing error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Request signing failed
    #[error("signing error: {0}")]
    Signing(#[from] conduit_sigv4::SigningError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Component has been shut down
    #[error("component shut down")]
    Shutdown,
}

/// Coarse error classes the front end maps to protocol responses
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Object absent
    NotFound,
    /// Dependency failing or unreachable (service-unavailable)
    Unavailable,
    /// Load shedding or quota (too-many-requests)
    Throttled,
    /// Caller gave up
    Cancelled,
    /// Bad input
    Invalid,
    /// Bug or misconfiguration
    Internal,
}

impl StorageError {
    /// Build a `NotFound` error
    pub fn not_found(container: &str, artifact: &str) -> Self {
        Self::NotFound {
            container: container.to_string(),
            artifact: artifact.to_string(),
        }
    }

    /// Build a backend error
    pub fn backend(backend: &str, message: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.to_string(),
            message: message.into(),
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::CircuitOpen { .. }
            | Self::AllBackendsFailed { .. }
            | Self::Timeout(_)
            | Self::Backend { .. }
            | Self::Http(_)
            | Self::Connection(_)
            | Self::Io(_)
            | Self::Shutdown => ErrorKind::Unavailable,
            Self::QueueFull { .. } | Self::QuotaExceeded { .. } => ErrorKind::Throttled,
            Self::Cancelled | Self::DeadlineExceeded => ErrorKind::Cancelled,
            Self::MissingTenant | Self::InvalidTenant(_) | Self::InvalidKey(_) => ErrorKind::Invalid,
            Self::Serialization(_) | Self::Signing(_) | Self::Configuration(_) => ErrorKind::Internal,
        }
    }

    /// Whether this is a not-found answer
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the scope was cancelled or its deadline passed
    pub fn is_cancellation(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    /// Whether the failure says something about the health of the dependency
    ///
    /// Transient errors are retried, trip circuit breakers and mark failover
    /// regions unhealthy. Not-found, invalid-input, quota and cancellation
    /// outcomes are answers from a working dependency.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Unavailable && !matches!(self, Self::Shutdown)
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StorageError::Timeout(err.to_string())
        } else if err.is_connect() {
            StorageError::Connection(err.to_string())
        } else {
            StorageError::Http(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<quick_xml::DeError> for StorageError {
    fn from(err: quick_xml::DeError) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
