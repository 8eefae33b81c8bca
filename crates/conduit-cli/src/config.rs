//! Gateway configuration

use crate::error::{GatewayError, Result};
use conduit_core::{
    CacheConfig, CircuitBreakerConfig, CompressionConfig, FailoverConfig, QuotaConfig,
    RetryPolicy, StreamGuardConfig, ThrottleConfig,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Environment variable prefix; nesting uses `__` (`CONDUIT__TENANT__FALLBACK=acme`)
pub const ENV_PREFIX: &str = "CONDUIT";

/// Gateway configuration
///
/// Every wrapper section is optional; an absent section leaves that wrapper
/// out of the driver graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// How calls without a tenant are handled
    pub tenant: TenantConfig,
    /// Named backends available to the topology
    pub backends: Vec<BackendConfig>,
    /// How backends are arranged under the wrappers
    pub topology: TopologyConfig,
    /// Circuit breaker around the topology
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Retry with backoff
    pub retry: Option<RetryPolicy>,
    /// Byte-rate throttle
    pub throttle: Option<ThrottleConfig>,
    /// Transparent payload compression
    pub compression: Option<CompressionConfig>,
    /// Tenant-aware read cache
    pub cache: Option<CacheConfig>,
    /// Bound on concurrently open read streams
    pub stream_guard: Option<StreamGuardConfig>,
    /// Monthly per-tenant egress quota
    pub quota: Option<QuotaConfig>,
    /// Credentials for presigned URLs
    pub signing: Option<SigningConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            tenant: TenantConfig::default(),
            backends: vec![BackendConfig::Memory {
                name: "memory".to_string(),
            }],
            topology: TopologyConfig::Single {
                backend: "memory".to_string(),
            },
            circuit_breaker: None,
            retry: None,
            throttle: None,
            compression: None,
            cache: None,
            stream_guard: None,
            quota: None,
            signing: None,
        }
    }
}

/// Tenant resolution
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantConfig {
    /// Tenant used when a call carries none
    pub fallback: String,
    /// Reject calls without a tenant instead of using the fallback
    pub require: bool,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            fallback: "default".to_string(),
            require: false,
        }
    }
}

/// One named backend
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// In-process map, for development and tests
    Memory { name: String },
    /// Local filesystem
    Local {
        name: String,
        root: PathBuf,
        #[serde(default)]
        max_open_handles: Option<usize>,
    },
    /// S3-compatible provider
    S3 {
        name: String,
        /// `aws`, `wasabi`, `backblaze`, `r2`, `digitalocean`, `minio` or `custom`
        provider: String,
        bucket: String,
        access_key: String,
        secret_key: String,
        #[serde(default)]
        session_token: Option<String>,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
        /// `path` or `virtual`
        #[serde(default)]
        addressing: Option<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    /// Dropbox consumer drive
    Dropbox {
        name: String,
        access_token: String,
        #[serde(default)]
        root: Option<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

impl BackendConfig {
    /// Backend name referenced by the topology
    pub fn name(&self) -> &str {
        match self {
            Self::Memory { name }
            | Self::Local { name, .. }
            | Self::S3 { name, .. }
            | Self::Dropbox { name, .. } => name,
        }
    }
}

/// Arrangement of backends beneath the wrappers
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum TopologyConfig {
    /// One backend
    Single { backend: String },
    /// Try `primary`, fall back to `secondary` on transient failures
    Fallback { primary: String, secondary: String },
    /// Health-tracked regions with background probing
    Failover {
        primary: String,
        secondary: String,
        #[serde(default)]
        settings: FailoverConfig,
    },
}

impl TopologyConfig {
    /// Backend names this topology references
    pub fn backends(&self) -> Vec<&str> {
        match self {
            Self::Single { backend } => vec![backend],
            Self::Fallback { primary, secondary } | Self::Failover { primary, secondary, .. } => {
                vec![primary, secondary]
            }
        }
    }
}

/// Credentials used for presigned URLs
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SigningConfig {
    pub access_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Base endpoint; defaults to the AWS endpoint of `region`
    #[serde(default)]
    pub endpoint: Option<String>,
    /// `path` or `virtual`
    #[serde(default)]
    pub addressing: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl GatewayConfig {
    /// Load from an optional TOML file, then `CONDUIT__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: GatewayConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document
    pub fn from_toml(source: &str) -> Result<Self> {
        let config: GatewayConfig = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check names are unique and the topology only references defined backends
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.name()) {
                return Err(GatewayError::Invalid(format!(
                    "backend {:?} defined more than once",
                    backend.name()
                )));
            }
        }
        for name in self.topology.backends() {
            if !seen.contains(name) {
                return Err(GatewayError::UnknownBackend(name.to_string()));
            }
        }
        if let TopologyConfig::Fallback { primary, secondary }
        | TopologyConfig::Failover { primary, secondary, .. } = &self.topology
        {
            if primary == secondary {
                return Err(GatewayError::Invalid(format!(
                    "primary and secondary are both {:?}",
                    primary
                )));
            }
        }
        if self.tenant.fallback.is_empty() && !self.tenant.require {
            return Err(GatewayError::Invalid("tenant.fallback is empty".to_string()));
        }
        Ok(())
    }

    /// Backend definition by name
    pub fn backend(&self, name: &str) -> Result<&BackendConfig> {
        self.backends
            .iter()
            .find(|b| b.name() == name)
            .ok_or_else(|| GatewayError::UnknownBackend(name.to_string()))
    }
}
