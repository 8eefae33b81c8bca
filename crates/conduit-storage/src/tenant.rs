//! Tenant identity and key namespacing
//!
//! Tenants sharing a bucket are isolated only by the `t-{tenant}/` key
//! prefix, so tenant ids are validated to never contain a separator and
//! every adapter builds keys through [`TenantNamespace`].

use crate::scope::RequestScope;
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Maximum tenant id length
pub const MAX_TENANT_LEN: usize = 128;

/// Maximum artifact key length
pub const MAX_ARTIFACT_LEN: usize = 1024;

/// Prefix that marks a tenant namespace in storage keys
pub const TENANT_PREFIX: &str = "t-";

/// Validated tenant identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Validate and wrap a tenant id
    ///
    /// Allowed characters are ASCII alphanumerics, `.`, `_` and `-`. Ids are
    /// folded to lowercase: some backends (Dropbox, case-insensitive
    /// filesystems) do not distinguish `Acme` from `acme`, so neither may we.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let mut id = id.into();
        if id.is_empty() || id.len() > MAX_TENANT_LEN {
            return Err(StorageError::InvalidTenant(id));
        }
        if id == "." || id == ".." {
            return Err(StorageError::InvalidTenant(id));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(StorageError::InvalidTenant(id));
        }
        id.make_ascii_lowercase();
        Ok(Self(id))
    }

    /// The raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

/// `t-{tenant}/{container}/{artifact}`
pub fn tenant_key(tenant: &TenantId, container: &str, artifact: &str) -> String {
    format!("{}{}/{}/{}", TENANT_PREFIX, tenant, container, artifact)
}

/// Validate a container name: non-empty, no `/`, not `.`/`..`
pub fn validate_container(container: &str) -> Result<()> {
    if container.is_empty() || container.contains('/') || container == "." || container == ".." {
        return Err(StorageError::InvalidKey(format!("container {:?}", container)));
    }
    Ok(())
}

/// Validate an artifact name: non-empty relative path without `.`/`..`/empty segments
pub fn validate_artifact(artifact: &str) -> Result<()> {
    if artifact.is_empty() || artifact.len() > MAX_ARTIFACT_LEN {
        return Err(StorageError::InvalidKey(format!("artifact {:?}", artifact)));
    }
    if artifact
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(StorageError::InvalidKey(format!("artifact {:?}", artifact)));
    }
    Ok(())
}

/// How a namespace resolves the tenant of a call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TenantPolicy {
    /// Use the scope tenant; fall back to this tenant when the scope has none
    Fallback(TenantId),
    /// Reject calls whose scope carries no tenant
    Require,
}

/// Builds tenant-scoped storage keys from a request scope
#[derive(Clone, Debug)]
pub struct TenantNamespace {
    policy: TenantPolicy,
}

impl Default for TenantNamespace {
    fn default() -> Self {
        Self::with_fallback(TenantId("default".to_string()))
    }
}

impl TenantNamespace {
    /// Create with an explicit policy
    pub fn new(policy: TenantPolicy) -> Self {
        Self { policy }
    }

    /// Scope tenant, else `fallback`
    pub fn with_fallback(fallback: TenantId) -> Self {
        Self::new(TenantPolicy::Fallback(fallback))
    }

    /// Scope tenant or `MissingTenant`
    pub fn strict() -> Self {
        Self::new(TenantPolicy::Require)
    }

    /// The configured policy
    pub fn policy(&self) -> &TenantPolicy {
        &self.policy
    }

    /// Resolve the tenant of a call
    pub fn resolve(&self, scope: &RequestScope) -> Result<TenantId> {
        if let Some(tenant) = scope.tenant() {
            return Ok(tenant.clone());
        }
        match &self.policy {
            TenantPolicy::Fallback(fallback) => {
                debug!(
                    request_id = %scope.request_id(),
                    tenant = %fallback,
                    "scope carries no tenant, using configured fallback"
                );
                Ok(fallback.clone())
            }
            TenantPolicy::Require => Err(StorageError::MissingTenant),
        }
    }

    /// Storage key of one object
    pub fn object_key(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<String> {
        validate_container(container)?;
        validate_artifact(artifact)?;
        let tenant = self.resolve(scope)?;
        Ok(tenant_key(&tenant, container, artifact))
    }

    /// Key prefix shared by every object of a container: `t-{tenant}/{container}/`
    pub fn container_prefix(&self, scope: &RequestScope, container: &str) -> Result<String> {
        validate_container(container)?;
        let tenant = self.resolve(scope)?;
        Ok(format!("{}{}/{}/", TENANT_PREFIX, tenant, container))
    }

    /// Remove a container prefix from a raw storage key
    pub fn strip<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(prefix).filter(|rest| !rest.is_empty())
    }
}
