//! Bucket addressing styles
//!
//! S3-compatible providers disagree on whether the bucket lives in the host
//! (`bucket.s3.region.amazonaws.com/key`) or in the path
//! (`minio.local:9000/bucket/key`).

use crate::canonical::uri_encode_path;
use crate::{Result, SigningError};
use url::Url;

/// How the bucket name is placed in an object URL
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AddressingStyle {
    /// `https://{bucket}.{endpoint-host}/{key}`
    #[default]
    VirtualHosted,
    /// `https://{endpoint-host}/{bucket}/{key}`
    Path,
}

impl AddressingStyle {
    /// Parse a style name (`virtual` / `virtual-hosted` / `path`)
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "virtual" | "virtual-hosted" | "virtual_hosted" => Some(Self::VirtualHosted),
            "path" => Some(Self::Path),
            _ => None,
        }
    }
}

/// Build the URL of `key` inside `bucket`
///
/// An empty `key` yields the bucket URL itself (used for listing and bucket HEAD).
pub fn object_url(endpoint: &Url, bucket: &str, key: &str, style: AddressingStyle) -> Result<Url> {
    if bucket.is_empty() || bucket.contains('/') {
        return Err(SigningError::InvalidBucket(bucket.to_string()));
    }
    let host = endpoint
        .host_str()
        .ok_or_else(|| SigningError::MissingHost(endpoint.to_string()))?;

    let mut url = endpoint.clone();
    let base_path = endpoint.path().trim_end_matches('/');
    let encoded_key = uri_encode_path(key);

    match style {
        AddressingStyle::VirtualHosted => {
            if bucket.contains('.') && endpoint.scheme() == "https" {
                // Dotted bucket names break TLS wildcard certificates
                return Err(SigningError::InvalidBucket(bucket.to_string()));
            }
            url.set_host(Some(&format!("{}.{}", bucket, host)))?;
            url.set_path(&format!("{}/{}", base_path, encoded_key));
        }
        AddressingStyle::Path => {
            if key.is_empty() {
                url.set_path(&format!("{}/{}", base_path, bucket));
            } else {
                url.set_path(&format!("{}/{}/{}", base_path, bucket, encoded_key));
            }
        }
    }
    url.set_query(None);
    Ok(url)
}
