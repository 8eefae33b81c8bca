//! Write options

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Optional metadata stored alongside an object
///
/// All fields default to unset. Backends that cannot keep a field report it
/// through [`Capabilities`](crate::Capabilities) and drop it silently.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PutOptions {
    /// MIME type
    pub content_type: Option<String>,
    /// Cache-Control directive
    pub cache_control: Option<String>,
    /// Content-Encoding (e.g. `gzip`)
    pub content_encoding: Option<String>,
    /// Content-Language
    pub content_language: Option<String>,
    /// User metadata (`x-amz-meta-*` on S3)
    pub user_metadata: BTreeMap<String, String>,
}

impl PutOptions {
    /// Set the content type
    pub fn with_content_type(mut self, value: impl Into<String>) -> Self {
        self.content_type = Some(value.into());
        self
    }

    /// Set Cache-Control
    pub fn with_cache_control(mut self, value: impl Into<String>) -> Self {
        self.cache_control = Some(value.into());
        self
    }

    /// Set Content-Encoding
    pub fn with_content_encoding(mut self, value: impl Into<String>) -> Self {
        self.content_encoding = Some(value.into());
        self
    }

    /// Set Content-Language
    pub fn with_content_language(mut self, value: impl Into<String>) -> Self {
        self.content_language = Some(value.into());
        self
    }

    /// Add one user metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_metadata.insert(key.into(), value.into());
        self
    }

    /// Whether nothing is set
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_empty() {
        assert!(PutOptions::default().is_empty());
        assert!(!PutOptions::default().with_metadata("k", "v").is_empty());
    }

    #[test]
    fn test_deserialize_partial() {
        let opts: PutOptions =
            serde_json::from_str(r#"{"content_type":"image/jpeg","user_metadata":{"camera":"x100"}}"#).unwrap();
        assert_eq!(opts.content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(opts.user_metadata.get("camera").map(String::as_str), Some("x100"));
        assert!(opts.cache_control.is_none());
    }
}
