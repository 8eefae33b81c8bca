//! S3-compatible storage driver
//!
//! Speaks the S3 REST API to AWS and the providers that clone it. Every
//! request is signed with SigV4; objects are stored under the tenant
//! namespace inside one configured bucket.

use crate::stream::{self, ByteStream};
use crate::{
    Capabilities, PutOptions, RequestScope, Result, StorageDriver, StorageError, TenantNamespace,
};
use async_trait::async_trait;
use bytes::Bytes;
use conduit_sigv4::canonical::uri_encode;
use conduit_sigv4::{
    content_md5, object_url, sha256_hex, AddressingStyle, Credentials, SigV4Signer,
    SignableRequest, EMPTY_PAYLOAD_SHA256,
};
use futures::StreamExt;
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

/// Known S3-compatible providers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum S3Provider {
    Aws,
    Wasabi,
    BackblazeB2,
    CloudflareR2,
    DigitalOcean,
    Minio,
    /// Any other S3-compatible endpoint
    Custom,
}

impl S3Provider {
    /// Parse a provider name as used in configuration files
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "aws" | "s3" | "amazon" => Some(Self::Aws),
            "wasabi" => Some(Self::Wasabi),
            "backblaze" | "backblazeb2" | "b2" => Some(Self::BackblazeB2),
            "r2" | "cloudflare" | "cloudflarer2" => Some(Self::CloudflareR2),
            "digitalocean" | "spaces" => Some(Self::DigitalOcean),
            "minio" => Some(Self::Minio),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }

    /// Endpoint for `region`, when the provider has a fixed pattern
    ///
    /// R2 endpoints embed the account id and MinIO/custom endpoints are
    /// self-hosted, so those must be configured explicitly.
    pub fn default_endpoint(&self, region: &str) -> Option<String> {
        match self {
            Self::Aws => Some(format!("https://s3.{}.amazonaws.com", region)),
            Self::Wasabi => Some(format!("https://s3.{}.wasabisys.com", region)),
            Self::BackblazeB2 => Some(format!("https://s3.{}.backblazeb2.com", region)),
            Self::DigitalOcean => Some(format!("https://{}.digitaloceanspaces.com", region)),
            Self::CloudflareR2 | Self::Minio | Self::Custom => None,
        }
    }

    /// Preferred addressing style
    pub fn addressing(&self) -> AddressingStyle {
        match self {
            Self::Aws | Self::Wasabi | Self::BackblazeB2 | Self::DigitalOcean => {
                AddressingStyle::VirtualHosted
            }
            Self::CloudflareR2 | Self::Minio | Self::Custom => AddressingStyle::Path,
        }
    }

    /// Region to sign with when none is configured
    pub fn default_region(&self) -> &'static str {
        match self {
            Self::CloudflareR2 => "auto",
            _ => "us-east-1",
        }
    }
}

/// S3 driver configuration
#[derive(Clone, Debug)]
pub struct S3Config {
    /// Driver name used in logs and errors
    pub name: String,
    pub provider: S3Provider,
    pub bucket: String,
    pub region: String,
    /// Overrides the provider endpoint
    pub endpoint: Option<String>,
    /// Overrides the provider addressing style
    pub addressing: Option<AddressingStyle>,
    pub credentials: Credentials,
    /// Whole-request timeout
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl S3Config {
    /// Configuration with provider defaults
    pub fn new(provider: S3Provider, bucket: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            name: "s3".to_string(),
            provider,
            bucket: bucket.into(),
            region: provider.default_region().to_string(),
            endpoint: None,
            addressing: None,
            credentials,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Set the driver name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the signing region
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Set an explicit endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the addressing style
    pub fn with_addressing(mut self, addressing: AddressingStyle) -> Self {
        self.addressing = Some(addressing);
        self
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolve the endpoint URL
    pub fn endpoint_url(&self) -> Result<Url> {
        let endpoint = self
            .endpoint
            .clone()
            .or_else(|| self.provider.default_endpoint(&self.region))
            .ok_or_else(|| {
                StorageError::Configuration(format!(
                    "{}: provider {:?} needs an explicit endpoint",
                    self.name, self.provider
                ))
            })?;
        Url::parse(&endpoint)
            .map_err(|e| StorageError::Configuration(format!("{}: endpoint {}: {}", self.name, endpoint, e)))
    }

    /// Resolve the addressing style
    pub fn addressing_style(&self) -> AddressingStyle {
        self.addressing.unwrap_or_else(|| self.provider.addressing())
    }
}

/// `ListObjectsV2` response body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    contents: Vec<ListEntry>,
    #[serde(default)]
    is_truncated: bool,
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    key: String,
}

/// S3 error response body
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// S3-compatible driver
pub struct S3Driver {
    config: S3Config,
    endpoint: Url,
    signer: SigV4Signer,
    namespace: TenantNamespace,
    http: Client,
}

impl S3Driver {
    /// Create a driver from its configuration
    pub fn new(config: S3Config) -> Result<Self> {
        let endpoint = config.endpoint_url()?;
        let addressing = config.addressing_style();
        // Validate the bucket against the addressing style up front
        object_url(&endpoint, &config.bucket, "", addressing)?;

        let signer = SigV4Signer::new(config.credentials.clone(), config.region.clone())
            .with_endpoint(endpoint.clone(), addressing);
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(format!("conduit/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            config,
            endpoint,
            signer,
            namespace: TenantNamespace::default(),
            http,
        })
    }

    /// Use a specific tenant namespace
    pub fn with_namespace(mut self, namespace: TenantNamespace) -> Self {
        self.namespace = namespace;
        self
    }

    /// The configuration
    pub fn config(&self) -> &S3Config {
        &self.config
    }

    /// Presigned URL granting `method` on one object for `ttl`
    pub fn presign(
        &self,
        scope: &RequestScope,
        method: &str,
        container: &str,
        artifact: &str,
        ttl: Duration,
    ) -> Result<Url> {
        let key = self.namespace.object_key(scope, container, artifact)?;
        Ok(self
            .signer
            .generate_presigned_url(method, &self.config.bucket, &key, ttl)?)
    }

    fn url_for(&self, key: &str) -> Result<Url> {
        Ok(object_url(
            &self.endpoint,
            &self.config.bucket,
            key,
            self.config.addressing_style(),
        )?)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        headers: BTreeMap<String, String>,
        body: Option<Bytes>,
    ) -> Result<Response> {
        let payload_hash = match &body {
            Some(data) => sha256_hex(data),
            None => EMPTY_PAYLOAD_SHA256.to_string(),
        };
        let mut request = SignableRequest::new(method.as_str(), url);
        for (name, value) in headers {
            request.insert_header(&name, value);
        }
        self.signer.sign(&mut request, &payload_hash)?;

        let mut req = self.http.request(method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            // reqwest derives Host from the URL
            if name != "host" {
                req = req.header(name.as_str(), value.as_str());
            }
        }
        if let Some(data) = body {
            req = req.body(data);
        }

        debug!("Sending {} request to {}", method, request.url);
        Ok(req.send().await?)
    }

    async fn error_from(&self, response: Response, container: &str, artifact: &str) -> StorageError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let body: ErrorBody = if text.trim().is_empty() {
            ErrorBody::default()
        } else {
            quick_xml::de::from_str(&text).unwrap_or_default()
        };

        if body.code == "NoSuchBucket" {
            return StorageError::Configuration(format!(
                "{}: bucket {} does not exist",
                self.config.name, self.config.bucket
            ));
        }
        if status == StatusCode::NOT_FOUND || body.code == "NoSuchKey" {
            return StorageError::not_found(container, artifact);
        }
        let detail = match (body.code.is_empty(), body.message.is_empty()) {
            (true, _) => status.to_string(),
            (false, true) => format!("{} {}", status, body.code),
            (false, false) => format!("{} {}: {}", status, body.code, body.message),
        };
        StorageError::backend(&self.config.name, detail)
    }
}

#[async_trait]
impl StorageDriver for S3Driver {
    fn name(&self) -> &str {
        &self.config.name
    }

    #[instrument(skip(self, scope), fields(backend = %self.config.name, request_id = %scope.request_id()))]
    async fn get(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<ByteStream> {
        let key = self.namespace.object_key(scope, container, artifact)?;
        let url = self.url_for(&key)?;
        let response = scope.run(self.send(Method::GET, url, BTreeMap::new(), None)).await?;
        if !response.status().is_success() {
            return Err(self.error_from(response, container, artifact).await);
        }
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(StorageError::from))
            .boxed())
    }

    #[instrument(skip(self, scope, body, options), fields(backend = %self.config.name, request_id = %scope.request_id()))]
    async fn put(
        &self,
        scope: &RequestScope,
        container: &str,
        artifact: &str,
        body: ByteStream,
        options: &PutOptions,
    ) -> Result<()> {
        let key = self.namespace.object_key(scope, container, artifact)?;
        let url = self.url_for(&key)?;
        let data = scope.run(stream::collect(body)).await?;

        let mut headers = BTreeMap::new();
        headers.insert("content-md5".to_string(), content_md5(&data));
        let content_headers = [
            ("content-type", &options.content_type),
            ("cache-control", &options.cache_control),
            ("content-encoding", &options.content_encoding),
            ("content-language", &options.content_language),
        ];
        for (name, value) in content_headers {
            if let Some(value) = value {
                headers.insert(name.to_string(), value.clone());
            }
        }
        for (k, v) in &options.user_metadata {
            headers.insert(format!("x-amz-meta-{}", k.to_ascii_lowercase()), v.clone());
        }

        let response = scope.run(self.send(Method::PUT, url, headers, Some(data))).await?;
        if !response.status().is_success() {
            return Err(self.error_from(response, container, artifact).await);
        }
        Ok(())
    }

    #[instrument(skip(self, scope), fields(backend = %self.config.name, request_id = %scope.request_id()))]
    async fn delete(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<()> {
        let key = self.namespace.object_key(scope, container, artifact)?;
        let url = self.url_for(&key)?;
        let response = scope.run(self.send(Method::DELETE, url, BTreeMap::new(), None)).await?;
        if response.status().is_success() {
            return Ok(());
        }
        match self.error_from(response, container, artifact).await {
            StorageError::NotFound { .. } => Ok(()),
            e => Err(e),
        }
    }

    #[instrument(skip(self, scope), fields(backend = %self.config.name, request_id = %scope.request_id()))]
    async fn list(&self, scope: &RequestScope, container: &str, prefix: &str) -> Result<Vec<String>> {
        let container_prefix = self.namespace.container_prefix(scope, container)?;
        let full_prefix = format!("{}{}", container_prefix, prefix);
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut url = self.url_for("")?;
            let mut query = format!(
                "list-type=2&prefix={}",
                uri_encode(&full_prefix)
            );
            if let Some(token) = &continuation {
                query.push_str("&continuation-token=");
                query.push_str(&uri_encode(token));
            }
            url.set_query(Some(&query));

            let response = scope.run(self.send(Method::GET, url, BTreeMap::new(), None)).await?;
            if !response.status().is_success() {
                return Err(match self.error_from(response, container, prefix).await {
                    // Missing bucket
                    StorageError::NotFound { .. } => {
                        StorageError::backend(&self.config.name, "bucket not found")
                    }
                    e => e,
                });
            }
            let text = response.text().await?;
            let page: ListBucketResult = quick_xml::de::from_str(&text)?;

            keys.extend(
                page.contents
                    .iter()
                    .filter_map(|entry| TenantNamespace::strip(&container_prefix, &entry.key))
                    .map(str::to_string),
            );

            match (page.is_truncated, page.next_continuation_token) {
                (true, Some(token)) => continuation = Some(token),
                _ => break,
            }
        }

        Ok(keys)
    }

    #[instrument(skip(self, scope), fields(backend = %self.config.name, request_id = %scope.request_id()))]
    async fn exists(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<bool> {
        let key = self.namespace.object_key(scope, container, artifact)?;
        let url = self.url_for(&key)?;
        let response = scope.run(self.send(Method::HEAD, url, BTreeMap::new(), None)).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(self.error_from(response, container, artifact).await),
        }
    }

    async fn health_check(&self, scope: &RequestScope) -> Result<()> {
        let url = self.url_for("")?;
        let response = scope.run(self.send(Method::HEAD, url, BTreeMap::new(), None)).await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(StorageError::backend(
            &self.config.name,
            format!("bucket {} unhealthy: {}", self.config.bucket, response.status()),
        ))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            user_metadata: true,
            content_headers: true,
            streaming_upload: false,
            server_side_listing: true,
        }
    }
}
