//! Dropbox storage driver
//!
//! Consumer-drive adapter over the Dropbox HTTP API v2. Content transfers
//! go to the content host with the call arguments in the `Dropbox-API-Arg`
//! header; metadata calls are JSON RPCs on the API host.

use crate::stream::{self, ByteStream};
use crate::{
    Capabilities, PutOptions, RequestScope, Result, StorageDriver, StorageError, TenantNamespace,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, instrument};

/// Dropbox driver configuration
#[derive(Clone, Debug)]
pub struct DropboxConfig {
    /// Driver name used in logs and errors
    pub name: String,
    /// OAuth2 bearer token
    pub access_token: String,
    /// Folder holding all tenants
    pub root: String,
    /// RPC host
    pub api_url: String,
    /// Upload/download host
    pub content_url: String,
    /// Request timeout
    pub timeout: Duration,
}

impl DropboxConfig {
    /// Create a new Dropbox config
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            name: "dropbox".to_string(),
            access_token: access_token.into(),
            root: "/conduit".to_string(),
            api_url: "https://api.dropboxapi.com".to_string(),
            content_url: "https://content.dropboxapi.com".to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Set the driver name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the root folder
    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    /// Point both hosts at one base URL
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.api_url = url.clone();
        self.content_url = url;
        self
    }

    /// Set timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Error body of a 409 response
#[derive(Debug, Deserialize)]
struct ApiError {
    error_summary: String,
}

#[derive(Debug, Deserialize)]
struct ListFolderResult {
    entries: Vec<Entry>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct Entry {
    #[serde(rename = ".tag")]
    tag: String,
    #[serde(default)]
    path_display: Option<String>,
}

#[derive(Debug, Serialize)]
struct UploadArg<'a> {
    path: &'a str,
    mode: &'a str,
    autorename: bool,
    mute: bool,
}

/// Serialize a `Dropbox-API-Arg` header value
///
/// HTTP header values must be ASCII, so every non-ASCII character is
/// written as a JSON `\uXXXX` escape (surrogate pairs above the BMP).
pub fn api_arg<T: Serialize>(value: &T) -> Result<String> {
    let raw = serde_json::to_string(value)?;
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    Ok(out)
}

/// Dropbox-backed driver
pub struct DropboxDriver {
    config: DropboxConfig,
    namespace: TenantNamespace,
    http: Client,
}

impl DropboxDriver {
    /// Create a new Dropbox driver
    pub fn new(config: DropboxConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .user_agent(format!("conduit/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            config,
            namespace: TenantNamespace::default(),
            http,
        })
    }

    /// Use a specific tenant namespace
    pub fn with_namespace(mut self, namespace: TenantNamespace) -> Self {
        self.namespace = namespace;
        self
    }

    fn path_of(&self, key: &str) -> String {
        format!("{}/{}", self.config.root.trim_end_matches('/'), key.trim_end_matches('/'))
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.config.access_token)
    }

    async fn rpc(&self, endpoint: &str, body: &serde_json::Value) -> Result<Response> {
        let url = format!("{}/2/{}", self.config.api_url.trim_end_matches('/'), endpoint);
        debug!("Sending RPC to {}", url);
        Ok(self
            .http
            .post(&url)
            .header("Authorization", self.auth_header())
            .json(body)
            .send()
            .await?)
    }

    /// Error summary of a 409; any other response is handed back
    async fn conflict_summary(response: Response) -> std::result::Result<String, Response> {
        if response.status() != StatusCode::CONFLICT {
            return Err(response);
        }
        let text = response.text().await.unwrap_or_default();
        Ok(serde_json::from_str::<ApiError>(&text)
            .map(|e| e.error_summary)
            .unwrap_or(text))
    }

    async fn error_from(&self, response: Response) -> StorageError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ApiError>(&text)
            .map(|e| e.error_summary)
            .unwrap_or(text);
        StorageError::backend(&self.config.name, format!("{}: {}", status, detail.trim()))
    }

    /// Map a failed response, treating `not_found` conflicts as `on_missing`
    async fn check<T>(&self, response: Response, on_missing: impl FnOnce() -> Result<T>) -> Result<Option<Response>> {
        if response.status().is_success() {
            return Ok(Some(response));
        }
        match Self::conflict_summary(response).await {
            Ok(summary) if summary.contains("not_found") => on_missing().map(|_| None),
            Ok(summary) => Err(StorageError::backend(&self.config.name, format!("409 Conflict: {}", summary))),
            Err(response) => Err(self.error_from(response).await),
        }
    }
}

#[async_trait]
impl StorageDriver for DropboxDriver {
    fn name(&self) -> &str {
        &self.config.name
    }

    #[instrument(skip(self, scope), fields(backend = %self.config.name, request_id = %scope.request_id()))]
    async fn get(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<ByteStream> {
        let path = self.path_of(&self.namespace.object_key(scope, container, artifact)?);
        let url = format!("{}/2/files/download", self.config.content_url.trim_end_matches('/'));
        let arg = api_arg(&json!({ "path": path }))?;

        let response = scope
            .run(async {
                Ok(self
                    .http
                    .post(&url)
                    .header("Authorization", self.auth_header())
                    .header("Dropbox-API-Arg", arg)
                    .send()
                    .await?)
            })
            .await?;

        match self
            .check(response, || Err::<(), _>(StorageError::not_found(container, artifact)))
            .await?
        {
            Some(response) => Ok(response
                .bytes_stream()
                .map(|chunk| chunk.map_err(StorageError::from))
                .boxed()),
            None => Err(StorageError::not_found(container, artifact)),
        }
    }

    #[instrument(skip(self, scope, body, _options), fields(backend = %self.config.name, request_id = %scope.request_id()))]
    async fn put(
        &self,
        scope: &RequestScope,
        container: &str,
        artifact: &str,
        body: ByteStream,
        _options: &PutOptions,
    ) -> Result<()> {
        let path = self.path_of(&self.namespace.object_key(scope, container, artifact)?);
        let url = format!("{}/2/files/upload", self.config.content_url.trim_end_matches('/'));
        let arg = api_arg(&UploadArg {
            path: &path,
            mode: "overwrite",
            autorename: false,
            mute: true,
        })?;
        let data = scope.run(stream::collect(body)).await?;

        let response = scope
            .run(async {
                Ok(self
                    .http
                    .post(&url)
                    .header("Authorization", self.auth_header())
                    .header("Dropbox-API-Arg", arg)
                    .header("Content-Type", "application/octet-stream")
                    .body(data)
                    .send()
                    .await?)
            })
            .await?;

        if response.status().is_success() {
            return Ok(());
        }
        Err(self.error_from(response).await)
    }

    #[instrument(skip(self, scope), fields(backend = %self.config.name, request_id = %scope.request_id()))]
    async fn delete(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<()> {
        let path = self.path_of(&self.namespace.object_key(scope, container, artifact)?);
        let response = scope.run(self.rpc("files/delete_v2", &json!({ "path": path }))).await?;
        self.check(response, || Ok(())).await?;
        Ok(())
    }

    #[instrument(skip(self, scope), fields(backend = %self.config.name, request_id = %scope.request_id()))]
    async fn list(&self, scope: &RequestScope, container: &str, prefix: &str) -> Result<Vec<String>> {
        let folder = self.path_of(&self.namespace.container_prefix(scope, container)?);
        let folder_prefix = format!("{}/", folder);
        let mut keys = Vec::new();

        let mut response = scope
            .run(self.rpc("files/list_folder", &json!({ "path": folder, "recursive": true })))
            .await?;
        loop {
            let page: ListFolderResult = match self.check(response, || Ok(())).await? {
                Some(response) => response.json().await?,
                None => return Ok(Vec::new()),
            };

            for entry in page.entries.iter().filter(|e| e.tag == "file") {
                let Some(display) = entry.path_display.as_deref() else {
                    continue;
                };
                // Dropbox paths are case-insensitive
                let matches_folder = display
                    .get(..folder_prefix.len())
                    .map(|head| head.eq_ignore_ascii_case(&folder_prefix))
                    .unwrap_or(false);
                if !matches_folder {
                    continue;
                }
                let artifact = &display[folder_prefix.len()..];
                if !artifact.is_empty() && artifact.starts_with(prefix) {
                    keys.push(artifact.to_string());
                }
            }

            if !page.has_more {
                break;
            }
            response = scope
                .run(self.rpc("files/list_folder/continue", &json!({ "cursor": page.cursor })))
                .await?;
        }

        keys.sort();
        Ok(keys)
    }

    #[instrument(skip(self, scope), fields(backend = %self.config.name, request_id = %scope.request_id()))]
    async fn exists(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<bool> {
        let path = self.path_of(&self.namespace.object_key(scope, container, artifact)?);
        let response = scope.run(self.rpc("files/get_metadata", &json!({ "path": path }))).await?;
        match self.check(response, || Ok(())).await? {
            Some(response) => {
                let entry: Entry = response.json().await?;
                Ok(entry.tag == "file")
            }
            None => Ok(false),
        }
    }

    async fn health_check(&self, scope: &RequestScope) -> Result<()> {
        let response = scope
            .run(self.rpc("users/get_current_account", &serde_json::Value::Null))
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(self.error_from(response).await)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            user_metadata: false,
            content_headers: false,
            streaming_upload: false,
            server_side_listing: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TenantId;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn driver(server: &MockServer) -> DropboxDriver {
        DropboxDriver::new(DropboxConfig::new("token").with_base_url(server.uri())).unwrap()
    }

    fn scope() -> RequestScope {
        RequestScope::for_tenant(TenantId::new("t1").unwrap())
    }

    fn not_found() -> ResponseTemplate {
        ResponseTemplate::new(409).set_body_json(json!({
            "error_summary": "path/not_found/..",
            "error": { ".tag": "path", "path": { ".tag": "not_found" } }
        }))
    }

    #[test]
    fn test_api_arg_escapes_non_ascii() {
        let arg = api_arg(&json!({ "path": "/conduit/t-a/c/café 🎉.txt" })).unwrap();
        assert!(arg.is_ascii());
        assert!(arg.contains("caf\\u00e9"));
        assert!(arg.contains("\\ud83c\\udf89"));
        let back: serde_json::Value = serde_json::from_str(&arg).unwrap();
        assert_eq!(back["path"], "/conduit/t-a/c/café 🎉.txt");
    }

    #[tokio::test]
    async fn test_upload_and_download() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/files/upload"))
            .and(header("authorization", "Bearer token"))
            .and(|req: &Request| {
                req.headers.get("dropbox-api-arg").and_then(|v| v.to_str().ok())
                    == Some(r#"{"path":"/conduit/t-t1/photos/a.jpg","mode":"overwrite","autorename":false,"mute":true}"#)
            })
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "a.jpg" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/files/download"))
            .and(header("dropbox-api-arg", r#"{"path":"/conduit/t-t1/photos/a.jpg"}"#))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"pixels".to_vec()))
            .mount(&server)
            .await;

        let driver = driver(&server);
        driver
            .put(&scope(), "photos", "a.jpg", stream::from_bytes("pixels"), &PutOptions::default())
            .await
            .unwrap();
        let body = driver.get(&scope(), "photos", "a.jpg").await.unwrap();
        assert_eq!(stream::collect(body).await.unwrap().as_ref(), b"pixels");
    }

    #[tokio::test]
    async fn test_tenant_case_folds_to_one_folder() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/files/download"))
            .and(header("dropbox-api-arg", r#"{"path":"/conduit/t-acme/c/secret.txt"}"#))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"mine".to_vec()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/files/list_folder"))
            .and(body_json(json!({ "path": "/conduit/t-acme/c", "recursive": true })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "entries": [
                    { ".tag": "file", "path_display": "/conduit/t-Acme/c/secret.txt" }
                ],
                "cursor": "c1",
                "has_more": false
            })))
            .expect(1)
            .mount(&server)
            .await;

        let driver = driver(&server);
        let upper = RequestScope::for_tenant(TenantId::new("Acme").unwrap());
        let lower = RequestScope::for_tenant(TenantId::new("acme").unwrap());
        let body = driver.get(&upper, "c", "secret.txt").await.unwrap();
        assert_eq!(stream::collect(body).await.unwrap().as_ref(), b"mine");
        assert_eq!(driver.list(&lower, "c", "").await.unwrap(), vec!["secret.txt"]);

        // A different tenant never shares the folder
        let other = RequestScope::for_tenant(TenantId::new("acme2").unwrap());
        assert_ne!(
            driver.namespace.container_prefix(&other, "c").unwrap(),
            driver.namespace.container_prefix(&lower, "c").unwrap()
        );
    }

    #[tokio::test]
    async fn test_not_found_conflicts() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(not_found()).mount(&server).await;

        let driver = driver(&server);
        assert!(matches!(
            driver.get(&scope(), "photos", "gone").await,
            Err(StorageError::NotFound { .. })
        ));
        driver.delete(&scope(), "photos", "gone").await.unwrap();
        assert!(!driver.exists(&scope(), "photos", "gone").await.unwrap());
        assert!(driver.list(&scope(), "photos", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_other_conflicts_are_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(409).set_body_json(json!({ "error_summary": "path/insufficient_space/." })),
            )
            .mount(&server)
            .await;

        let err = driver(&server).delete(&scope(), "photos", "a").await.unwrap_err();
        assert!(err.to_string().contains("insufficient_space"));
    }

    #[tokio::test]
    async fn test_list_pages_and_strips_folder() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/files/list_folder"))
            .and(body_json(json!({ "path": "/conduit/t-t1/photos", "recursive": true })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "entries": [
                    { ".tag": "folder", "path_display": "/conduit/t-t1/photos/2024" },
                    { ".tag": "file", "path_display": "/Conduit/t-t1/photos/2024/A.jpg" }
                ],
                "cursor": "c1",
                "has_more": true
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/files/list_folder/continue"))
            .and(body_json(json!({ "cursor": "c1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "entries": [
                    { ".tag": "file", "path_display": "/conduit/t-t1/photos/b.jpg" }
                ],
                "cursor": "c2",
                "has_more": false
            })))
            .expect(1)
            .mount(&server)
            .await;

        let driver = driver(&server);
        assert_eq!(
            driver.list(&scope(), "photos", "").await.unwrap(),
            vec!["2024/A.jpg", "b.jpg"]
        );
    }

    #[tokio::test]
    async fn test_exists_checks_tag() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/files/get_metadata"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                ".tag": "file", "name": "a.jpg", "path_display": "/conduit/t-t1/photos/a.jpg"
            })))
            .mount(&server)
            .await;

        assert!(driver(&server).exists(&scope(), "photos", "a.jpg").await.unwrap());
    }

    #[tokio::test]
    async fn test_health_and_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/users/get_current_account"))
            .respond_with(ResponseTemplate::new(401).set_body_string(r#"{"error_summary": "invalid_access_token/"}"#))
            .mount(&server)
            .await;

        let err = driver(&server).health_check(&RequestScope::new()).await.unwrap_err();
        assert!(err.to_string().contains("invalid_access_token"));
    }
}
