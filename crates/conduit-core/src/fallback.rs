//! Two-backend fallback chain

use async_trait::async_trait;
use conduit_storage::stream::{self, ByteStream};
use conduit_storage::{
    Capabilities, ErrorKind, PutOptions, RequestScope, Result, StorageDriver, StorageError,
    DEFAULT_CHUNK_SIZE,
};
use tracing::{debug, warn};

/// How a chain settles once a link has failed
pub(crate) enum Next {
    /// Give up with this error
    Stop(StorageError),
    /// Try the next link, remembering this error
    Continue(StorageError),
}

/// Classify a link failure
///
/// Cancellation and bad input end the chain; anything else moves on.
pub(crate) fn next_after(error: StorageError) -> Next {
    match error.kind() {
        ErrorKind::Cancelled | ErrorKind::Invalid => Next::Stop(error),
        _ => Next::Continue(error),
    }
}

/// Final error of a chain whose every link failed
///
/// Answers such as `NotFound` propagate verbatim; dependency failures are
/// annotated as exhausted.
pub(crate) fn exhausted(chain: &str, last: StorageError) -> StorageError {
    if last.is_transient() {
        StorageError::AllBackendsFailed {
            chain: chain.to_string(),
            last: Box::new(last),
        }
    } else {
        last
    }
}

/// Capabilities both links support
pub(crate) fn common_capabilities(a: Capabilities, b: Capabilities) -> Capabilities {
    Capabilities {
        user_metadata: a.user_metadata && b.user_metadata,
        content_headers: a.content_headers && b.content_headers,
        streaming_upload: a.streaming_upload && b.streaming_upload,
        server_side_listing: a.server_side_listing && b.server_side_listing,
    }
}

/// Primary/secondary chain
///
/// Reads and writes go to the primary first and to the secondary when the
/// primary fails. Deletes go to both and succeed if either does.
pub struct FallbackDriver<P, S> {
    name: String,
    primary: P,
    secondary: S,
}

impl<P: StorageDriver, S: StorageDriver> FallbackDriver<P, S> {
    pub fn new(primary: P, secondary: S) -> Self {
        let name = format!("fallback({}, {})", primary.name(), secondary.name());
        Self {
            name,
            primary,
            secondary,
        }
    }

    pub fn primary(&self) -> &P {
        &self.primary
    }

    pub fn secondary(&self) -> &S {
        &self.secondary
    }

    fn fall_through(&self, op: &str, error: StorageError) -> Result<StorageError> {
        match next_after(error) {
            Next::Stop(e) => Err(e),
            Next::Continue(e) => {
                debug!(chain = %self.name, op, error = %e, "primary failed, trying secondary");
                Ok(e)
            }
        }
    }
}

#[async_trait]
impl<P: StorageDriver, S: StorageDriver> StorageDriver for FallbackDriver<P, S> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<ByteStream> {
        match self.primary.get(scope, container, artifact).await {
            Ok(body) => return Ok(body),
            Err(e) => self.fall_through("get", e)?,
        };
        self.secondary
            .get(scope, container, artifact)
            .await
            .map_err(|e| exhausted(&self.name, e))
    }

    async fn put(
        &self,
        scope: &RequestScope,
        container: &str,
        artifact: &str,
        body: ByteStream,
        options: &PutOptions,
    ) -> Result<()> {
        let data = scope.run(stream::collect(body)).await?;
        let replay = || stream::chunked(data.clone(), DEFAULT_CHUNK_SIZE);

        match self.primary.put(scope, container, artifact, replay(), options).await {
            Ok(()) => return Ok(()),
            Err(e) => self.fall_through("put", e)?,
        };
        self.secondary
            .put(scope, container, artifact, replay(), options)
            .await
            .map_err(|e| exhausted(&self.name, e))
    }

    async fn delete(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<()> {
        let primary = self.primary.delete(scope, container, artifact).await;
        if let Err(e) = &primary {
            if e.is_cancellation() {
                return primary;
            }
        }
        let secondary = self.secondary.delete(scope, container, artifact).await;

        match (primary, secondary) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(e)) | (Err(e), Ok(())) => {
                warn!(chain = %self.name, container, artifact, error = %e, "best-effort delete failed on one link");
                Ok(())
            }
            (Err(_), Err(e)) => Err(exhausted(&self.name, e)),
        }
    }

    async fn list(&self, scope: &RequestScope, container: &str, prefix: &str) -> Result<Vec<String>> {
        match self.primary.list(scope, container, prefix).await {
            Ok(keys) => return Ok(keys),
            Err(e) => self.fall_through("list", e)?,
        };
        self.secondary
            .list(scope, container, prefix)
            .await
            .map_err(|e| exhausted(&self.name, e))
    }

    async fn exists(&self, scope: &RequestScope, container: &str, artifact: &str) -> Result<bool> {
        let primary = match self.primary.exists(scope, container, artifact).await {
            Ok(true) => return Ok(true),
            Ok(false) => None,
            Err(e) => Some(self.fall_through("exists", e)?),
        };
        match self.secondary.exists(scope, container, artifact).await {
            Ok(found) => Ok(found),
            Err(e) if e.is_cancellation() => Err(e),
            // The primary answered; a failing secondary does not change that
            Err(_) if primary.is_none() => Ok(false),
            Err(e) => Err(exhausted(&self.name, e)),
        }
    }

    async fn health_check(&self, scope: &RequestScope) -> Result<()> {
        match self.primary.health_check(scope).await {
            Ok(()) => return Ok(()),
            Err(e) => self.fall_through("health_check", e)?,
        };
        self.secondary
            .health_check(scope)
            .await
            .map_err(|e| exhausted(&self.name, e))
    }

    fn capabilities(&self) -> Capabilities {
        common_capabilities(self.primary.capabilities(), self.secondary.capabilities())
    }
}
