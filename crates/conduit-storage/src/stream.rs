//! Byte streams flowing through the storage contract

use crate::Result;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};

/// Object payload as a stream of chunks
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Stream a single buffer
pub fn from_bytes(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    if data.is_empty() {
        return empty();
    }
    stream::once(async move { Ok(data) }).boxed()
}

/// Stream a list of chunks
pub fn from_chunks(chunks: Vec<Bytes>) -> ByteStream {
    stream::iter(chunks.into_iter().map(Ok)).boxed()
}

/// Stream `data` in slices of at most `chunk_size` bytes (zero-copy)
pub fn chunked(data: Bytes, chunk_size: usize) -> ByteStream {
    let chunk_size = chunk_size.max(1);
    let chunks: Vec<Bytes> = (0..data.len())
        .step_by(chunk_size)
        .map(|start| data.slice(start..(start + chunk_size).min(data.len())))
        .collect();
    from_chunks(chunks)
}

/// An empty stream
pub fn empty() -> ByteStream {
    stream::empty().boxed()
}

/// Drain a stream into one buffer
pub async fn collect(mut body: ByteStream) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Keep `guard` alive until the stream is dropped
///
/// Used to tie semaphore permits and pooled handles to the lifetime of a
/// returned stream rather than to the call that produced it.
pub fn with_guard<G: Send + 'static>(body: ByteStream, guard: G) -> ByteStream {
    body.map(move |item| {
        let _held = &guard;
        item
    })
    .boxed()
}
