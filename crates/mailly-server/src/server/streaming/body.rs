//! Streaming HTTP response body for a batch.
//!
//! The dispatcher writes SSE frames into one half of an in-memory duplex pipe;
//! the other half is exposed to axum as the response body. Dropping the body,
//! which hyper does when the client disconnects, cancels the batch token.

use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use core::{
    pin::Pin,
    task::{Context, Poll},
};
use futures::Stream;
use pin_project_lite::pin_project;
use tokio::io::{DuplexStream, duplex};
use tokio_util::{
    io::ReaderStream,
    sync::{CancellationToken, DropGuard},
};

/// Bytes buffered between the dispatcher and hyper before writes wait.
pub const PIPE_CAPACITY: usize = 64 * 1024;

pin_project! {
    /// Wraps a body stream and cancels a token when it is dropped.
    pub struct CancelOnDrop<S> {
        #[pin]
        inner: S,
        guard: DropGuard,
    }
}

impl<S> CancelOnDrop<S> {
    pub fn new(inner: S, token: CancellationToken) -> Self {
        Self {
            inner,
            guard: token.drop_guard(),
        }
    }
}

impl<S: Stream> Stream for CancelOnDrop<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Body stream handed to axum.
pub type EventStream = CancelOnDrop<ReaderStream<DuplexStream>>;

/// Creates the write half the dispatcher streams into and the body that
/// carries it to the client. `cancel` fires when the body is dropped.
pub fn event_pipe(cancel: CancellationToken) -> (DuplexStream, EventStream) {
    let (writer, reader) = duplex(PIPE_CAPACITY);
    (writer, CancelOnDrop::new(ReaderStream::new(reader), cancel))
}

/// Builds the `200 text/event-stream` response around `stream`.
///
/// # Errors
///
/// Fails only if the response headers cannot be assembled.
pub fn event_stream_response<S>(stream: S) -> axum::http::Result<Response>
where
    S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
{
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"))
        .header(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"))
        .header(header::CONNECTION, HeaderValue::from_static("keep-alive"))
        .body(Body::from_stream(stream))
}
