//! Result streaming to the HTTP client.
//!
//! - [`emitter`] - turns the result channel into SSE frames on a writer.
//! - [`buffer`] - pooled scratch buffers used while encoding frames.
//! - [`body`] - the duplex pipe and response body that carry frames to axum.

pub mod body;
pub mod buffer;
pub mod emitter;
