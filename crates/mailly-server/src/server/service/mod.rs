//! HTTP service implementation.
//!
//! This module contains the client-facing request handling: decoding and
//! validating batches, starting a dispatch per batch and streaming its
//! results, and coordinating graceful shutdown.
//!
//! ## Structure
//!
//! - [`handler`] - axum routes and the shared `BatchService` state.

pub mod handler;
