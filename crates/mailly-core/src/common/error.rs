//! Error types for the batch mail service.
//!
//! This module defines the central `Error` enum, which captures all recoverable
//! and reportable error cases within the dispatch pipeline. It implements
//! [`IntoResponse`] so request-level failures map straight onto an HTTP status
//! and a `{"error": "..."}` JSON body.
//!
//! ## Error Cases
//! - `MalformedBody`: The request body was not a JSON array of messages.
//! - `InvalidRequest`: The batch was empty, too large, or an item failed
//!   validation.
//! - `ServiceShutdown`: A request arrived while the service was shutting down.
//! - `Streaming`: The streaming response could not be set up.
//! - `Transport`: A delivery connection could not be opened or closed.
//! - `Delivery`: A single message was rejected or could not be written.
//! - `Timeout`: A delivery attempt exceeded the configured send timeout.
//!
//! Only the first four ever reach a client as an HTTP status. The remaining
//! variants stay inside the worker pool and surface as per-item
//! [`DeliveryResult`](crate::types::DeliveryResult) details.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use core::time::Duration;
use serde::Serialize;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the batch mail service.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The request body could not be decoded.
    #[error("Invalid JSON format")]
    MalformedBody,

    /// The batch was rejected before any worker was started.
    #[error("{reason}")]
    InvalidRequest { reason: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// The response stream could not be constructed.
    #[error("Streaming unsupported: {context}")]
    Streaming { context: String },

    /// Opening, authenticating or closing a delivery session failed.
    #[error("Transport error: {context}")]
    Transport { context: String },

    /// The delivery endpoint refused the message or the write failed.
    #[error("{context}")]
    Delivery { context: String },

    /// The delivery attempt did not finish in time.
    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn transport(context: impl ToString) -> Self {
        Self::Transport {
            context: context.to_string(),
        }
    }

    pub fn delivery(context: impl ToString) -> Self {
        Self::Delivery {
            context: context.to_string(),
        }
    }

    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedBody | Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::ServiceShutdown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Streaming { .. } | Self::Transport { .. } | Self::Delivery { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// JSON body attached to every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
