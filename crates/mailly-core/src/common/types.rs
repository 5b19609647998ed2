//! # Batch Wire Types
//!
//! Shared request and result types exchanged between the HTTP layer, the
//! dispatcher and the workers. They double as the JSON contract with clients:
//!
//! - [`MessageRequest`] - one element of the inbound JSON array.
//! - [`DeliveryResult`] - one outbound streaming event.
//! - [`DeliveryStatus`] - the per-item outcome carried by a result.
//!
//! Field names follow the established wire format (`sent_to`, `message`,
//! `product_name` in, `email`/`status`/`error` out). A few aliases are accepted
//! on input so that older clients keep working.

use serde::{Deserialize, Serialize};

/// Display name used in the `From` header when neither the client nor the
/// server configuration supplies one.
pub const DEFAULT_SENDER_NAME: &str = "Mailly";

/// A single outbound message, as decoded from the batch request body.
///
/// Once validated, a request is immutable. Ownership moves from the
/// dispatcher to exactly one worker through the job channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRequest {
    /// Recipient address. Must be email-shaped.
    #[serde(rename = "sent_to", alias = "email", alias = "to")]
    pub recipient: String,

    #[serde(default)]
    pub subject: String,

    /// Message body, sent as HTML.
    #[serde(rename = "message", alias = "body", default)]
    pub body: String,

    /// Display name placed in front of the sender address. Blank values are
    /// replaced with the configured default during validation.
    #[serde(
        rename = "product_name",
        alias = "sender_name",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub sender_name: String,
}

impl MessageRequest {
    pub fn new(
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
            sender_name: String::new(),
        }
    }

    #[must_use]
    pub fn with_sender_name(mut self, sender_name: impl Into<String>) -> Self {
        self.sender_name = sender_name.into();
        self
    }
}

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Success,
    Failed,
}

/// The per-item report streamed back to the client.
///
/// Exactly one result is created per [`MessageRequest`]. `error` is present
/// if and only if `status` is [`DeliveryStatus::Failed`]; the constructors
/// are the only way to build one so the pairing cannot drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    #[serde(rename = "email")]
    pub recipient: String,
    pub status: DeliveryStatus,
    #[serde(rename = "error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryResult {
    pub fn success(recipient: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            status: DeliveryStatus::Success,
            error: None,
        }
    }

    pub fn failed(recipient: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            status: DeliveryStatus::Failed,
            error: Some(error.into()),
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self.status, DeliveryStatus::Success)
    }
}
