//! WRP-style event envelope accepted for delivery.
//!
//! Events arrive from the ingestion layer already routed; the engine only
//! inspects the envelope (destination, source, partner IDs) to decide
//! admission, and either forwards the payload verbatim or re-encodes the
//! whole envelope as msgpack when the subscriber asked for WRP.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Canonical binary encoding of the event envelope.
pub const MSGPACK_MIME: &str = "application/msgpack";
/// Alias some registrations use to request the binary envelope.
pub const WRP_MIME: &str = "application/wrp";
/// Content type of the cut-off notification body.
pub const JSON_MIME: &str = "application/json";
/// Fallback when an event carries no content type of its own.
pub const OCTET_STREAM_MIME: &str = "application/octet-stream";

/// Message-type discriminant of a simple event in the envelope encoding.
pub const SIMPLE_EVENT_TYPE: u8 = 4;

/// Scheme prefix stripped from destinations before matching and header
/// derivation.
pub const EVENT_PREFIX: &str = "event:";

/// A routed event handed to the engine by the ingestion layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event destination locator, usually `event:<name>/<path>`.
    #[serde(rename = "dest")]
    pub destination: String,

    /// Source device locator, e.g. `mac:112233445566/service`.
    pub source: String,

    /// Transaction correlation id, propagated onto request headers.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub transaction_uuid: String,

    /// Content type of `payload` as declared by the producer.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,

    /// Partner ids the event was admitted under.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partner_ids: Vec<String>,

    /// Envelope metadata, forwarded as request headers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,

    /// Opaque payload bytes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
}

impl Event {
    /// The destination with any `event:` scheme prefix removed.
    #[must_use]
    pub fn stripped_destination(&self) -> &str {
        self.destination
            .strip_prefix(EVENT_PREFIX)
            .unwrap_or(&self.destination)
    }

    /// Short event name used as a metric label: the first destination
    /// segment after the `event:` prefix, or `"unknown"` when the
    /// destination is not an event locator.
    #[must_use]
    pub fn short_name(&self) -> &str {
        match self.destination.strip_prefix(EVENT_PREFIX) {
            Some(rest) => rest.split('/').next().unwrap_or("unknown"),
            None => "unknown",
        }
    }

    /// Re-encode the whole envelope as msgpack.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be serialized.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }
}

/// Whether a subscription content type asks for the msgpack envelope
/// instead of the raw payload.
#[must_use]
pub fn requests_msgpack(content_type: &str) -> bool {
    matches!(content_type, "wrp" | MSGPACK_MIME | WRP_MIME)
}
