//! Webhook subscription (registration) model.
//!
//! This is the engine's immutable view of a registration between updates.
//! The registry validates and persists registrations elsewhere; here the
//! model only needs to round-trip through JSON (it is embedded, redacted,
//! in cut-off notifications) and to carry the fields admission and
//! delivery read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder written over the shared secret wherever the registration
/// leaves the engine.
pub const REDACTED_SECRET: &str = "XxxxxX";

/// Where and how events are delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Primary delivery URL; doubles as the subscription id.
    pub url: String,

    /// Preferred content type. `"wrp"` and the msgpack/WRP MIME types
    /// request re-encoding of the whole envelope.
    #[serde(default)]
    pub content_type: String,

    /// Shared secret for HMAC-SHA1 signing; empty disables signing.
    #[serde(default)]
    pub secret: String,

    /// Ordered alternative delivery URLs. When present they replace the
    /// primary URL in the rotation ring.
    #[serde(default)]
    pub alternative_urls: Vec<String>,
}

/// Source-matching block of a registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Regexes matched against the event source. A literal `".*"` entry
    /// collapses the list to match-all.
    #[serde(default)]
    pub device_id: Vec<String>,
}

/// A webhook registration as the registry hands it to the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Delivery endpoint configuration.
    pub config: DeliveryConfig,

    /// Regexes matched against event destinations; must be non-empty.
    #[serde(default)]
    pub events: Vec<String>,

    /// Device matcher block.
    #[serde(default)]
    pub matcher: MatcherConfig,

    /// Absolute URL notified when the subscriber is cut off; empty
    /// disables notifications.
    #[serde(default)]
    pub failure_url: String,

    /// End of the delivery window; events arriving at or after this
    /// instant are rejected.
    #[serde(default)]
    pub until: DateTime<Utc>,

    /// Partner ids this subscriber may receive events for.
    #[serde(default)]
    pub partner_ids: Vec<String>,
}

impl Subscription {
    /// A copy safe to embed in notifications: the secret is replaced with
    /// a fixed placeholder.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.config.secret = REDACTED_SECRET.to_string();
        copy
    }
}
