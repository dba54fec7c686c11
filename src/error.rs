//! Typed error handling for the delivery engine.
//!
//! Validation failures are surfaced to the caller and leave the sender on
//! its previous state; everything that happens after an event is accepted
//! terminates in an outcome counter instead of an error.

use thiserror::Error;

/// Errors from applying a new subscription to a running sender.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The failure URL does not parse.
    #[error("invalid failure url '{url}': {source}")]
    InvalidFailureUrl {
        url: String,
        source: url::ParseError,
    },

    /// An event pattern does not compile.
    #[error("invalid event pattern '{pattern}': {source}")]
    InvalidEventPattern {
        pattern: String,
        source: regex::Error,
    },

    /// The registration carries no event patterns at all.
    #[error("events must not be empty")]
    EmptyEvents,

    /// A device matcher entry does not compile.
    #[error("invalid device matcher '{pattern}': {source}")]
    InvalidDeviceMatcher {
        pattern: String,
        source: regex::Error,
    },

    /// An alternative delivery URL does not parse.
    #[error("invalid alternative url '{url}': {source}")]
    InvalidAlternativeUrl {
        url: String,
        source: url::ParseError,
    },
}

/// Errors from constructing a sender.
#[derive(Debug, Error)]
pub enum FactoryError {
    /// The primary delivery URL does not parse.
    #[error("invalid receiver url '{url}': {source}")]
    InvalidReceiverUrl {
        url: String,
        source: url::ParseError,
    },

    /// No HTTP transport was supplied.
    #[error("a transport is required")]
    MissingTransport,

    /// The overflow drop window must be a positive duration.
    #[error("cut-off period must be greater than zero")]
    InvalidCutOffPeriod,

    /// The worker pool must admit at least one in-flight delivery.
    #[error("worker pool must have at least one worker")]
    NoWorkers,

    /// The queue must buffer at least one event.
    #[error("queue capacity must be at least one")]
    ZeroQueueCapacity,

    /// The initial subscription failed validation.
    #[error(transparent)]
    Update(#[from] UpdateError),
}

/// Errors crossing the injected HTTP transport seam.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying client failed to execute the request.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Connection-level failure reported by a non-reqwest executor.
    #[error("connection failed: {0}")]
    Connection(String),
}
