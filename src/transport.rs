//! Injected dependencies: the HTTP executor seam and the clock.
//!
//! The engine never owns a connection pool; the host hands it something
//! that can execute a request. Tests script that seam directly, and every
//! time comparison goes through the injected clock so the windows are
//! controllable.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Request, Response};

use crate::error::TransportError;

/// Executes one outbound HTTP request.
///
/// Connection reuse depends on response bodies being fully drained before
/// drop; the engine guarantees that on every path.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute the request and return the response.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when the request could not be
    /// completed at the connection level. HTTP error statuses are
    /// responses, not errors.
    async fn execute(&self, request: Request) -> Result<Response, TransportError>;
}

#[async_trait]
impl Transport for reqwest::Client {
    async fn execute(&self, request: Request) -> Result<Response, TransportError> {
        Ok(reqwest::Client::execute(self, request).await?)
    }
}

/// Source of the current instant. Injected so every time-window check is
/// testable; defaults to the wall clock.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The default clock.
#[must_use]
pub fn wall_clock() -> Clock {
    Arc::new(Utc::now)
}
