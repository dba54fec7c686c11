//! Scriptable mock transport and clock for exercising delivery
//! scenarios without a network.
#![allow(dead_code)] // Test utility module - not all methods used in every test

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier::{
    Clock, DeliveryConfig, Event, MatcherConfig, Subscription, Transport, TransportError,
};
use parking_lot::Mutex;
use reqwest::{Body, Request, Response};
use tokio::sync::Semaphore;

/// What the mock answers a request with.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Respond with the given status and an empty body.
    Status(u16),
    /// Fail at the connection level.
    Error(String),
}

/// One request as the transport observed it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub headers: reqwest::header::HeaderMap,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

struct Gate {
    semaphore: Arc<Semaphore>,
    url_fragment: String,
}

/// Scriptable HTTP executor standing in for the shared client.
pub struct MockTransport {
    replies: Mutex<VecDeque<MockReply>>,
    default_reply: MockReply,
    requests: Mutex<Vec<RecordedRequest>>,
    gate: Option<Gate>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTransport {
    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder::new()
    }

    /// All requests observed so far, in arrival order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Requests currently inside `execute`.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// High-water mark of concurrent `execute` calls.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, request: Request) -> Result<Response, TransportError> {
        let url = request.url().to_string();
        let body = request
            .body()
            .and_then(Body::as_bytes)
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        self.requests.lock().push(RecordedRequest {
            url: url.clone(),
            headers: request.headers().clone(),
            body,
        });

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            if url.contains(&gate.url_fragment) {
                let permit = gate.semaphore.acquire().await.expect("gate never closed");
                permit.forget();
            }
        }

        let reply = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_reply.clone());

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match reply {
            MockReply::Status(code) => {
                let response = http::Response::builder()
                    .status(code)
                    .body(String::new())
                    .expect("valid mock response");
                Ok(Response::from(response))
            }
            MockReply::Error(message) => Err(TransportError::Connection(message)),
        }
    }
}

/// Builder for configuring a [`MockTransport`].
pub struct MockTransportBuilder {
    replies: VecDeque<MockReply>,
    default_reply: MockReply,
    gate: Option<Gate>,
}

impl MockTransportBuilder {
    fn new() -> Self {
        Self {
            replies: VecDeque::new(),
            default_reply: MockReply::Status(200),
            gate: None,
        }
    }

    /// Answer for any request not covered by a scripted reply.
    pub fn with_default_reply(mut self, reply: MockReply) -> Self {
        self.default_reply = reply;
        self
    }

    /// Queue replies consumed one per request, in order.
    pub fn with_replies(mut self, replies: impl IntoIterator<Item = MockReply>) -> Self {
        self.replies.extend(replies);
        self
    }

    /// Block requests whose URL contains `url_fragment` until a permit is
    /// added to `semaphore`. Lets tests hold deliveries in flight.
    pub fn with_gate(mut self, semaphore: Arc<Semaphore>, url_fragment: impl Into<String>) -> Self {
        self.gate = Some(Gate {
            semaphore,
            url_fragment: url_fragment.into(),
        });
        self
    }

    pub fn build(self) -> Arc<MockTransport> {
        Arc::new(MockTransport {
            replies: Mutex::new(self.replies),
            default_reply: self.default_reply,
            requests: Mutex::new(Vec::new()),
            gate: self.gate,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }
}

/// Manually advanced time source.
pub struct MockClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    pub fn at(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    pub fn advance(&self, delta: chrono::Duration) {
        *self.now.lock() += delta;
    }

    pub fn clock(&self) -> Clock {
        let now = Arc::clone(&self.now);
        Arc::new(move || *now.lock())
    }
}

/// A registration delivering to `url` for the given event patterns, open
/// for another hour.
pub fn subscription(url: &str, events: &[&str]) -> Subscription {
    Subscription {
        config: DeliveryConfig {
            url: url.to_string(),
            ..DeliveryConfig::default()
        },
        events: events.iter().map(ToString::to_string).collect(),
        matcher: MatcherConfig::default(),
        failure_url: String::new(),
        until: Utc::now() + chrono::Duration::hours(1),
        partner_ids: vec!["comcast".to_string()],
    }
}

/// A well-formed device event bound for `destination`.
pub fn device_event(destination: &str) -> Event {
    Event {
        destination: destination.to_string(),
        source: "mac:11:22:33:44:55:66/config".to_string(),
        transaction_uuid: "tid-0001".to_string(),
        content_type: "application/json".to_string(),
        partner_ids: vec!["comcast".to_string()],
        metadata: std::collections::BTreeMap::new(),
        payload: br#"{"status":"online"}"#.to_vec(),
    }
}

/// Poll `condition` until it holds or five seconds elapse.
pub async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for {description}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
