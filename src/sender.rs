//! The per-subscriber delivery engine.
//!
//! One [`Sender`] exists per registered webhook, identified by its primary
//! delivery URL. Producers hand admitted events to [`Sender::queue`]; a
//! single dispatcher task drains the bounded queue and fans deliveries out
//! to a semaphore-limited pool of send tasks. When the subscriber cannot
//! keep up the queue overflows, the engine cuts the subscriber off for a
//! configured window, drains the backlog, and notifies the registered
//! failure URL.

use std::{
    mem,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use regex::Regex;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, InvalidHeaderValue, CONTENT_TYPE},
    Body, Method, Request, StatusCode, Url,
};
use serde::{Deserialize, Serialize};
use tokio::{
    runtime::Handle,
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

use crate::{
    device::parse_device_id,
    error::{FactoryError, TransportError, UpdateError},
    event::{requests_msgpack, Event, JSON_MIME, MSGPACK_MIME, OCTET_STREAM_MIME, SIMPLE_EVENT_TYPE},
    metrics::{DropReason, SenderMetrics},
    queue::{EventQueue, PushError},
    signature::sign,
    subscription::Subscription,
    transport::{wall_clock, Clock, Transport},
};

/// Human readable text for the cut-off notification.
const FAILURE_TEXT: &str = "Unfortunately, your endpoint is not able to keep up with the \
traffic being sent to it.  Due to this circumstance, all notification traffic \
is being cut off and dropped for a period of time.  Please increase your \
capacity to handle notifications, or reduce the number of notifications \
you have requested.";

const MSG_TYPE_HEADER: HeaderName = HeaderName::from_static("x-midt-msg-type");
const SOURCE_HEADER: HeaderName = HeaderName::from_static("x-midt-source");
const DESTINATION_HEADER: HeaderName = HeaderName::from_static("x-midt-destination");
const TRANSACTION_UUID_HEADER: HeaderName = HeaderName::from_static("x-midt-transaction-uuid");
const PARTNER_ID_HEADER: HeaderName = HeaderName::from_static("x-midt-partner-id");
const METADATA_HEADER: HeaderName = HeaderName::from_static("x-midt-metadata");
const LEGACY_EVENT_HEADER: HeaderName = HeaderName::from_static("x-webpa-event");
const LEGACY_TRANSACTION_HEADER: HeaderName = HeaderName::from_static("x-webpa-transaction-id");
const LEGACY_DEVICE_ID_HEADER: HeaderName = HeaderName::from_static("x-webpa-device-id");
const LEGACY_DEVICE_NAME_HEADER: HeaderName = HeaderName::from_static("x-webpa-device-name");
const SIGNATURE_HEADER: HeaderName = HeaderName::from_static("x-webpa-signature");

/// Body of the notification POSTed to the failure URL when a subscriber
/// is cut off.
#[derive(Debug, Clone, Serialize)]
pub struct FailureMessage {
    /// Fixed human-readable explanation.
    pub text: String,

    /// The registration this notification is about, secret redacted.
    #[serde(rename = "webhook_registration")]
    pub original: Subscription,

    /// Length of the drop window, rendered as a duration string.
    pub cut_off_period: String,

    /// Configured queue capacity.
    pub queue_size: usize,

    /// Configured delivery concurrency.
    pub worker_count: usize,
}

const fn default_num_workers() -> usize {
    10
}

const fn default_queue_size() -> usize {
    100
}

const fn default_cut_off_period_secs() -> u64 {
    30
}

const fn default_delivery_retries() -> u32 {
    1
}

const fn default_delivery_interval_ms() -> u64 {
    1000
}

fn default_retry_codes() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}

/// Tunables for one sender.
#[derive(Debug, Clone, Deserialize)]
pub struct SenderConfig {
    /// Concurrent in-flight delivery limit.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Events buffered before the subscriber is declared overflowed.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// How long delivery is cut off after an overflow (seconds).
    #[serde(default = "default_cut_off_period_secs")]
    pub cut_off_period_secs: u64,

    /// Additional delivery attempts per event after the first.
    #[serde(default = "default_delivery_retries")]
    pub delivery_retries: u32,

    /// Pause between delivery attempts (milliseconds).
    #[serde(default = "default_delivery_interval_ms")]
    pub delivery_interval_ms: u64,

    /// Response status codes that trigger a retry.
    #[serde(default = "default_retry_codes")]
    pub retry_codes: Vec<u16>,

    /// Partner ids assumed for events that carry none.
    #[serde(default)]
    pub custom_partner_ids: Vec<String>,

    /// Skip the partner-id check entirely.
    #[serde(default)]
    pub disable_partner_ids: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            queue_size: default_queue_size(),
            cut_off_period_secs: default_cut_off_period_secs(),
            delivery_retries: default_delivery_retries(),
            delivery_interval_ms: default_delivery_interval_ms(),
            retry_codes: default_retry_codes(),
            custom_partner_ids: Vec::new(),
            disable_partner_ids: false,
        }
    }
}

impl SenderConfig {
    /// The overflow drop window as a duration.
    #[must_use]
    pub const fn cut_off_period(&self) -> Duration {
        Duration::from_secs(self.cut_off_period_secs)
    }

    /// The pause between delivery attempts as a duration.
    #[must_use]
    pub const fn delivery_interval(&self) -> Duration {
        Duration::from_millis(self.delivery_interval_ms)
    }
}

/// Configurable factory for [`Sender`] instances.
pub struct SenderFactory {
    /// Initial subscription; its primary URL becomes the sender id.
    pub listener: Subscription,

    /// HTTP executor for deliveries and notifications. Required.
    pub transport: Option<Arc<dyn Transport>>,

    /// Time source; wall clock when absent.
    pub clock: Option<Clock>,

    /// Engine tunables.
    pub config: SenderConfig,
}

impl SenderFactory {
    /// Start a factory for the given registration and executor.
    #[must_use]
    pub fn new(listener: Subscription, transport: Arc<dyn Transport>) -> Self {
        Self {
            listener,
            transport: Some(transport),
            clock: None,
            config: SenderConfig::default(),
        }
    }

    /// Construct the sender and spawn its dispatcher.
    ///
    /// # Errors
    ///
    /// Fails when the primary URL does not parse, no transport was
    /// supplied, the cut-off period is zero, the worker pool or queue is
    /// empty, or the initial subscription fails validation.
    ///
    /// # Panics
    ///
    /// Must be called within a tokio runtime; the dispatcher task is
    /// spawned onto the current runtime.
    pub fn build(self) -> Result<Sender, FactoryError> {
        let id = self.listener.config.url.clone();
        Url::parse(&id).map_err(|source| FactoryError::InvalidReceiverUrl {
            url: id.clone(),
            source,
        })?;

        let transport = self.transport.ok_or(FactoryError::MissingTransport)?;

        let config = self.config;
        if config.cut_off_period_secs == 0 {
            return Err(FactoryError::InvalidCutOffPeriod);
        }
        if config.num_workers == 0 {
            return Err(FactoryError::NoWorkers);
        }
        if config.queue_size == 0 {
            return Err(FactoryError::ZeroQueueCapacity);
        }

        let cut_off_period = chrono::Duration::from_std(config.cut_off_period())
            .map_err(|_| FactoryError::InvalidCutOffPeriod)?;

        let failure_message = FailureMessage {
            text: FAILURE_TEXT.to_string(),
            original: self.listener.redacted(),
            cut_off_period: format!("{:?}", config.cut_off_period()),
            queue_size: config.queue_size,
            worker_count: config.num_workers,
        };

        let core = Arc::new(SenderCore {
            id: id.clone(),
            transport,
            clock: self.clock.unwrap_or_else(wall_clock),
            runtime: Handle::current(),
            queue_size: config.queue_size,
            cut_off_period,
            delivery_retries: config.delivery_retries,
            delivery_interval: config.delivery_interval(),
            retry_codes: config.retry_codes,
            max_workers: config.num_workers,
            custom_partner_ids: config.custom_partner_ids,
            disable_partner_ids: config.disable_partner_ids,
            metrics: SenderMetrics::new(id.as_str()),
            workers: Arc::new(Semaphore::new(config.num_workers)),
            cursor: AtomicUsize::new(0),
            queue: RwLock::new(Arc::new(EventQueue::bounded(config.queue_size))),
            state: RwLock::new(SenderState {
                subscription: self.listener.clone(),
                events: Arc::new(Vec::new()),
                matcher: Arc::new(Vec::new()),
                urls: Arc::new(vec![id]),
                deliver_until: self.listener.until,
                drop_until: DateTime::<Utc>::MIN_UTC,
                failure_message,
            }),
        });

        core.metrics.reset_queue_depth();
        core.metrics
            .set_max_workers(u64::try_from(core.max_workers).unwrap_or(u64::MAX));

        core.apply(self.listener)?;

        let dispatcher = tokio::spawn({
            let core = Arc::clone(&core);
            async move { core.run().await }
        });

        Ok(Sender {
            core,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }
}

/// Mutable subscriber state, guarded by one read-write lock.
struct SenderState {
    subscription: Subscription,
    events: Arc<Vec<Regex>>,
    matcher: Arc<Vec<Regex>>,
    urls: Arc<Vec<String>>,
    deliver_until: DateTime<Utc>,
    drop_until: DateTime<Utc>,
    failure_message: FailureMessage,
}

struct SenderCore {
    id: String,
    transport: Arc<dyn Transport>,
    clock: Clock,
    runtime: Handle,
    queue_size: usize,
    cut_off_period: chrono::Duration,
    delivery_retries: u32,
    delivery_interval: Duration,
    retry_codes: Vec<u16>,
    max_workers: usize,
    custom_partner_ids: Vec<String>,
    disable_partner_ids: bool,
    metrics: SenderMetrics,
    workers: Arc<Semaphore>,
    /// URL rotation cursor. Advanced once per dequeue by the dispatcher,
    /// which is its sole writer; send tasks advance private copies.
    cursor: AtomicUsize,
    /// Slot holding the current queue. Producers re-read it on every
    /// enqueue; swapping stores a fresh handle and abandons the old one.
    queue: RwLock<Arc<EventQueue>>,
    state: RwLock<SenderState>,
}

/// The per-subscriber engine handle.
pub struct Sender {
    core: Arc<SenderCore>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender").field("id", &self.core.id).finish()
    }
}

impl Sender {
    /// The subscription id: its canonical primary URL.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// The sender's metric facade.
    #[must_use]
    pub fn metrics(&self) -> &SenderMetrics {
        &self.core.metrics
    }

    /// Evaluate an event against the subscription and enqueue it for
    /// delivery, or drop it. Never fails and never blocks meaningfully.
    pub fn queue(&self, event: Event) {
        self.core.admit(event);
    }

    /// Apply a new subscription in place without restarting the
    /// dispatcher.
    ///
    /// # Errors
    ///
    /// Returns an [`UpdateError`] and leaves the previous configuration
    /// untouched when the registration fails validation.
    pub fn update(&self, subscription: Subscription) -> Result<(), UpdateError> {
        self.core.apply(subscription)
    }

    /// The end of the delivery window; the epoch of the sender's
    /// retirement, possibly in the future.
    #[must_use]
    pub fn retired_since(&self) -> DateTime<Utc> {
        self.core.state.read().deliver_until
    }

    /// Stop the sender. `gentle` drains queued events (respecting the
    /// time windows) before returning; otherwise queued events are
    /// counted as expired and the dispatcher exits promptly. Blocks until
    /// the dispatcher and all in-flight deliveries finish.
    pub async fn shutdown(&self, gentle: bool) {
        if gentle {
            self.core.queue.read().close();
        } else {
            let sealed = Arc::new(EventQueue::sealed(self.core.queue_size));
            let displaced = {
                let mut slot = self.core.queue.write();
                mem::replace(&mut *slot, sealed)
            };
            let abandoned = u64::try_from(displaced.len()).unwrap_or(u64::MAX);
            displaced.close();
            self.core
                .metrics
                .record_dropped_many(DropReason::Expired, abandoned);
            self.core.metrics.reset_queue_depth();
        }

        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.await;
        }

        {
            let mut state = self.core.state.write();
            state.deliver_until = DateTime::<Utc>::MIN_UTC;
            self.core.metrics.set_deliver_until(state.deliver_until);
        }
        self.core.metrics.reset_queue_depth();
    }
}

impl SenderCore {
    /// Admission filter: decide whether the event belongs to this
    /// subscriber and enqueue it. All checks are non-blocking.
    fn admit(&self, event: Event) {
        let (deliver_until, drop_until, events, matcher, allowed_partners) = {
            let state = self.state.read();
            (
                state.deliver_until,
                state.drop_until,
                Arc::clone(&state.events),
                Arc::clone(&state.matcher),
                state.subscription.partner_ids.clone(),
            )
        };

        let now = (self.clock)();
        if !self.is_valid_time_window(now, drop_until, deliver_until) {
            debug!(
                %now,
                drop_until = %drop_until,
                deliver_until = %deliver_until,
                "invalid time window for event"
            );
            return;
        }

        if !self.disable_partner_ids {
            let event_partners: &[String] = if event.partner_ids.is_empty() {
                &self.custom_partner_ids
            } else {
                &event.partner_ids
            };
            if !overlaps(&allowed_partners, event_partners) {
                debug!(
                    webhook.partner_ids = ?allowed_partners,
                    event.partner_ids = ?event_partners,
                    "partner id check failed"
                );
                return;
            }
        }

        let destination = event.stripped_destination();
        if !events.iter().any(|pattern| pattern.is_match(destination)) {
            debug!(
                event.destination = %event.destination,
                "destination regex doesn't match"
            );
            return;
        }

        if !matcher.is_empty() && !matcher.iter().any(|pattern| pattern.is_match(&event.source)) {
            debug!(event.source = %event.source, "device regex doesn't match");
            return;
        }

        let queue = Arc::clone(&*self.queue.read());
        match queue.try_push(event) {
            Ok(()) => {
                self.metrics.add_queue_depth(1);
                debug!("event added to outbound queue");
            }
            Err(PushError::Full) => {
                debug!("queue full, event dropped");
                self.queue_overflow();
                self.metrics.record_dropped(DropReason::QueueFull);
            }
            Err(PushError::Closed) => {
                debug!("queue closed, event dropped");
            }
        }
    }

    fn is_valid_time_window(
        &self,
        now: DateTime<Utc>,
        drop_until: DateTime<Utc>,
        deliver_until: DateTime<Utc>,
    ) -> bool {
        if now <= drop_until {
            // The subscriber is cut off.
            self.metrics.record_dropped(DropReason::CutOff);
            return false;
        }

        if now >= deliver_until {
            // Outside the delivery window.
            self.metrics.record_dropped(DropReason::ExpiredBeforeQueue);
            return false;
        }

        true
    }

    /// Replace the current queue with a fresh open one, counting the
    /// displaced queue's events into `reason`.
    fn swap_queue(&self, reason: DropReason) {
        let fresh = Arc::new(EventQueue::bounded(self.queue_size));
        let displaced = {
            let mut slot = self.queue.write();
            mem::replace(&mut *slot, fresh)
        };
        let abandoned = u64::try_from(displaced.len()).unwrap_or(u64::MAX);
        self.metrics.record_dropped_many(reason, abandoned);
        self.metrics.reset_queue_depth();
    }

    /// The single dispatcher loop. Reloads the queue slot every iteration
    /// so cut-off and shutdown swaps take effect, re-checks the time
    /// windows at dequeue, and blocks on a worker slot before spawning
    /// the send task.
    async fn run(self: Arc<Self>) {
        loop {
            let queue = Arc::clone(&*self.queue.read());
            let Some(event) = queue.pop().await else {
                break;
            };
            self.metrics.add_queue_depth(-1);

            let (urls, secret, accept, deliver_until, drop_until) = {
                let state = self.state.read();
                (
                    Arc::clone(&state.urls),
                    state.subscription.config.secret.clone(),
                    state.subscription.config.content_type.clone(),
                    state.deliver_until,
                    state.drop_until,
                )
            };
            let start = self.cursor.fetch_add(1, Ordering::Relaxed);

            let now = (self.clock)();
            if now < drop_until {
                self.metrics.record_dropped(DropReason::CutOff);
                continue;
            }
            if now >= deliver_until {
                // Everything still queued stalled past the window; drop
                // the batch in one swap.
                self.metrics.record_dropped(DropReason::Expired);
                self.swap_queue(DropReason::Expired);
                continue;
            }

            let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
                break;
            };
            self.metrics.worker_started();

            let task = Arc::clone(&self);
            tokio::spawn(async move {
                task.send(permit, urls, start, secret, accept, event).await;
            });
        }

        // Gather every worker slot so in-flight deliveries finish before
        // the dispatcher returns.
        let permits = u32::try_from(self.max_workers).unwrap_or(u32::MAX);
        let _ = self.workers.acquire_many(permits).await;
    }

    /// One delivery task. The worker slot and gauge are released on every
    /// exit path, including a crash inside the delivery itself.
    async fn send(
        self: Arc<Self>,
        permit: OwnedSemaphorePermit,
        urls: Arc<Vec<String>>,
        start: usize,
        secret: String,
        accept: String,
        event: Event,
    ) {
        let outcome = AssertUnwindSafe(self.deliver(&urls, start, &secret, &accept, &event))
            .catch_unwind()
            .await;
        if outcome.is_err() {
            self.metrics.record_dropped(DropReason::Panic);
            error!(webhook.id = %self.id, "delivery task panicked");
        }
        self.metrics.worker_finished();
        drop(permit);
    }

    /// Build, sign, and execute the delivery with retry and URL
    /// rotation, recording exactly one outcome.
    async fn deliver(&self, urls: &[String], start: usize, secret: &str, accept: &str, event: &Event) {
        let (body, content_type) = if requests_msgpack(accept) {
            match event.to_msgpack() {
                Ok(body) => (body, MSGPACK_MIME.to_string()),
                Err(error) => {
                    error!(webhook.id = %self.id, error = %error, "event could not be re-encoded");
                    self.metrics.record_dropped(DropReason::InvalidConfig);
                    return;
                }
            }
        } else {
            let content_type = if event.content_type.is_empty() {
                OCTET_STREAM_MIME.to_string()
            } else {
                event.content_type.clone()
            };
            (event.payload.clone(), content_type)
        };

        let headers = match build_headers(event, &content_type, secret, &body) {
            Ok(headers) => headers,
            Err(error) => {
                error!(
                    webhook.id = %self.id,
                    error = %error,
                    "delivery headers could not be constructed"
                );
                self.metrics.record_dropped(DropReason::InvalidConfig);
                return;
            }
        };

        let event_name = event.short_name().to_string();
        let mut last: Option<Result<StatusCode, TransportError>> = None;
        let mut position = start;

        let attempts = self.delivery_retries.saturating_add(1);
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.delivery_interval).await;
                self.metrics.record_retry(&event_name);
            }

            let target = &urls[position % urls.len()];
            position = position.wrapping_add(1);

            let url = match Url::parse(target) {
                Ok(url) => url,
                Err(error) => {
                    if attempt == 0 {
                        error!(
                            webhook.id = %self.id,
                            url = %target,
                            error = %error,
                            "invalid delivery url"
                        );
                        self.metrics.record_dropped(DropReason::InvalidConfig);
                        return;
                    }
                    error!(
                        webhook.id = %self.id,
                        url = %target,
                        error = %error,
                        "failed to rotate to url, skipping attempt"
                    );
                    continue;
                }
            };

            let mut request = Request::new(Method::POST, url);
            *request.headers_mut() = headers.clone();
            *request.body_mut() = Some(Body::from(body.clone()));

            debug!(
                event.source = %event.source,
                event.destination = %event.destination,
                url = %target,
                "attempting to send event"
            );

            match self.transport.execute(request).await {
                Ok(response) => {
                    let status = response.status();
                    // Read the body to completion so the connection can
                    // be reused.
                    let _ = response.bytes().await;
                    let retriable = self.retry_codes.contains(&status.as_u16());
                    last = Some(Ok(status));
                    if !retriable {
                        break;
                    }
                }
                Err(error) => {
                    warn!(
                        webhook.id = %self.id,
                        url = %target,
                        error = %error,
                        "delivery attempt failed"
                    );
                    last = Some(Err(error));
                }
            }
        }

        match last {
            Some(Ok(status)) => {
                self.metrics.record_delivery(status.as_str(), &event_name);
                debug!(
                    event.destination = %event.destination,
                    code = status.as_u16(),
                    "event sent"
                );
            }
            Some(Err(error)) => {
                self.metrics.record_dropped(DropReason::NetworkError);
                self.metrics.record_delivery("failure", &event_name);
                warn!(
                    webhook.id = %self.id,
                    error = %error,
                    event.destination = %event.destination,
                    "event delivery failed"
                );
            }
            None => {
                // Every attempt was skipped over a malformed rotation
                // entry.
                self.metrics.record_dropped(DropReason::InvalidConfig);
            }
        }
    }

    /// Overflow protocol: open a drop window, drain the queue, and notify
    /// the failure URL.
    fn queue_overflow(&self) {
        let now = (self.clock)();
        let (secret, failure_url, failure_message) = {
            let mut state = self.state.write();
            if now < state.drop_until {
                // A cut-off is already in effect.
                return;
            }
            state.drop_until = now + self.cut_off_period;
            self.metrics.set_drop_until(state.drop_until);
            (
                state.subscription.config.secret.clone(),
                state.subscription.failure_url.clone(),
                state.failure_message.clone(),
            )
        };

        self.metrics.record_cut_off();
        self.swap_queue(DropReason::CutOff);

        let body = match serde_json::to_vec(&failure_message) {
            Ok(body) => body,
            Err(error) => {
                error!(
                    webhook.id = %self.id,
                    error = %error,
                    "cut-off notification could not be encoded"
                );
                return;
            }
        };

        if failure_url.is_empty() {
            return;
        }

        let transport = Arc::clone(&self.transport);
        let id = self.id.clone();
        self.runtime.spawn(async move {
            deliver_cut_off_notice(transport, id, failure_url, secret, body).await;
        });
    }

    /// Validate and apply a new subscription. Leaves every field
    /// untouched on error; never touches the drop window, the queue, or
    /// the worker pool.
    fn apply(&self, subscription: Subscription) -> Result<(), UpdateError> {
        if !subscription.failure_url.is_empty() {
            Url::parse(&subscription.failure_url).map_err(|source| {
                UpdateError::InvalidFailureUrl {
                    url: subscription.failure_url.clone(),
                    source,
                }
            })?;
        }

        let mut events = Vec::with_capacity(subscription.events.len());
        for pattern in &subscription.events {
            events.push(Regex::new(pattern).map_err(|source| {
                UpdateError::InvalidEventPattern {
                    pattern: pattern.clone(),
                    source,
                }
            })?);
        }
        if events.is_empty() {
            return Err(UpdateError::EmptyEvents);
        }

        let mut matcher = Vec::with_capacity(subscription.matcher.device_id.len());
        for pattern in &subscription.matcher.device_id {
            if pattern == ".*" {
                // Matches everything; skip the filtering entirely.
                matcher.clear();
                break;
            }
            matcher.push(Regex::new(pattern).map_err(|source| {
                UpdateError::InvalidDeviceMatcher {
                    pattern: pattern.clone(),
                    source,
                }
            })?);
        }

        for url in &subscription.config.alternative_urls {
            if let Err(source) = Url::parse(url) {
                error!(webhook.id = %self.id, url = %url, error = %source, "failed to update url");
                return Err(UpdateError::InvalidAlternativeUrl {
                    url: url.clone(),
                    source,
                });
            }
        }

        self.metrics.set_renewal_time((self.clock)());

        let urls = if subscription.config.alternative_urls.is_empty() {
            vec![self.id.clone()]
        } else {
            subscription.config.alternative_urls.clone()
        };
        // Randomize the starting position so instances across a fleet
        // don't synchronize on the same URL.
        let offset = rand::rng().random_range(0..urls.len());

        let mut state = self.state.write();

        state.deliver_until = subscription.until;
        self.metrics.set_deliver_until(state.deliver_until);
        self.metrics
            .set_delivery_retry_max(u64::from(self.delivery_retries));

        state.events = Arc::new(events);
        state.matcher = Arc::new(matcher);
        state.urls = Arc::new(urls);
        self.cursor.store(offset, Ordering::Relaxed);

        state.failure_message.original = subscription.redacted();
        state.subscription = subscription;

        self.metrics
            .set_max_workers(u64::try_from(self.max_workers).unwrap_or(u64::MAX));

        Ok(())
    }
}

/// Fire-and-forget cut-off notification. Errors are logged, never
/// retried.
async fn deliver_cut_off_notice(
    transport: Arc<dyn Transport>,
    id: String,
    failure_url: String,
    secret: String,
    body: Vec<u8>,
) {
    let url = match Url::parse(&failure_url) {
        Ok(url) => url,
        Err(error) => {
            error!(
                webhook.id = %id,
                notification = %failure_url,
                error = %error,
                "unable to send cut-off notification"
            );
            return;
        }
    };

    let mut request = Request::new(Method::POST, url);
    request
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(JSON_MIME));
    if !secret.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&sign(&secret, &body)) {
            request.headers_mut().insert(SIGNATURE_HEADER, value);
        }
    }
    *request.body_mut() = Some(Body::from(body));

    match transport.execute(request).await {
        Ok(response) => {
            // Drain for connection reuse.
            let _ = response.bytes().await;
        }
        Err(error) => {
            error!(
                webhook.id = %id,
                notification = %failure_url,
                error = %error,
                "unable to send cut-off notification"
            );
        }
    }
}

fn build_headers(
    event: &Event,
    content_type: &str,
    secret: &str,
    body: &[u8],
) -> Result<HeaderMap, InvalidHeaderValue> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_str(content_type)?);

    headers.insert(MSG_TYPE_HEADER, HeaderValue::from(u64::from(SIMPLE_EVENT_TYPE)));
    headers.insert(SOURCE_HEADER, HeaderValue::from_str(&event.source)?);
    headers.insert(DESTINATION_HEADER, HeaderValue::from_str(&event.destination)?);
    headers.insert(
        TRANSACTION_UUID_HEADER,
        HeaderValue::from_str(&event.transaction_uuid)?,
    );
    for partner in &event.partner_ids {
        headers.append(PARTNER_ID_HEADER, HeaderValue::from_str(partner)?);
    }
    for (key, value) in &event.metadata {
        headers.append(METADATA_HEADER, HeaderValue::from_str(&format!("{key}={value}"))?);
    }

    headers.insert(
        LEGACY_EVENT_HEADER,
        HeaderValue::from_str(event.stripped_destination())?,
    );
    headers.insert(
        LEGACY_TRANSACTION_HEADER,
        HeaderValue::from_str(&event.transaction_uuid)?,
    );

    // The device id without the trailing service.
    let device = parse_device_id(&event.source).unwrap_or_default();
    headers.insert(LEGACY_DEVICE_ID_HEADER, HeaderValue::from_str(&device)?);
    headers.insert(LEGACY_DEVICE_NAME_HEADER, HeaderValue::from_str(&device)?);

    if !secret.is_empty() {
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&sign(secret, body))?);
    }

    Ok(headers)
}

fn overlaps(first: &[String], second: &[String]) -> bool {
    first.iter().any(|a| second.iter().any(|b| a == b))
}
