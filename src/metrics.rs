//! Per-sender delivery metrics.
//!
//! Every instrument is bound to the subscriber id via a `webhook.id`
//! attribute and recorded against the global OpenTelemetry meter; the
//! exporter pipeline is the host's concern. Hot-path counters are mirrored
//! by atomics so current values can be read without an exporter (tests,
//! admin introspection).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use opentelemetry::{
    metrics::{Counter, Gauge, Meter, UpDownCounter},
    KeyValue,
};

/// Terminal outcome of an accepted event other than delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The queue was full on arrival.
    QueueFull,
    /// The subscriber was inside a cut-off drop window.
    CutOff,
    /// Past the delivery window at or after dequeue.
    Expired,
    /// Past the delivery window on arrival, before queueing.
    ExpiredBeforeQueue,
    /// All delivery attempts failed at the transport level.
    NetworkError,
    /// The delivery request could not be constructed.
    InvalidConfig,
    /// The sender task crashed.
    Panic,
}

impl DropReason {
    /// Metric attribute value for this reason.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::CutOff => "cutoff",
            Self::Expired => "expired",
            Self::ExpiredBeforeQueue => "expired_before_queue",
            Self::NetworkError => "network_error",
            Self::InvalidConfig => "invalid_config",
            Self::Panic => "panic",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::QueueFull => 0,
            Self::CutOff => 1,
            Self::Expired => 2,
            Self::ExpiredBeforeQueue => 3,
            Self::NetworkError => 4,
            Self::InvalidConfig => 5,
            Self::Panic => 6,
        }
    }
}

/// Metrics facade bound to one subscriber.
#[derive(Debug)]
pub struct SenderMetrics {
    id: String,

    delivery: Counter<u64>,
    delivery_retries: Counter<u64>,
    dropped: Counter<u64>,
    cut_offs: Counter<u64>,
    queue_depth: UpDownCounter<i64>,
    current_workers: UpDownCounter<i64>,
    renewal_time: Gauge<f64>,
    deliver_until: Gauge<f64>,
    drop_until: Gauge<f64>,
    max_workers: Gauge<u64>,
    delivery_retry_max: Gauge<u64>,

    // Atomic mirrors readable without an exporter.
    delivered_by_code: DashMap<String, u64>,
    retry_total: AtomicU64,
    dropped_totals: [AtomicU64; 7],
    cut_off_total: AtomicU64,
    depth: AtomicI64,
    workers: AtomicI64,
}

impl SenderMetrics {
    /// Create the instrument set for one subscriber id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let meter = meter();

        let delivery = meter
            .u64_counter("courier.delivery.total")
            .with_description("Delivery outcomes by status code and event")
            .build();

        let delivery_retries = meter
            .u64_counter("courier.delivery.retries.total")
            .with_description("Delivery retry attempts by event")
            .build();

        let dropped = meter
            .u64_counter("courier.dropped.total")
            .with_description("Events dropped without delivery, by reason")
            .build();

        let cut_offs = meter
            .u64_counter("courier.cutoff.total")
            .with_description("Times the subscriber was cut off for falling behind")
            .build();

        let queue_depth = meter
            .i64_up_down_counter("courier.queue.depth")
            .with_description("Events currently buffered for the subscriber")
            .build();

        let current_workers = meter
            .i64_up_down_counter("courier.workers.current")
            .with_description("In-flight delivery tasks")
            .build();

        let renewal_time = meter
            .f64_gauge("courier.subscription.renewal_time")
            .with_description("Unix time of the last successful registration update")
            .build();

        let deliver_until = meter
            .f64_gauge("courier.subscription.deliver_until")
            .with_description("Unix time the delivery window closes")
            .build();

        let drop_until = meter
            .f64_gauge("courier.subscription.drop_until")
            .with_description("Unix time the current cut-off drop window ends")
            .build();

        let max_workers = meter
            .u64_gauge("courier.workers.max")
            .with_description("Configured delivery concurrency limit")
            .build();

        let delivery_retry_max = meter
            .u64_gauge("courier.delivery.retries.max")
            .with_description("Configured maximum retries per event")
            .build();

        Self {
            id: id.into(),
            delivery,
            delivery_retries,
            dropped,
            cut_offs,
            queue_depth,
            current_workers,
            renewal_time,
            deliver_until,
            drop_until,
            max_workers,
            delivery_retry_max,
            delivered_by_code: DashMap::new(),
            retry_total: AtomicU64::new(0),
            dropped_totals: Default::default(),
            cut_off_total: AtomicU64::new(0),
            depth: AtomicI64::new(0),
            workers: AtomicI64::new(0),
        }
    }

    fn bound(&self) -> KeyValue {
        KeyValue::new("webhook.id", self.id.clone())
    }

    /// Record the terminal delivery outcome for one event.
    ///
    /// `code` is the final HTTP status, or `"failure"` when every attempt
    /// failed at the transport level.
    pub fn record_delivery(&self, code: &str, event: &str) {
        self.delivery.add(
            1,
            &[
                self.bound(),
                KeyValue::new("code", code.to_string()),
                KeyValue::new("event", event.to_string()),
            ],
        );
        *self.delivered_by_code.entry(code.to_string()).or_insert(0) += 1;
    }

    /// Record one retry attempt.
    pub fn record_retry(&self, event: &str) {
        self.delivery_retries
            .add(1, &[self.bound(), KeyValue::new("event", event.to_string())]);
        self.retry_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one dropped event.
    pub fn record_dropped(&self, reason: DropReason) {
        self.record_dropped_many(reason, 1);
    }

    /// Record a batch of dropped events, e.g. a displaced queue.
    pub fn record_dropped_many(&self, reason: DropReason, count: u64) {
        if count == 0 {
            return;
        }
        self.dropped.add(
            count,
            &[self.bound(), KeyValue::new("reason", reason.as_str())],
        );
        self.dropped_totals[reason.index()].fetch_add(count, Ordering::Relaxed);
    }

    /// Record one cut-off of the subscriber.
    pub fn record_cut_off(&self) {
        self.cut_offs.add(1, &[self.bound()]);
        self.cut_off_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Adjust the buffered-event gauge.
    pub fn add_queue_depth(&self, delta: i64) {
        self.queue_depth.add(delta, &[self.bound()]);
        self.depth.fetch_add(delta, Ordering::Relaxed);
    }

    /// Zero the buffered-event gauge after a queue swap or shutdown.
    pub fn reset_queue_depth(&self) {
        let current = self.depth.swap(0, Ordering::Relaxed);
        if current != 0 {
            self.queue_depth.add(-current, &[self.bound()]);
        }
    }

    /// Record a delivery task entering flight.
    pub fn worker_started(&self) {
        self.current_workers.add(1, &[self.bound()]);
        self.workers.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a delivery task leaving flight.
    pub fn worker_finished(&self) {
        self.current_workers.add(-1, &[self.bound()]);
        self.workers.fetch_sub(1, Ordering::Relaxed);
    }

    /// Stamp the last successful registration update.
    pub fn set_renewal_time(&self, at: DateTime<Utc>) {
        self.renewal_time.record(timestamp(at), &[self.bound()]);
    }

    /// Publish the end of the delivery window.
    pub fn set_deliver_until(&self, until: DateTime<Utc>) {
        self.deliver_until.record(timestamp(until), &[self.bound()]);
    }

    /// Publish the end of the cut-off drop window.
    pub fn set_drop_until(&self, until: DateTime<Utc>) {
        self.drop_until.record(timestamp(until), &[self.bound()]);
    }

    /// Publish the configured worker limit.
    pub fn set_max_workers(&self, workers: u64) {
        self.max_workers.record(workers, &[self.bound()]);
    }

    /// Publish the configured retry limit.
    pub fn set_delivery_retry_max(&self, retries: u64) {
        self.delivery_retry_max.record(retries, &[self.bound()]);
    }

    /// Deliveries that terminated with the given status code label.
    #[must_use]
    pub fn delivered(&self, code: &str) -> u64 {
        self.delivered_by_code.get(code).map_or(0, |entry| *entry)
    }

    /// Total retry attempts recorded.
    #[must_use]
    pub fn retries(&self) -> u64 {
        self.retry_total.load(Ordering::Relaxed)
    }

    /// Events dropped for the given reason.
    #[must_use]
    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.dropped_totals[reason.index()].load(Ordering::Relaxed)
    }

    /// Times the subscriber has been cut off.
    #[must_use]
    pub fn cut_offs(&self) -> u64 {
        self.cut_off_total.load(Ordering::Relaxed)
    }

    /// Current buffered-event gauge value.
    #[must_use]
    pub fn queue_depth(&self) -> i64 {
        self.depth.load(Ordering::Relaxed)
    }

    /// Current in-flight delivery tasks.
    #[must_use]
    pub fn current_workers(&self) -> i64 {
        self.workers.load(Ordering::Relaxed)
    }
}

#[allow(clippy::cast_precision_loss)]
fn timestamp(at: DateTime<Utc>) -> f64 {
    at.timestamp() as f64
}

/// The OpenTelemetry meter all sender instruments hang off.
fn meter() -> Meter {
    opentelemetry::global::meter("courier.sender")
}
