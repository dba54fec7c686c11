//! Bounded, closable event queue with a single consumer.
//!
//! Producers hand events off without blocking; the dispatcher is the only
//! consumer. The whole queue is swapped out on cut-off and on abrupt
//! shutdown, so handles are shared as `Arc<EventQueue>` and producers must
//! re-read the current handle on every enqueue attempt. A displaced queue
//! is simply abandoned; the last holder of the `Arc` releases it.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::event::Event;

/// Why a non-blocking enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// The queue is at capacity.
    Full,
    /// The queue was closed by shutdown.
    Closed,
}

/// Bounded FIFO handoff between producers and the dispatcher.
#[derive(Debug)]
pub struct EventQueue {
    items: Mutex<VecDeque<Event>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

impl EventQueue {
    /// An open queue accepting up to `capacity` events.
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity,
        }
    }

    /// An empty queue that is already closed. Swapped in on abrupt
    /// shutdown so the dispatcher observes end-of-stream immediately.
    #[must_use]
    pub fn sealed(capacity: usize) -> Self {
        let queue = Self::bounded(capacity);
        queue.close();
        queue
    }

    /// Attempt to enqueue without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`PushError::Full`] at capacity and [`PushError::Closed`]
    /// after shutdown closed the queue.
    pub fn try_push(&self, event: Event) -> Result<(), PushError> {
        {
            let mut items = self.items.lock();
            if self.closed.load(Ordering::Acquire) {
                return Err(PushError::Closed);
            }
            if items.len() >= self.capacity {
                return Err(PushError::Full);
            }
            items.push_back(event);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Dequeue the next event, waiting for one to arrive.
    ///
    /// Returns `None` once the queue is closed and drained. Intended for a
    /// single consumer.
    pub async fn pop(&self) -> Option<Event> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before re-checking so a push or close
            // between the check and the await cannot be lost.
            notified.as_mut().enable();

            {
                let mut items = self.items.lock();
                if let Some(event) = items.pop_front() {
                    return Some(event);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Close the queue. Enqueued events remain poppable; further pushes
    /// fail. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Instantaneous number of buffered events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue currently buffers no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Fixed capacity chosen at construction.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
