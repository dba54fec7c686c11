//! courier: the per-subscriber outbound delivery engine of a webhook
//! fan-out service.
//!
//! Events admitted by the upstream ingestion layer are offered to one
//! [`Sender`] per registered subscriber. Each sender filters events
//! against its subscription, buffers them in a bounded swap-able queue,
//! and delivers them over HTTP with retry, URL rotation, and HMAC
//! signing. Subscribers that fall behind are cut off for a configured
//! window and notified on their failure URL.
//!
//! The engine owns no I/O: the HTTP executor, clock, and metric pipeline
//! are injected by the host.

#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod device;
pub mod error;
pub mod event;
pub mod metrics;
pub mod queue;
pub mod sender;
pub mod signature;
pub mod subscription;
pub mod transport;

pub use error::{FactoryError, TransportError, UpdateError};
pub use event::Event;
pub use metrics::{DropReason, SenderMetrics};
pub use queue::{EventQueue, PushError};
pub use sender::{FailureMessage, Sender, SenderConfig, SenderFactory};
pub use subscription::{DeliveryConfig, MatcherConfig, Subscription};
pub use transport::{wall_clock, Clock, Transport};
