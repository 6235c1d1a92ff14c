//! Event channels with isolated subscriber delivery.
//!
//! An [`EventChannel`] is a named, schema-typed publish channel. Every
//! subscriber is delivered to independently:
//!
//! - a callback that returns an error (or panics) is logged and skipped, the
//!   remaining subscribers still run and nothing propagates to the publisher;
//! - [`DispatchMode::Dedicated`] subscribers run on their own worker thread fed
//!   by a bounded queue, so a slow callback delays neither the publisher nor
//!   other subscribers. When the queue is full the payload is dropped for that
//!   subscriber, logged and counted as a failed delivery.
//!
//! The same [`SubscriberList`] is used by the server for its channels and by
//! the client proxy to fan incoming notifications out to local callbacks.
//!
//! # Example
//!
//! ```rust,ignore
//! let channel = EventChannel::new(Arc::new(
//!     EventDescriptor::new("data_point_event").alias("data-point-event"),
//! ));
//! channel.subscribe(Arc::new(|payload| { println!("{payload}"); Ok(()) }), DispatchMode::Dedicated);
//! channel.publish(json!({"energy": 1.2e-3}))?;
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::RemoteError;
use crate::limits::DEDICATED_QUEUE_CAPACITY;
use crate::schema::Schema;

/// Callback invoked with each event payload.
pub type EventCallback = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// How a subscriber's callback is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Run synchronously on the thread delivering the notification.
    #[default]
    Inline,
    /// Run on an independent worker owned by the subscription.
    Dedicated,
}

/// Handle identifying one subscription within a [`SubscriberList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "subscriber_{}", self.0)
    }
}

// =============================================================================
// Event Descriptor
// =============================================================================

/// Declaration of an event on a thing type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDescriptor {
    /// Canonical event name
    pub name: String,
    /// Optional human-friendly alias (e.g. `data-point-event`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
    /// Payload schema
    #[serde(default)]
    pub schema: Schema,
}

impl EventDescriptor {
    /// Event with an unconstrained payload.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            doc: None,
            schema: Schema::Any,
        }
    }

    /// Set the friendly alias.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Set the description.
    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    /// Set the payload schema.
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// Whether `name` is this event's name or alias.
    pub fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.alias.as_deref() == Some(name)
    }
}

// =============================================================================
// Subscriber List
// =============================================================================

struct Subscriber {
    id: SubscriptionId,
    delivery: Delivery,
}

enum Delivery {
    Inline(EventCallback),
    // Dropping the sender stops the worker thread.
    Dedicated(mpsc::Sender<Value>),
}

/// Outcome of delivering one payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Callbacks that ran (or were queued) successfully
    pub delivered: usize,
    /// Callbacks that failed or whose worker had stopped
    pub failed: usize,
}

/// Independent subscribers for one event.
pub struct SubscriberList {
    label: String,
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for SubscriberList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberList")
            .field("label", &self.label)
            .field("subscribers", &self.len())
            .finish()
    }
}

impl SubscriberList {
    /// Create an empty list; `label` is used in logs and worker thread names.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register `callback`, returning its subscription id.
    pub fn subscribe(&self, callback: EventCallback, mode: DispatchMode) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let delivery = match mode {
            DispatchMode::Inline => Delivery::Inline(callback),
            DispatchMode::Dedicated => Delivery::Dedicated(spawn_worker(&self.label, id, callback)),
        };
        self.subscribers
            .write()
            .push(Arc::new(Subscriber { id, delivery }));
        tracing::debug!("{}: registered {} ({:?})", self.label, id, mode);
        id
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        let removed = subscribers.len() != before;
        if removed {
            tracing::debug!("{}: unregistered {}", self.label, id);
        }
        removed
    }

    /// Number of active subscriptions.
    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    /// True when nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `payload` to every subscriber, isolating failures.
    pub fn deliver(&self, payload: &Value) -> DeliveryReport {
        // snapshot so callbacks may (un)subscribe without deadlocking
        let snapshot: Vec<Arc<Subscriber>> = self.subscribers.read().clone();
        let mut report = DeliveryReport::default();

        for subscriber in snapshot {
            let ok = match &subscriber.delivery {
                Delivery::Inline(callback) => run_isolated(&self.label, subscriber.id, callback, payload),
                Delivery::Dedicated(queue) => match queue.try_send(payload.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(
                            "{}: queue for {} is full, dropping payload",
                            self.label,
                            subscriber.id
                        );
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        tracing::warn!("{}: worker for {} has stopped", self.label, subscriber.id);
                        false
                    }
                },
            };
            if ok {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }

        report
    }
}

fn run_isolated(label: &str, id: SubscriptionId, callback: &EventCallback, payload: &Value) -> bool {
    match catch_unwind(AssertUnwindSafe(|| callback(payload))) {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            tracing::warn!("{}: callback {} failed: {:#}", label, id, err);
            false
        }
        Err(_) => {
            tracing::warn!("{}: callback {} panicked", label, id);
            false
        }
    }
}

fn spawn_worker(label: &str, id: SubscriptionId, callback: EventCallback) -> mpsc::Sender<Value> {
    let (tx, mut rx) = mpsc::channel::<Value>(DEDICATED_QUEUE_CAPACITY);
    let label = label.to_string();
    let thread_name = format!("event-{}-{}", label, id.0);

    let spawned = std::thread::Builder::new().name(thread_name).spawn(move || {
        while let Some(payload) = rx.blocking_recv() {
            run_isolated(&label, id, &callback, &payload);
        }
        tracing::trace!("{}: worker for {} exiting", label, id);
    });

    if let Err(err) = spawned {
        // the receiver was moved into the failed closure and dropped, so every
        // later send reports the worker as stopped
        tracing::error!("failed to spawn event worker: {}", err);
    }
    tx
}

// =============================================================================
// Event Channel
// =============================================================================

/// Counters for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelMetrics {
    /// Payloads accepted by `publish`
    pub published: u64,
    /// Individual subscriber deliveries that failed
    pub delivery_failures: u64,
}

/// Named publish channel with schema-checked payloads.
#[derive(Debug)]
pub struct EventChannel {
    descriptor: Arc<EventDescriptor>,
    subscribers: SubscriberList,
    published: AtomicU64,
    delivery_failures: AtomicU64,
}

impl EventChannel {
    /// Create a channel for `descriptor` with no subscribers.
    pub fn new(descriptor: Arc<EventDescriptor>) -> Self {
        let subscribers = SubscriberList::new(descriptor.name.clone());
        Self {
            descriptor,
            subscribers,
            published: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
        }
    }

    /// The channel's declaration.
    pub fn descriptor(&self) -> &EventDescriptor {
        &self.descriptor
    }

    /// Canonical event name.
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Register a callback.
    pub fn subscribe(&self, callback: EventCallback, mode: DispatchMode) -> SubscriptionId {
        self.subscribers.subscribe(callback, mode)
    }

    /// Remove a callback.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Validate `payload` and deliver it to every subscriber.
    ///
    /// Only a schema mismatch is reported to the caller; subscriber failures
    /// are counted and logged.
    pub fn publish(&self, payload: Value) -> Result<DeliveryReport, RemoteError> {
        let payload = self
            .descriptor
            .schema
            .validate_at(&payload, &self.descriptor.name)?;

        self.published.fetch_add(1, Ordering::Relaxed);
        if self.subscribers.is_empty() {
            tracing::trace!("No active subscribers for {}", self.descriptor.name);
            return Ok(DeliveryReport::default());
        }

        let report = self.subscribers.deliver(&payload);
        if report.failed > 0 {
            self.delivery_failures
                .fetch_add(report.failed as u64, Ordering::Relaxed);
        }
        tracing::trace!(
            "Published {} to {} subscribers ({} failed)",
            self.descriptor.name,
            report.delivered,
            report.failed
        );
        Ok(report)
    }

    /// Snapshot of the channel counters.
    pub fn metrics(&self) -> ChannelMetrics {
        ChannelMetrics {
            published: self.published.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
