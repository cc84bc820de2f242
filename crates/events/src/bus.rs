//! Publish side of the event layer.
//!
//! Publishers hold an [`EventSink`]. The production sink, [`EventBus`], is a
//! cheap clonable handle over a bounded channel drained by one
//! [`Broadcaster`] task; publishing never blocks and never fails from the
//! caller's point of view. Delivery is at-most-once per connected session.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use labflow_core::ScopeRef;
use labflow_observability::MetricsCollector;

use crate::event::Event;
use crate::session::{Delivery, SessionManager};

/// Fire-and-forget event publication.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);

    fn emit(&self, scope: ScopeRef, event_type: &str, payload: JsonValue) {
        self.publish(Event::new(scope, event_type, payload));
    }
}

impl<S> EventSink for Arc<S>
where
    S: EventSink + ?Sized,
{
    fn publish(&self, event: Event) {
        (**self).publish(event)
    }
}

/// Clonable publish handle feeding a running [`Broadcaster`].
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::Sender<Event>,
    metrics: Arc<MetricsCollector>,
}

impl EventSink for EventBus {
    fn publish(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => self.metrics.record_event_published(),
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.metrics.record_events_dropped(1);
                tracing::warn!(
                    scope = %event.scope,
                    event_type = %event.event_type,
                    "event channel full, event dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::debug!(scope = %event.scope, "event bus stopped, event discarded");
            }
        }
    }
}

/// Fans events out to subscribed sessions.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    sessions: Arc<SessionManager>,
    metrics: Arc<MetricsCollector>,
}

/// Running broadcaster task.
#[derive(Debug)]
pub struct BroadcasterHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl BroadcasterHandle {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "broadcaster task failed");
        }
    }
}

impl Broadcaster {
    pub fn new(sessions: Arc<SessionManager>, metrics: Arc<MetricsCollector>) -> Self {
        Self { sessions, metrics }
    }

    /// Serialize once and queue to every authorized subscriber. An event for
    /// a scope nobody follows is discarded immediately.
    pub fn broadcast(&self, event: &Event) -> Delivery {
        let frame: Arc<str> = match event.to_frame() {
            Ok(text) => Arc::from(text),
            Err(e) => {
                tracing::error!(error = %e, scope = %event.scope, "event serialization failed");
                self.metrics.record_events_dropped(1);
                return Delivery::default();
            }
        };
        let tally = self.sessions.deliver(&event.scope, &frame);
        if tally.delivered > 0 {
            self.metrics.record_events_delivered(tally.delivered);
        }
        if tally.dropped > 0 {
            self.metrics.record_events_dropped(tally.dropped);
        }
        tracing::trace!(
            scope = %event.scope,
            event_type = %event.event_type,
            delivered = tally.delivered,
            "event broadcast"
        );
        tally
    }

    /// Start the fan-out task with an inbound channel of `capacity` events.
    pub fn spawn(self, capacity: usize, cancel: CancellationToken) -> (EventBus, BroadcasterHandle) {
        let (tx, mut rx) = mpsc::channel::<Event>(capacity.max(1));
        let bus = EventBus {
            tx,
            metrics: self.metrics.clone(),
        };
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            tracing::info!("broadcaster started");
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(event) => {
                            self.broadcast(&event);
                        }
                        None => break,
                    },
                }
            }
            tracing::info!("broadcaster stopped");
        });
        (bus, BroadcasterHandle { cancel, join })
    }
}

/// Recording sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryEventSink {
    events: Mutex<Vec<Event>>,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn of_type(&self, event_type: &str) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

impl EventSink for InMemoryEventSink {
    fn publish(&self, event: Event) {
        self.events.lock().push(event);
    }
}
