use metrics::counter;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::models::{Severity, StoreEvent};
use crate::services::notifier::{format_alert, Notifier};

pub type SubscriptionId = Uuid;

/// Subscriber callback. Runs on the fan-out worker, never on the publisher.
pub type EventCallback = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

// ---------------------------------------------------------------------------
// Subscriber registry
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    inner: Arc<RwLock<HashMap<SubscriptionId, EventCallback>>>,
}

impl SubscriberRegistry {
    pub fn subscribe(&self, callback: EventCallback) -> SubscriptionId {
        let id = Uuid::new_v4();
        self.inner.write().insert(id, callback);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.write().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every callback once. A panicking callback is logged and skipped.
    pub fn deliver(&self, event: &StoreEvent) {
        // Clone the handles so callbacks may (un)subscribe without deadlocking.
        let callbacks: Vec<(SubscriptionId, EventCallback)> = self
            .inner
            .read()
            .iter()
            .map(|(id, cb)| (*id, cb.clone()))
            .collect();

        for (id, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                counter!("subscriber_failures_total").increment(1);
                tracing::warn!(subscription = %id, kind = event.kind(), "Subscriber callback panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Cheap, cloneable handle the store publishes through. Never blocks: a full
/// queue drops the event.
#[derive(Clone)]
pub struct EventPublisher {
    tx: Option<mpsc::Sender<StoreEvent>>,
    registry: SubscriberRegistry,
}

impl EventPublisher {
    /// Publisher with no worker behind it. Events are discarded.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            registry: SubscriberRegistry::default(),
        }
    }

    pub fn publish(&self, event: StoreEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                counter!("events_dropped_total").increment(1);
                tracing::warn!(kind = event.kind(), "Event queue full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Event queue closed");
            }
        }
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct FanoutWorker {
    rx: mpsc::Receiver<StoreEvent>,
    registry: SubscriberRegistry,
    ws_tx: Option<broadcast::Sender<StoreEvent>>,
    notifier: Option<Arc<Notifier>>,
}

/// Create a bounded publisher/worker pair.
pub fn channel(capacity: usize) -> (EventPublisher, FanoutWorker) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let registry = SubscriberRegistry::default();
    let publisher = EventPublisher {
        tx: Some(tx),
        registry: registry.clone(),
    };
    let worker = FanoutWorker {
        rx,
        registry,
        ws_tx: None,
        notifier: None,
    };
    (publisher, worker)
}

impl FanoutWorker {
    /// Also forward every event to WebSocket clients.
    pub fn with_broadcast(mut self, ws_tx: broadcast::Sender<StoreEvent>) -> Self {
        self.ws_tx = Some(ws_tx);
        self
    }

    /// Also push HIGH and CRITICAL alerts to Telegram.
    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Drain the queue until every publisher is dropped.
    pub async fn run(mut self) {
        tracing::info!("Notification fan-out started");

        while let Some(event) = self.rx.recv().await {
            self.registry.deliver(&event);

            if let Some(ws_tx) = &self.ws_tx {
                // No receivers is fine: nobody is watching.
                let _ = ws_tx.send(event.clone());
            }

            if let (Some(notifier), StoreEvent::Alert(alert)) = (&self.notifier, &event) {
                if alert.severity >= Severity::High {
                    let notifier = notifier.clone();
                    let msg = format_alert(alert);
                    tokio::spawn(async move { notifier.send(&msg).await });
                }
            }
        }

        tracing::warn!("Notification fan-out stopped: event channel closed");
    }
}
