//! In-process event bus with per-subscriber unbounded queues.
//!
//! Each subscription owns an mpsc queue, so a slow consumer never causes
//! events to be dropped (unlike a broadcast ring). Events from one publisher
//! arrive in publish order.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

use super::types::{EventEnvelope, EventKind, PipelineEvent};

/// Typed publish/subscribe hub connecting the stages.
pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<mpsc::UnboundedSender<EventEnvelope>>>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
        })
    }

    /// Subscribe to one or more event kinds.
    pub async fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self.subscribers.write().await;
        for kind in kinds {
            subs.entry(*kind).or_default().push(tx.clone());
        }
        Subscription { rx }
    }

    /// Publish an event to every live subscriber of its kind.
    ///
    /// Returns the number of subscribers it was delivered to.
    pub async fn publish(&self, event: PipelineEvent) -> usize {
        let kind = event.kind();
        let envelope = EventEnvelope::new(event, Utc::now());

        let mut subs = self.subscribers.write().await;
        let Some(senders) = subs.get_mut(&kind) else {
            debug!(event = %kind, "No subscribers for event");
            return 0;
        };

        // Drop subscribers whose receiver is gone.
        senders.retain(|tx| tx.send(envelope.clone()).is_ok());
        debug!(
            event = %kind,
            event_id = %envelope.id,
            visitor_id = %envelope.event.visitor_id(),
            delivered = senders.len(),
            "Event published"
        );
        senders.len()
    }
}

/// Receiving end of a subscription.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<EventEnvelope>,
}

impl Subscription {
    /// Next event, or `None` once the bus is dropped.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        self.rx.recv().await
    }

    /// Non-blocking poll, for tests and draining.
    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        self.rx.try_recv().ok()
    }
}
