//! The event-subscription half of the "Core→collaborator API" (§6, component
//! #10): a broadcast channel of [`FeedbackEvent`]s that external collaborators
//! (the gateway, and through it the dashboard/plug-ins) subscribe to. Never
//! carries RDI data — the RDI hard invariant (§4.6) keeps that module's
//! output off every cross-component channel except its own opt-in export.

use crate::types::FeedbackEvent;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1024;

/// Cheap to clone; every holder shares the same underlying channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<FeedbackEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Best-effort: a publish with no subscribers is simply dropped.
    pub fn publish(&self, event: &FeedbackEvent) {
        let _ = self.sender.send(event.clone());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedbackEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn event() -> FeedbackEvent {
        FeedbackEvent {
            id: "e1".to_string(),
            timestamp: Utc::now(),
            kind: crate::types::FeedbackKind::GateViolation,
            source_component: "gates".to_string(),
            request_id: None,
            user_id: None,
            rating: None,
            free_text: None,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(&event());
        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, "e1");
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(&event());
    }
}
