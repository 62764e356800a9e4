//! Change notifications emitted after a successful refresh.
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::definitions::Payload;

/// Kind of change carried by a [`DiffEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Features,
}

/// Before/after snapshot of one API key's payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffEvent {
    pub api_key: String,
    pub event: EventKind,
    pub payload: Arc<Payload>,
    /// Payload that was cached before the refresh. `None` if there was none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_payload: Option<Arc<Payload>>,
    pub ss_eval_enabled: bool,
}

/// Receiver of [`DiffEvent`]s.
///
/// Publishing is fire-and-forget: implementations must not block and must handle their own
/// failures.
pub trait ChangePublisher: Send + Sync {
    fn publish(&self, event: DiffEvent);
}

/// In-process fan-out of change events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<Arc<DiffEvent>>,
}

impl BroadcastPublisher {
    /// Default number of events kept for slow subscribers.
    pub const DEFAULT_CAPACITY: usize = 64;

    pub fn new() -> BroadcastPublisher {
        BroadcastPublisher::with_capacity(BroadcastPublisher::DEFAULT_CAPACITY)
    }

    /// Subscribers lagging more than `capacity` events behind miss the oldest ones.
    pub fn with_capacity(capacity: usize) -> BroadcastPublisher {
        let (sender, _) = broadcast::channel(capacity);
        BroadcastPublisher { sender }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DiffEvent>> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> BroadcastPublisher {
        BroadcastPublisher::new()
    }
}

impl ChangePublisher for BroadcastPublisher {
    fn publish(&self, event: DiffEvent) {
        let event = Arc::new(event);
        let api_key = event.api_key.as_str();
        match self.sender.send(event.clone()) {
            Ok(receivers) => {
                log::debug!(target: "feature_proxy", api_key, receivers; "published features change");
            }
            // No subscribers.
            Err(_) => {
                log::trace!(target: "feature_proxy", api_key; "dropped features change, no subscribers");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn event(old_payload: Option<Arc<Payload>>) -> DiffEvent {
        DiffEvent {
            api_key: "key".to_owned(),
            event: EventKind::Features,
            payload: Arc::new(Payload::new()),
            old_payload,
            ss_eval_enabled: false,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let publisher = BroadcastPublisher::new();
        let mut first = publisher.subscribe();
        let mut second = publisher.subscribe();

        publisher.publish(event(None));

        assert_eq!(*first.recv().await.unwrap(), event(None));
        assert_eq!(*second.recv().await.unwrap(), event(None));
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let publisher = BroadcastPublisher::new();
        publisher.publish(event(None));
    }

    #[test]
    fn wire_format() {
        assert_eq!(
            serde_json::to_value(event(None)).unwrap(),
            json!({ "apiKey": "key", "event": "features", "payload": {}, "ssEvalEnabled": false })
        );
        assert_eq!(
            serde_json::to_value(event(Some(Arc::new(Payload::new())))).unwrap()["oldPayload"],
            json!({})
        );
    }
}
