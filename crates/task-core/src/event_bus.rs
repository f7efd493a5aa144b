use tokio::sync::broadcast;

use task_types::Event;

/// In-process fan-out with at-least-once delivery to subscribers (spec.md §4.9).
///
/// Events must be persisted via the Store before `publish` is called so that
/// subscribers can replay from the Store's own ordering; this struct only
/// fans the already-committed event out to live listeners.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
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
    use task_types::EventPayload;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let event = Event::new(
            "u1",
            None,
            None,
            EventPayload::StreakUpdated { streak_days: 1 },
        );
        bus.publish(event.clone());
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_id, event.event_id);
    }
}
