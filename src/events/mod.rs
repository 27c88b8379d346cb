//! Event system for coach state notifications
//!
//! Connection state and the `speaking` flag are published here so a UI
//! can follow them without reaching into the pipeline.

pub mod types;

pub use types::CoachEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event bus for broadcasting coach events
///
/// # Example
///
/// ```no_run
/// use voice_coach::events::{CoachEvent, EventBus};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(CoachEvent::SpeakingChanged { speaking: true });
///
/// tokio::spawn(async move {
///     while let Ok(event) = rx.recv().await {
///         println!("Received event: {:?}", event);
///     }
/// });
/// ```
pub struct EventBus {
    tx: broadcast::Sender<CoachEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// Events published with no subscribers are dropped.
    pub fn publish(&self, event: CoachEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<CoachEvent> {
        self.tx.subscribe()
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
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

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(CoachEvent::SpeakingChanged { speaking: true });

        let event = rx.recv().await.unwrap();
        assert_eq!(event, CoachEvent::SpeakingChanged { speaking: true });
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(CoachEvent::Error {
            message: "upstream gone".to_string(),
        });

        assert!(matches!(rx1.recv().await.unwrap(), CoachEvent::Error { .. }));
        assert!(matches!(rx2.recv().await.unwrap(), CoachEvent::Error { .. }));
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(CoachEvent::FrameDropped {
            reason: "closed".to_string(),
        });
    }
}
