use crate::messages::EngineEvent;
use tokio::sync::broadcast;

/// The output port the engine calls after each state transition.
///
/// Implementations must not block; delivery to the outside world is someone else's job.
pub trait Notifier: Send + Sync {
    fn publish(&self, event: EngineEvent);
}

/// Fans events out to any number of in-process subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<EngineEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn publish(&self, event: EngineEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

/// Writes every event to the tracing pipeline.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn publish(&self, event: EngineEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_else(|e| format!("<unserialisable event: {e}>"));
        if event.is_critical() {
            tracing::error!(target: "relay::events", %payload, "critical engine event");
        } else {
            tracing::info!(target: "relay::events", %payload, "engine event");
        }
    }
}

/// Publishes to several notifiers in order.
pub struct FanoutNotifier {
    sinks: Vec<Box<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(sinks: Vec<Box<dyn Notifier>>) -> Self {
        Self { sinks }
    }
}

impl Notifier for FanoutNotifier {
    fn publish(&self, event: EngineEvent) {
        for sink in &self.sinks {
            sink.publish(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::LogLevel;

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let notifier = BroadcastNotifier::new(8);
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();

        notifier.publish(EngineEvent::log(LogLevel::Info, "hello"));

        assert!(matches!(first.recv().await.unwrap(), EngineEvent::Log(_)));
        assert!(matches!(second.recv().await.unwrap(), EngineEvent::Log(_)));
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        let notifier = BroadcastNotifier::new(1);
        notifier.publish(EngineEvent::log(LogLevel::Warn, "nobody listening"));
    }

    #[test]
    fn events_use_tagged_json() {
        let json = serde_json::to_value(EngineEvent::log(LogLevel::Error, "boom")).unwrap();
        assert_eq!(json["type"], "Log");
        assert_eq!(json["payload"]["message"], "boom");
    }
}
