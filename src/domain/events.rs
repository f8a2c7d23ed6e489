//! In-process event fan-out.
//!
//! Pollers and the event-stream surface publish [`PlcEvent`]s into a
//! broadcast channel. Subscribers that cannot keep up observe a lag
//! marker and resume at the oldest retained event; producers never
//! block on a slow subscriber.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::StatusSnapshot;

/// Default retention per subscriber before lagging sets in.
const DEFAULT_CAPACITY: usize = 256;

/// Everything the fleet broadcasts about its machines.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlcEvent {
    /// Published when a poll observes a state different from the last
    /// published snapshot.
    StatusUpdate {
        machine_id: String,
        snapshot: StatusSnapshot,
    },
    /// A poll round gave up because the device mutex was held past its
    /// deadline.
    StatusBusy { machine_id: String },
    Reconnecting { machine_id: String },
    Reconnected { machine_id: String },
    ConnError { machine_id: String, reason: String },
    /// A peer issued a command; other subscribers learn about it here.
    CommandEcho {
        machine_id: String,
        command: u8,
        argument: Option<u8>,
        client_addr: String,
    },
}

impl PlcEvent {
    pub fn machine_id(&self) -> &str {
        match self {
            PlcEvent::StatusUpdate { machine_id, .. }
            | PlcEvent::StatusBusy { machine_id }
            | PlcEvent::Reconnecting { machine_id }
            | PlcEvent::Reconnected { machine_id }
            | PlcEvent::ConnError { machine_id, .. }
            | PlcEvent::CommandEcho { machine_id, .. } => machine_id,
        }
    }
}

/// Cloneable handle to the broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PlcEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn publish(&self, event: PlcEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlcEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    fn busy(id: &str) -> PlcEvent {
        PlcEvent::StatusBusy {
            machine_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn events_fan_out_to_all_subscribers() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(busy("m1"));

        assert_eq!(a.recv().await.unwrap().machine_id(), "m1");
        assert_eq!(b.recv().await.unwrap().machine_id(), "m1");
    }

    #[tokio::test]
    async fn per_machine_order_is_preserved() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(PlcEvent::Reconnecting {
            machine_id: "m1".to_string(),
        });
        bus.publish(PlcEvent::Reconnected {
            machine_id: "m1".to_string(),
        });

        assert!(matches!(
            rx.recv().await.unwrap(),
            PlcEvent::Reconnecting { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            PlcEvent::Reconnected { .. }
        ));
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking_producers() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.publish(busy(&format!("m{i}")));
        }

        // The first recv reports how far behind the subscriber fell,
        // then delivery resumes at the oldest retained event.
        match rx.recv().await {
            Err(RecvError::Lagged(skipped)) => assert_eq!(skipped, 3),
            other => panic!("expected lag marker, got {other:?}"),
        }
        assert_eq!(rx.recv().await.unwrap().machine_id(), "m3");
        assert_eq!(rx.recv().await.unwrap().machine_id(), "m4");
    }
}
