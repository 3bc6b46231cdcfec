//! Event bus for intra-service fan-out.
//!
//! Uses tokio::sync::broadcast for pub/sub. Each service owns one bus,
//! created at startup and passed by reference; there is no global state.
//! WebSocket fan-out tasks subscribe here and apply their own bounded
//! per-subscriber queues.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

pub mod events;
pub mod fanout;

pub use events::{
    Envelope, EventOrigin, InputEvent, MediaAction, MediaSnapshot, MenuItem, PlaybackState,
    PlayerKind, SourceRecord, SourceState, SpinDirection, REASON_EXTERNAL_TAKEOVER,
};

/// Bus handle for publishing and subscribing within one service.
///
/// Also owns the service's monotonic emit counter: every envelope published
/// through [`EventBus::stamp`] gets the next `seq`.
pub struct EventBus {
    sender: broadcast::Sender<Envelope>,
    seq: AtomicU64,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            seq: AtomicU64::new(0),
        }
    }

    /// Next monotonic sequence number for this service.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Publish an already-stamped envelope. Send errors (no subscribers)
    /// are ignored.
    pub fn publish(&self, event: Envelope) {
        let _ = self.sender.send(event);
    }

    /// Stamp `seq` on the envelope and publish it. Returns the stamped
    /// sequence number.
    pub fn stamp(&self, mut event: Envelope) -> u64 {
        let seq = self.next_seq();
        event.seq = seq;
        let _ = self.sender.send(event);
        seq
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Shared bus handle.
pub type SharedBus = Arc<EventBus>;

/// Create a shared bus with the default capacity (256 events).
pub fn create_bus() -> SharedBus {
    Arc::new(EventBus::new(256))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = create_bus();
        let mut rx = bus.subscribe();

        bus.stamp(Envelope::new("menu_update", serde_json::json!({}), 0));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, "menu_update");
        assert_eq!(event.seq, 1);
    }

    #[tokio::test]
    async fn seq_is_monotonic_across_publishes() {
        let bus = create_bus();
        let mut rx = bus.subscribe();

        for _ in 0..3 {
            bus.stamp(Envelope::new("nav", serde_json::json!({}), 0));
        }

        let seqs: Vec<u64> = vec![
            rx.recv().await.unwrap().seq,
            rx.recv().await.unwrap().seq,
            rx.recv().await.unwrap().seq,
        ];
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn multiple_subscribers_see_every_event() {
        let bus = create_bus();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.stamp(Envelope::new("button", serde_json::json!({"button": "go"}), 0));

        assert_eq!(rx1.recv().await.unwrap().kind, "button");
        assert_eq!(rx2.recv().await.unwrap().kind, "button");
    }
}
