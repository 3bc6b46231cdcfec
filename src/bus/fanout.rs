//! WebSocket fan-out with bounded per-subscriber queues.
//!
//! A single fan-out task drains the service bus and pushes every envelope
//! into each subscriber's queue, preserving order. Queues are bounded at a
//! high-water mark; on overflow the oldest message is dropped and the
//! subscriber's `dropped_messages` counter advances. A subscriber that
//! overflows three times is disconnected.

use axum::extract::ws::{Message, WebSocket};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{Envelope, SharedBus};

/// Queue overflows tolerated before the subscriber is cut loose.
const MAX_DROP_EVENTS: usize = 3;
/// Default per-subscriber high-water mark.
pub const DEFAULT_HIGH_WATER: usize = 64;

/// Outcome of pushing one envelope into a subscriber queue.
#[derive(Debug, PartialEq, Eq)]
enum PushOutcome {
    Queued,
    /// Oldest message evicted to make room.
    Overflowed,
    /// Third overflow: the subscriber must be disconnected.
    Disconnect,
}

/// One subscriber's bounded send queue.
pub struct SubscriberQueue {
    inner: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    high_water: usize,
    dropped_messages: AtomicU64,
    drop_events: AtomicUsize,
    closed: CancellationToken,
}

impl SubscriberQueue {
    fn new(high_water: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            high_water,
            dropped_messages: AtomicU64::new(0),
            drop_events: AtomicUsize::new(0),
            closed: CancellationToken::new(),
        })
    }

    fn push(&self, event: Envelope) -> PushOutcome {
        let mut queue = match self.inner.lock() {
            Ok(queue) => queue,
            Err(_) => return PushOutcome::Disconnect,
        };

        let outcome = if queue.len() >= self.high_water {
            queue.pop_front();
            self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            let events = self.drop_events.fetch_add(1, Ordering::Relaxed) + 1;
            if events >= MAX_DROP_EVENTS {
                PushOutcome::Disconnect
            } else {
                PushOutcome::Overflowed
            }
        } else {
            PushOutcome::Queued
        };

        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
        outcome
    }

    /// Wait for the next envelope, or `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<Envelope> {
        loop {
            if let Ok(mut queue) = self.inner.lock() {
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
                if self.closed.is_cancelled() {
                    return None;
                }
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = self.closed.cancelled() => {}
            }
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }
}

/// Registry of live subscribers plus the fan-out task feeding them.
pub struct Fanout {
    subscribers: Mutex<HashMap<u64, Arc<SubscriberQueue>>>,
    next_id: AtomicU64,
    high_water: usize,
}

impl Fanout {
    pub fn new(high_water: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            high_water,
        })
    }

    /// Spawn the task that drains the bus into every subscriber queue.
    pub fn start(self: &Arc<Self>, bus: SharedBus, cancel: CancellationToken) {
        let fanout = self.clone();
        tokio::spawn(async move {
            let mut rx = bus.subscribe();
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(event) => event,
                        // The bus ring lapped us; subscribers see a gap but
                        // stay connected.
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(lost = n, "fan-out lagged behind the bus");
                            continue;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                };
                fanout.broadcast(event);
            }
            debug!("fan-out task stopped");
        });
    }

    /// Push to every subscriber; disconnect the persistently slow ones.
    pub fn broadcast(&self, event: Envelope) {
        let mut stale = Vec::new();
        {
            let subscribers = match self.subscribers.lock() {
                Ok(subscribers) => subscribers,
                Err(_) => return,
            };
            for (id, queue) in subscribers.iter() {
                if queue.push(event.clone()) == PushOutcome::Disconnect {
                    warn!(
                        subscriber = id,
                        dropped = queue.dropped_messages(),
                        "slow subscriber disconnected"
                    );
                    queue.close();
                    stale.push(*id);
                }
            }
        }
        for id in stale {
            self.remove(id);
        }
    }

    /// Register a subscriber, optionally seeding its queue with replay
    /// envelopes delivered before any live event.
    pub fn subscribe(&self, replay: Vec<Envelope>) -> (u64, Arc<SubscriberQueue>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = SubscriberQueue::new(self.high_water);
        for event in replay {
            queue.push(event);
        }
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.insert(id, queue.clone());
        }
        debug!(subscriber = id, "subscriber connected");
        (id, queue)
    }

    pub fn remove(&self, id: u64) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            if let Some(queue) = subscribers.remove(&id) {
                queue.close();
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn total_dropped(&self) -> u64 {
        self.subscribers
            .lock()
            .map(|s| s.values().map(|q| q.dropped_messages()).sum())
            .unwrap_or(0)
    }
}

/// Drive one accepted WebSocket from its queue until either side goes away.
/// Incoming frames are drained and ignored; both topics are broadcast-only.
pub async fn serve_socket(socket: WebSocket, id: u64, queue: Arc<SubscriberQueue>, fanout: Arc<Fanout>) {
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = queue.pop() => {
                let Some(event) = event else { break };
                let Ok(json) = serde_json::to_string(&event) else { continue };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    fanout.remove(id);
    info!(subscriber = id, "subscriber disconnected");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn event(seq: u64) -> Envelope {
        Envelope::new("media_update", serde_json::json!({ "n": seq }), seq)
    }

    #[tokio::test]
    async fn delivery_preserves_order() {
        let fanout = Fanout::new(8);
        let (_, queue) = fanout.subscribe(Vec::new());

        for seq in 1..=5 {
            fanout.broadcast(event(seq));
        }

        for seq in 1..=5 {
            assert_eq!(queue.pop().await.unwrap().seq, seq);
        }
    }

    #[tokio::test]
    async fn replay_arrives_before_live_events() {
        let fanout = Fanout::new(8);
        let (_, queue) = fanout.subscribe(vec![event(99)]);
        fanout.broadcast(event(100));

        assert_eq!(queue.pop().await.unwrap().seq, 99);
        assert_eq!(queue.pop().await.unwrap().seq, 100);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let fanout = Fanout::new(2);
        let (_, queue) = fanout.subscribe(Vec::new());

        fanout.broadcast(event(1));
        fanout.broadcast(event(2));
        fanout.broadcast(event(3)); // evicts 1

        assert_eq!(queue.dropped_messages(), 1);
        assert_eq!(queue.pop().await.unwrap().seq, 2);
        assert_eq!(queue.pop().await.unwrap().seq, 3);
    }

    #[tokio::test]
    async fn third_overflow_disconnects() {
        let fanout = Fanout::new(1);
        let (_, queue) = fanout.subscribe(Vec::new());

        fanout.broadcast(event(1));
        fanout.broadcast(event(2)); // overflow 1
        fanout.broadcast(event(3)); // overflow 2
        assert_eq!(fanout.subscriber_count(), 1);
        fanout.broadcast(event(4)); // overflow 3: disconnect
        assert_eq!(fanout.subscriber_count(), 0);
        assert_eq!(queue.dropped_messages(), 3);
    }

    #[tokio::test]
    async fn closed_queue_drains_then_ends() {
        let fanout = Fanout::new(4);
        let (id, queue) = fanout.subscribe(Vec::new());
        fanout.broadcast(event(1));
        fanout.remove(id);

        assert_eq!(queue.pop().await.unwrap().seq, 1);
        assert!(queue.pop().await.is_none());
    }
}
