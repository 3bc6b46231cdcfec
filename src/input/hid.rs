//! Blocking HID report reader.
//!
//! The HID endpoint is owned exclusively by one reader worker; nothing else
//! touches the device file. Reads run on a blocking thread and feed a
//! bounded drop-oldest queue — stale positions are cheap to lose, the
//! decoder only cares about the freshest state. Endpoint errors reopen the
//! device with exponential backoff (1 s -> 30 s) without ever disconnecting
//! subscribers.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HidConfig;

/// Bounded report queue capacity.
const QUEUE_CAPACITY: usize = 64;
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// What the reader worker pushes upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum HidUpstream {
    /// One raw report frame.
    Report(Vec<u8>),
    /// Endpoint opened (or re-opened). The decoder should reset its table.
    Connected,
    /// Endpoint lost; reopening with backoff. Subscribers stay connected.
    Disconnected { detail: String },
}

/// Drop-oldest queue between the blocking reader and the decode task.
pub struct ReportQueue {
    inner: Mutex<VecDeque<HidUpstream>>,
    notify: Notify,
    capacity: usize,
}

impl ReportQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        })
    }

    /// Push one item; evicts the oldest report when full. Lifecycle
    /// markers are never evicted ahead of delivery.
    pub fn push(&self, item: HidUpstream) {
        if let Ok(mut queue) = self.inner.lock() {
            if queue.len() >= self.capacity {
                // Prefer dropping a stale report over a lifecycle marker.
                if let Some(index) = queue
                    .iter()
                    .position(|entry| matches!(entry, HidUpstream::Report(_)))
                {
                    queue.remove(index);
                } else {
                    queue.pop_front();
                }
            }
            queue.push_back(item);
        }
        self.notify.notify_one();
    }

    pub async fn pop(&self, cancel: &CancellationToken) -> Option<HidUpstream> {
        loop {
            if let Ok(mut queue) = self.inner.lock() {
                if let Some(item) = queue.pop_front() {
                    return Some(item);
                }
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().map(|q| q.len()).unwrap_or(0)
    }
}

/// Spawn the blocking reader worker. Returns the queue the decode task
/// consumes.
pub fn spawn_reader(config: HidConfig, cancel: CancellationToken) -> Arc<ReportQueue> {
    let queue = ReportQueue::new(QUEUE_CAPACITY);
    let worker_queue = queue.clone();

    tokio::task::spawn_blocking(move || read_loop(config, worker_queue, cancel));
    queue
}

fn read_loop(config: HidConfig, queue: Arc<ReportQueue>, cancel: CancellationToken) {
    let mut backoff = BACKOFF_INITIAL;

    while !cancel.is_cancelled() {
        let mut device = match std::fs::File::open(&config.device) {
            Ok(device) => device,
            Err(e) => {
                debug!(device = %config.device, error = %e, "HID open failed, backing off");
                queue.push(HidUpstream::Disconnected {
                    detail: e.to_string(),
                });
                sleep_with_cancel(backoff, &cancel);
                backoff = (backoff * 2).min(BACKOFF_MAX);
                continue;
            }
        };

        info!(device = %config.device, "HID endpoint open");
        queue.push(HidUpstream::Connected);
        backoff = BACKOFF_INITIAL;

        let mut report = vec![0u8; config.report_len];
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match device.read_exact(&mut report) {
                Ok(()) => queue.push(HidUpstream::Report(report.clone())),
                Err(e) => {
                    warn!(device = %config.device, error = %e, "HID read failed, reopening");
                    queue.push(HidUpstream::Disconnected {
                        detail: e.to_string(),
                    });
                    break;
                }
            }
        }

        sleep_with_cancel(backoff, &cancel);
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

fn sleep_with_cancel(duration: Duration, cancel: &CancellationToken) {
    // Coarse slices so a shutdown does not wait out the full backoff.
    let slice = Duration::from_millis(250);
    let mut remaining = duration;
    while !remaining.is_zero() && !cancel.is_cancelled() {
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_preserves_order() {
        let queue = ReportQueue::new(8);
        queue.push(HidUpstream::Report(vec![1]));
        queue.push(HidUpstream::Report(vec![2]));

        let cancel = CancellationToken::new();
        assert_eq!(
            queue.pop(&cancel).await,
            Some(HidUpstream::Report(vec![1]))
        );
        assert_eq!(
            queue.pop(&cancel).await,
            Some(HidUpstream::Report(vec![2]))
        );
    }

    #[tokio::test]
    async fn overflow_drops_oldest_report_not_markers() {
        let queue = ReportQueue::new(2);
        queue.push(HidUpstream::Connected);
        queue.push(HidUpstream::Report(vec![1]));
        queue.push(HidUpstream::Report(vec![2])); // evicts report [1]

        assert_eq!(queue.len(), 2);
        let cancel = CancellationToken::new();
        assert_eq!(queue.pop(&cancel).await, Some(HidUpstream::Connected));
        assert_eq!(
            queue.pop(&cancel).await,
            Some(HidUpstream::Report(vec![2]))
        );
    }

    #[tokio::test]
    async fn cancelled_pop_returns_none() {
        let queue = ReportQueue::new(2);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(queue.pop(&cancel).await, None);
    }
}
