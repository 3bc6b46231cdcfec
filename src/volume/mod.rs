//! Volume adapters and the debounced volume engine.
//!
//! Wheel input arrives as speed-signed deltas; the engine accumulates them,
//! coalesces bursts within a debounce window, clamps to the configured
//! safety ceiling and applies the result through the selected
//! [`VolumeAdapter`]. Exactly one volume report is broadcast per window.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{Envelope, SharedBus, SpinDirection};
use crate::config::VolumeType;

pub mod outputs;

/// A concrete volume output path.
///
/// `apply` must be idempotent: applying the same level twice is
/// indistinguishable from applying it once.
#[async_trait]
pub trait VolumeAdapter: Send + Sync {
    /// Which configured output this adapter drives.
    fn kind(&self) -> VolumeType;

    /// Set the level (0..=100 before clamping) and optional balance
    /// (-50..=+50). Returns the level actually set after clamping to the
    /// configured ceiling.
    async fn apply(&self, level: u8, balance: Option<i8>) -> Result<u8>;

    /// Power the output on or off where the hardware supports it.
    async fn power(&self, _on: bool) -> Result<()> {
        Ok(())
    }

    /// Current level, for reconciliation on startup and reconnect.
    async fn report(&self) -> Result<u8>;
}

/// One wheel burst: direction plus detents-per-interval.
#[derive(Debug, Clone, Copy)]
pub struct VolumeDelta {
    pub direction: SpinDirection,
    pub speed: u32,
}

/// Pending wheel movement between debounce flushes.
#[derive(Debug, Default)]
pub struct Accumulator {
    pending: i32,
}

impl Accumulator {
    pub fn add(&mut self, delta: VolumeDelta) {
        self.pending += delta.direction.sign() * delta.speed as i32;
    }

    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    /// Drain the accumulated detent count.
    pub fn take(&mut self) -> i32 {
        std::mem::take(&mut self.pending)
    }
}

/// Debounced volume engine. Owns the adapter and the current level; runs as
/// a single task so no locking is needed around the accumulator.
pub struct VolumeEngine {
    adapter: Arc<dyn VolumeAdapter>,
    bus: SharedBus,
    max: u8,
    step: u8,
    debounce: Duration,
    level: u8,
}

impl VolumeEngine {
    pub fn new(adapter: Arc<dyn VolumeAdapter>, bus: SharedBus, max: u8, step: u8, debounce_ms: u64) -> Self {
        Self {
            adapter,
            bus,
            max,
            step,
            debounce: Duration::from_millis(debounce_ms),
            level: 0,
        }
    }

    /// Reconcile with the output and broadcast the seed report once.
    pub async fn seed(&mut self) {
        match self.adapter.report().await {
            Ok(level) => {
                self.level = level.min(self.max);
                info!(level = self.level, adapter = ?self.adapter.kind(), "volume seeded from output");
                self.broadcast_report();
            }
            Err(e) => warn!(adapter = ?self.adapter.kind(), error = %e, "volume seed report failed"),
        }
    }

    /// Consume wheel deltas until cancelled. Each burst is coalesced within
    /// the debounce window, then applied and reported exactly once.
    pub async fn run(mut self, mut rx: mpsc::Receiver<VolumeDelta>, cancel: CancellationToken) {
        let mut acc = Accumulator::default();

        loop {
            // Wait for the first delta of a burst.
            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                delta = rx.recv() => match delta {
                    Some(d) => d,
                    None => break,
                },
            };
            acc.add(first);

            // Coalesce everything that arrives within the window.
            loop {
                match tokio::time::timeout(self.debounce, rx.recv()).await {
                    Ok(Some(delta)) => acc.add(delta),
                    Ok(None) => break,
                    Err(_) => break,
                }
            }

            self.flush(&mut acc).await;
        }

        debug!("volume engine stopped");
    }

    /// Apply the pending movement. At the ceiling, further positive deltas
    /// still produce a report so the UI can show the pinned level.
    async fn flush(&mut self, acc: &mut Accumulator) {
        let detents = acc.take();
        if detents == 0 {
            return;
        }

        let target = (self.level as i32 + detents * self.step as i32).clamp(0, self.max as i32) as u8;

        match self.adapter.apply(target, None).await {
            Ok(applied) => {
                self.level = applied.min(self.max);
                self.broadcast_report();
            }
            Err(e) => warn!(adapter = ?self.adapter.kind(), error = %e, "volume apply failed"),
        }
    }

    fn broadcast_report(&self) {
        self.bus.stamp(Envelope::new(
            "volume_report",
            serde_json::json!({ "volume": self.level, "source": format!("{:?}", self.adapter.kind()).to_lowercase() }),
            0,
        ));
    }

    pub fn level(&self) -> u8 {
        self.level
    }
}

/// Clamp helper shared by the output backends.
pub(crate) fn clamp_level(level: u8, max: u8) -> u8 {
    level.min(max).min(100)
}
