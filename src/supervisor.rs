//! Health supervisor.
//!
//! A timer-driven job that probes each configured peer's `/health` endpoint
//! (1 s deadline) and restarts failed peers through the service manager.
//! Strictly non-authoritative: it never synthesizes state updates — a
//! restarted peer rebuilds its own state from its source of truth.

use anyhow::Result;
use std::collections::HashSet;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, SupervisedPeer};
use crate::peer::{PeerClient, HEALTH_DEADLINE};

/// Run the supervisor until cancelled.
pub async fn run(config: Config, cancel: CancellationToken) -> Result<()> {
    let interval = Duration::from_secs(config.supervisor.interval_secs.max(1));
    let client = PeerClient::new();
    // Peers restarted last round; skipped until they probe healthy once so
    // a slow-starting service is not restarted in a loop.
    let mut latched: HashSet<String> = HashSet::new();

    info!(
        peers = config.supervisor.peers.len(),
        interval_secs = interval.as_secs(),
        "supervisor started"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick is immediate; skip it

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for peer in &config.supervisor.peers {
            check_peer(&client, peer, &mut latched).await;
        }
    }

    info!("supervisor stopped");
    Ok(())
}

async fn check_peer(client: &PeerClient, peer: &SupervisedPeer, latched: &mut HashSet<String>) {
    let health_url = format!("{}/health", peer.url.trim_end_matches('/'));
    let live = client.probe(&health_url, HEALTH_DEADLINE).await.is_ok();
    let os_failed = unit_failed(&peer.unit).await;

    if live && !os_failed {
        if latched.remove(&peer.name) {
            info!(peer = %peer.name, "peer recovered; failure latch cleared");
        } else {
            debug!(peer = %peer.name, "peer healthy");
        }
        return;
    }

    if latched.contains(&peer.name) {
        debug!(peer = %peer.name, "peer still down; restart already issued");
        return;
    }

    warn!(peer = %peer.name, live, os_failed, "peer unhealthy; restarting");
    restart_unit(&peer.unit).await;
    latched.insert(peer.name.clone());
}

async fn unit_failed(unit: &str) -> bool {
    match Command::new("systemctl")
        .args(["is-failed", "--quiet", unit])
        .status()
        .await
    {
        // is-failed exits 0 when the unit is in the failed state.
        Ok(status) => status.success(),
        Err(e) => {
            debug!(unit, error = %e, "systemctl not available");
            false
        }
    }
}

async fn restart_unit(unit: &str) {
    match Command::new("systemctl")
        .args(["restart", unit])
        .output()
        .await
    {
        Ok(output) if output.status.success() => info!(unit, "unit restarted"),
        Ok(output) => warn!(
            unit,
            code = output.status.code(),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "unit restart failed"
        ),
        Err(e) => warn!(unit, error = %e, "systemctl restart not runnable"),
    }
}
