//! Hardware-input daemon.
//!
//! Turns the raw HID report stream into a lossless, ordered sequence of
//! semantic input events, hosts the device menu, and fans events out to any
//! number of browser clients. The volume wheel additionally drives the
//! configured volume adapter through the debounced engine, whose reports
//! are relayed to the router.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::fanout::{Fanout, DEFAULT_HIGH_WATER};
use crate::bus::{create_bus, Envelope, EventOrigin, InputEvent, SharedBus};
use crate::config::{Config, VolumeType};
use crate::peer::{PeerClient, COMMAND_DEADLINE};
use crate::volume::{outputs, VolumeDelta, VolumeEngine};

pub mod decode;
pub mod hid;
pub mod menu;
pub mod routes;

use decode::Decoder;
use hid::HidUpstream;

/// Run the input daemon until cancelled.
pub async fn run(config: Config, cancel: CancellationToken) -> Result<()> {
    let bus = create_bus();
    let client = PeerClient::new();

    let fanout = Fanout::new(DEFAULT_HIGH_WATER);
    fanout.start(bus.clone(), cancel.clone());

    let api = routes::InputApi {
        bus: bus.clone(),
        fanout: fanout.clone(),
        menu: Arc::new(RwLock::new(menu::MenuModel::new(config.menu.clone()))),
        hid_connected: Arc::new(AtomicBool::new(false)),
        emulated_events: Arc::new(AtomicU64::new(0)),
        started_at: Instant::now(),
    };

    // Relay volume reports to the router so the UI indicator moves without
    // polling. The router applies the adapter-match rule before
    // rebroadcasting. Subscribed before the engine seeds so the startup
    // reconciliation report is relayed too.
    tokio::spawn(relay_volume_reports(
        bus.subscribe(),
        client.clone(),
        config.router_url(),
        config.volume.kind,
        cancel.clone(),
    ));

    // Volume engine: wheel deltas -> debounced apply on the configured
    // output, seeded once from the output at startup.
    let (volume_tx, volume_rx) = mpsc::channel::<VolumeDelta>(64);
    match outputs::build(&config.volume, &config.player, client.clone()) {
        Ok(adapter) => {
            let mut engine = VolumeEngine::new(
                adapter,
                bus.clone(),
                config.volume.max,
                config.volume.step,
                config.volume.debounce_ms,
            );
            engine.seed().await;
            tokio::spawn(engine.run(volume_rx, cancel.clone()));
        }
        Err(e) => warn!(error = %e, "volume adapter unavailable; wheel input ignored"),
    }

    // HID reader + decode task.
    let queue = hid::spawn_reader(config.hid.clone(), cancel.clone());
    tokio::spawn(decode_task(
        queue,
        bus.clone(),
        api.hid_connected.clone(),
        client.clone(),
        config.clone(),
        volume_tx,
        cancel.clone(),
    ));

    let app = routes::app(api);
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], config.ports.input));
    info!("input daemon listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

/// Consume the report queue, decode, and fan out. Volume events side-feed
/// the engine; the go button doubles as a transport toggle at the router.
async fn decode_task(
    queue: Arc<hid::ReportQueue>,
    bus: SharedBus,
    connected: Arc<AtomicBool>,
    client: PeerClient,
    config: Config,
    volume_tx: mpsc::Sender<VolumeDelta>,
    cancel: CancellationToken,
) {
    let mut decoder = Decoder::new(config.calibration);
    let router_command_url = format!("{}/router/command", config.router_url());

    while let Some(item) = queue.pop(&cancel).await {
        match item {
            HidUpstream::Report(report) => {
                for event in decoder.decode(&report) {
                    dispatch_event(&event, &bus, &volume_tx, &client, &router_command_url).await;
                }
            }
            HidUpstream::Connected => {
                decoder.reset();
                connected.store(true, Ordering::Relaxed);
                let event = InputEvent::DeviceState {
                    connected: true,
                    detail: None,
                };
                bus.stamp(Envelope::input(&event, 0, EventOrigin::Hid));
            }
            HidUpstream::Disconnected { detail } => {
                decoder.reset();
                connected.store(false, Ordering::Relaxed);
                let event = InputEvent::DeviceState {
                    connected: false,
                    detail: Some(detail),
                };
                bus.stamp(Envelope::input(&event, 0, EventOrigin::Hid));
            }
        }
    }

    debug!("decode task stopped");
}

async fn dispatch_event(
    event: &InputEvent,
    bus: &SharedBus,
    volume_tx: &mpsc::Sender<VolumeDelta>,
    client: &PeerClient,
    router_command_url: &str,
) {
    bus.stamp(Envelope::input(event, 0, EventOrigin::Hid));

    match event {
        InputEvent::Volume { direction, speed } => {
            let delta = VolumeDelta {
                direction: *direction,
                speed: *speed,
            };
            if volume_tx.send(delta).await.is_err() {
                debug!("volume engine gone; delta dropped");
            }
        }
        InputEvent::Button { button } if button.eq_ignore_ascii_case("go") => {
            // Front-panel go is the hardware transport toggle.
            let body = serde_json::json!({ "action": "toggle" });
            let client = client.clone();
            let url = router_command_url.to_string();
            tokio::spawn(async move {
                if let Err(e) = client
                    .post_json::<_, serde_json::Value>(&url, &body, COMMAND_DEADLINE)
                    .await
                {
                    debug!(error = %e, "go-button toggle not delivered");
                }
            });
        }
        _ => {}
    }
}

/// Forward locally generated volume reports to the router.
async fn relay_volume_reports(
    mut rx: tokio::sync::broadcast::Receiver<Envelope>,
    client: PeerClient,
    router_url: String,
    volume_kind: VolumeType,
    cancel: CancellationToken,
) {
    let url = format!("{}/router/volume_report", router_url);
    let source = match volume_kind {
        VolumeType::Sonos => "sonos",
        VolumeType::Bluesound => "bluesound",
        _ => "local",
    };

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        };
        if event.kind != "volume_report" {
            continue;
        }
        let Some(volume) = event.data.get("volume").and_then(|v| v.as_u64()) else {
            continue;
        };
        let body = serde_json::json!({ "volume": volume, "source": source });
        if let Err(e) = client
            .post_json::<_, serde_json::Value>(&url, &body, COMMAND_DEADLINE)
            .await
        {
            debug!(error = %e, "volume report relay failed");
        }
    }
}
