//! Remote-control ingress.
//!
//! Two paths funnel vendor key codes into router commands: the IR/rotary
//! bus sniffer and the Bluetooth LE notification reader. Both share the
//! static key mapping, the per-ingress audio/video mode, and the repeat
//! filter that turns held buttons into repeat fire.

use anyhow::Result;
use axum::routing::get;
use axum::{Json, Router};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::MediaAction;
use crate::config::Config;
use crate::peer::{PeerClient, COMMAND_DEADLINE};

pub mod bt;
pub mod ir;

/// Exit code asking the supervisor to restart this process.
pub const EXIT_RESTART: i32 = 3;

/// Remote device class; some remotes carry dedicated source-select buttons
/// that switch this mode, which then disambiguates navigation keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Audio,
    Video,
}

/// What a key code means before mode resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKey {
    Media(MediaAction),
    VolumeUp,
    VolumeDown,
    NavClock,
    NavCounter,
    Left,
    Right,
    Go,
    Standby,
    SelectMode(DeviceClass),
}

/// Static vendor keymap. Codes follow the datalink convention the bus
/// sniffer and the BT remote share.
pub fn keymap(code: u8) -> Option<RemoteKey> {
    match code {
        0x0c => Some(RemoteKey::Standby),
        0x1e => Some(RemoteKey::NavClock),
        0x1f => Some(RemoteKey::NavCounter),
        0x32 => Some(RemoteKey::Left),
        0x34 => Some(RemoteKey::Right),
        0x35 => Some(RemoteKey::Go),
        0x36 => Some(RemoteKey::Media(MediaAction::Stop)),
        0x60 => Some(RemoteKey::VolumeUp),
        0x64 => Some(RemoteKey::VolumeDown),
        0x75 => Some(RemoteKey::Media(MediaAction::Next)),
        0x76 => Some(RemoteKey::Media(MediaAction::Prev)),
        0x81 => Some(RemoteKey::SelectMode(DeviceClass::Video)),
        0x91 => Some(RemoteKey::SelectMode(DeviceClass::Audio)),
        0x92 => Some(RemoteKey::Media(MediaAction::Play)),
        0x93 => Some(RemoteKey::Media(MediaAction::Pause)),
        _ => None,
    }
}

/// Resolved intent executed against the fabric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterIntent {
    /// `POST /router/command {action}`.
    Command(MediaAction),
    /// Emulated volume wheel tick through the input daemon.
    Volume { up: bool },
    /// Emulated nav wheel tick through the input daemon.
    Nav { clock: bool },
    /// Emulated button press through the input daemon.
    Button(&'static str),
}

/// Release code on both ingress paths.
const RELEASE_CODE: u8 = 0x00;
/// Repeats of a held code swallowed before repeat fire begins.
const REPEAT_THRESHOLD: u32 = 3;

/// Press/hold/release tracker. A key fires on first appearance; identical
/// codes are swallowed until the threshold, then fire as repeats; a release
/// resets the counter.
#[derive(Debug, Default)]
pub struct RepeatFilter {
    last: Option<u8>,
    count: u32,
}

impl RepeatFilter {
    /// Whether this code should produce an intent.
    pub fn feed(&mut self, code: u8) -> bool {
        if code == RELEASE_CODE {
            self.last = None;
            self.count = 0;
            return false;
        }
        if self.last == Some(code) {
            self.count += 1;
            self.count > REPEAT_THRESHOLD
        } else {
            self.last = Some(code);
            self.count = 0;
            true
        }
    }
}

/// Per-ingress translator: keymap + soft mode + repeat filter.
#[derive(Debug)]
pub struct Translator {
    mode: DeviceClass,
    filter: RepeatFilter,
}

impl Default for Translator {
    fn default() -> Self {
        Self {
            mode: DeviceClass::Audio,
            filter: RepeatFilter::default(),
        }
    }
}

impl Translator {
    pub fn mode(&self) -> DeviceClass {
        self.mode
    }

    /// Translate one raw code into an intent, if any.
    pub fn feed(&mut self, code: u8) -> Option<RouterIntent> {
        if !self.filter.feed(code) {
            return None;
        }
        let key = match keymap(code) {
            Some(key) => key,
            None => {
                debug!(code = format!("{:02x}", code), "unmapped key code ignored");
                return None;
            }
        };

        match key {
            RemoteKey::SelectMode(mode) => {
                self.mode = mode;
                None
            }
            RemoteKey::Media(action) => Some(RouterIntent::Command(action)),
            RemoteKey::Standby => Some(RouterIntent::Command(MediaAction::Stop)),
            RemoteKey::Go => Some(RouterIntent::Command(MediaAction::Toggle)),
            RemoteKey::VolumeUp => Some(RouterIntent::Volume { up: true }),
            RemoteKey::VolumeDown => Some(RouterIntent::Volume { up: false }),
            RemoteKey::NavClock => Some(RouterIntent::Nav { clock: true }),
            RemoteKey::NavCounter => Some(RouterIntent::Nav { clock: false }),
            // Navigation arrows are track keys in audio mode, UI nav keys
            // in video mode.
            RemoteKey::Left => Some(match self.mode {
                DeviceClass::Audio => RouterIntent::Command(MediaAction::Prev),
                DeviceClass::Video => RouterIntent::Button("left"),
            }),
            RemoteKey::Right => Some(match self.mode {
                DeviceClass::Audio => RouterIntent::Command(MediaAction::Next),
                DeviceClass::Video => RouterIntent::Button("right"),
            }),
        }
    }
}

/// Executes intents against the router / input daemon.
#[derive(Clone)]
pub struct IntentSink {
    client: PeerClient,
    router_url: String,
    input_url: String,
}

impl IntentSink {
    pub fn new(client: PeerClient, config: &Config) -> Self {
        Self {
            client,
            router_url: config.router_url(),
            input_url: config.input_url(),
        }
    }

    pub async fn dispatch(&self, intent: RouterIntent) {
        let result = match intent {
            RouterIntent::Command(action) => {
                let url = format!("{}/router/command", self.router_url);
                let body = serde_json::json!({ "action": action.as_str() });
                self.client
                    .post_json::<_, serde_json::Value>(&url, &body, COMMAND_DEADLINE)
                    .await
                    .map(|_| ())
            }
            RouterIntent::Volume { up } => {
                self.emulate(
                    "volume",
                    serde_json::json!({
                        "direction": if up { "clock" } else { "counter" },
                        "speed": 1,
                    }),
                )
                .await
            }
            RouterIntent::Nav { clock } => {
                self.emulate(
                    "nav",
                    serde_json::json!({
                        "direction": if clock { "clock" } else { "counter" },
                        "speed": 1,
                    }),
                )
                .await
            }
            RouterIntent::Button(button) => {
                self.emulate("button", serde_json::json!({ "button": button }))
                    .await
            }
        };

        if let Err(e) = result {
            warn!(error = %e, "remote intent not delivered");
        }
    }

    async fn emulate(
        &self,
        kind: &str,
        data: serde_json::Value,
    ) -> Result<(), crate::peer::PeerError> {
        let url = format!("{}/input/emulate", self.input_url);
        let body = serde_json::json!({ "type": kind, "data": data });
        self.client
            .post_json::<_, serde_json::Value>(&url, &body, COMMAND_DEADLINE)
            .await
            .map(|_| ())
    }
}

/// Run both ingress paths plus the liveness endpoint. Returns the process
/// exit code (3 when the BT path defers recovery to the supervisor).
pub async fn run(config: Config, cancel: CancellationToken) -> Result<i32> {
    let client = PeerClient::new();
    let sink = IntentSink::new(client, &config);

    // Liveness surface for the supervisor.
    let started_at = Instant::now();
    let app = Router::new().route(
        "/health",
        get(move || async move {
            Json(serde_json::json!({
                "ok": true,
                "service": "ingress",
                "uptime_secs": started_at.elapsed().as_secs(),
            }))
        }),
    );
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], config.ports.ingress));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("ingress listening on http://{}", addr);
    let health_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move { health_cancel.cancelled().await })
            .await;
    });

    if let Some(device) = config.ingress.ir_device.clone() {
        tokio::spawn(ir::run(device, sink.clone(), cancel.clone()));
    } else {
        info!("no ir_device configured; IR ingress disabled");
    }

    let exit_code = match config.ingress.bt_device.clone() {
        Some(mac) => {
            bt::run(
                config.ingress.bt_adapter.clone(),
                mac,
                sink,
                cancel.clone(),
            )
            .await
        }
        None => {
            info!("no bt_device configured; BT ingress disabled");
            cancel.cancelled().await;
            0
        }
    };

    Ok(exit_code)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn first_press_fires_repeats_swallowed_until_threshold() {
        let mut filter = RepeatFilter::default();
        assert!(filter.feed(0x60)); // press
        assert!(!filter.feed(0x60)); // repeat 1
        assert!(!filter.feed(0x60)); // repeat 2
        assert!(!filter.feed(0x60)); // repeat 3
        assert!(filter.feed(0x60)); // repeat fire begins
        assert!(filter.feed(0x60));
    }

    #[test]
    fn release_resets_the_counter() {
        let mut filter = RepeatFilter::default();
        assert!(filter.feed(0x60));
        assert!(!filter.feed(0x60));
        assert!(!filter.feed(RELEASE_CODE));
        assert!(filter.feed(0x60)); // fresh press again
    }

    #[test]
    fn mode_disambiguates_navigation_arrows() {
        let mut translator = Translator::default();
        assert_eq!(
            translator.feed(0x34),
            Some(RouterIntent::Command(MediaAction::Next))
        );

        // Source-select to video: arrows become UI buttons.
        assert_eq!(translator.feed(0x81), None);
        assert_eq!(translator.mode(), DeviceClass::Video);
        assert_eq!(translator.feed(0x34), Some(RouterIntent::Button("right")));

        // Back to audio.
        translator.feed(0x91);
        assert_eq!(
            translator.feed(0x32),
            Some(RouterIntent::Command(MediaAction::Prev))
        );
    }

    #[test]
    fn volume_keys_become_wheel_ticks() {
        let mut translator = Translator::default();
        assert_eq!(
            translator.feed(0x60),
            Some(RouterIntent::Volume { up: true })
        );
        translator.feed(RELEASE_CODE);
        assert_eq!(
            translator.feed(0x64),
            Some(RouterIntent::Volume { up: false })
        );
    }

    #[test]
    fn unmapped_codes_are_ignored() {
        let mut translator = Translator::default();
        assert_eq!(translator.feed(0x55), None);
    }
}
