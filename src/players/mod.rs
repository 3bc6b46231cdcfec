//! Player adapters.
//!
//! A player actually renders audio (local decoder) or drives a networked
//! speaker that does. Either way it is the single writer for the `state`
//! fields it emits: the router never fabricates playback state. The player
//! service exposes `/command`, `/status` and `/health` and POSTs media
//! snapshots to the router as they change.

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::MediaSnapshot;
use crate::config::{Config, PlayerType};
use crate::peer::{PeerClient, COMMAND_DEADLINE};

pub mod local;
pub mod speaker;

/// Commands a player accepts on its `/command` endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerAction {
    Play,
    Pause,
    Toggle,
    Next,
    Prev,
    Stop,
    VolumeSet { level: u8 },
}

impl PlayerAction {
    pub fn parse(action: &str, params: Option<&serde_json::Value>) -> Option<Self> {
        match action.to_lowercase().as_str() {
            "play" => Some(Self::Play),
            "pause" => Some(Self::Pause),
            "toggle" | "playpause" => Some(Self::Toggle),
            "next" => Some(Self::Next),
            "prev" | "previous" => Some(Self::Prev),
            "stop" => Some(Self::Stop),
            "volume_set" => {
                let level = params?.get("level")?.as_u64()?;
                Some(Self::VolumeSet {
                    level: level.min(100) as u8,
                })
            }
            _ => None,
        }
    }
}

/// A concrete playback backend hosted by the player service.
#[async_trait]
pub trait Player: Send + Sync {
    fn kind(&self) -> PlayerType;

    /// Spawn the backend's long-running work (poll loop, decoder manager).
    async fn start(&self, cancel: CancellationToken) -> Result<()>;

    /// Execute one command. Unknown/unsupported actions are rejected by the
    /// route layer before this is called.
    async fn command(&self, action: PlayerAction, params: Option<serde_json::Value>) -> Result<()>;

    /// Backend-specific status payload.
    async fn status(&self) -> serde_json::Value;
}

/// Posts media snapshots and volume reports to the router on behalf of a
/// backend. Shared by both adapters so the wire behavior stays identical.
#[derive(Clone)]
pub struct RouterReporter {
    client: PeerClient,
    router_url: String,
    player_kind: PlayerType,
}

impl RouterReporter {
    pub fn new(client: PeerClient, router_url: String, player_kind: PlayerType) -> Self {
        Self {
            client,
            router_url,
            player_kind,
        }
    }

    /// POST a snapshot to `POST /router/media`. A `suppressed` answer is
    /// normal operation (another source owns the device), not an error.
    pub async fn post_media(&self, mut snapshot: MediaSnapshot) {
        snapshot.source_id = snapshot.source_id.or_else(|| {
            Some(format!("{:?}", self.player_kind).to_lowercase())
        });
        let url = format!("{}/router/media", self.router_url);
        match self
            .client
            .post_json::<_, serde_json::Value>(&url, &snapshot, COMMAND_DEADLINE)
            .await
        {
            Ok(reply) => {
                if reply.get("status").and_then(|s| s.as_str()) == Some("suppressed") {
                    tracing::debug!(state = %snapshot.state, "media snapshot suppressed by router");
                }
            }
            Err(e) => warn!(error = %e, "media snapshot post failed"),
        }
    }

    /// POST `{volume, source}` to `/router/volume_report`.
    pub async fn post_volume(&self, volume: u8) {
        let url = format!("{}/router/volume_report", self.router_url);
        let body = serde_json::json!({
            "volume": volume,
            "source": format!("{:?}", self.player_kind).to_lowercase(),
        });
        if let Err(e) = self
            .client
            .post_json::<_, serde_json::Value>(&url, &body, COMMAND_DEADLINE)
            .await
        {
            warn!(error = %e, "volume report post failed");
        }
    }
}

// =============================================================================
// Service surface
// =============================================================================

#[derive(Clone)]
struct PlayerService {
    player: Arc<dyn Player>,
    started_at: Instant,
    seq: Arc<std::sync::atomic::AtomicU64>,
}

impl PlayerService {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1
    }
}

#[derive(Deserialize)]
struct CommandRequest {
    action: String,
    #[serde(default)]
    params: Option<serde_json::Value>,
}

async fn command_handler(
    State(service): State<PlayerService>,
    Json(request): Json<CommandRequest>,
) -> impl IntoResponse {
    let Some(action) = PlayerAction::parse(&request.action, request.params.as_ref()) else {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            Json(serde_json::json!({
                "ok": false,
                "error": format!("unknown action: {}", request.action),
                "seq": service.next_seq(),
            })),
        );
    };

    match service.player.command(action, request.params).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "ok": true, "seq": service.next_seq() })),
        ),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({ "ok": false, "error": e.to_string(), "seq": service.next_seq() })),
        ),
    }
}

async fn status_handler(State(service): State<PlayerService>) -> impl IntoResponse {
    let mut status = service.player.status().await;
    if let Some(map) = status.as_object_mut() {
        map.insert("seq".into(), service.next_seq().into());
    }
    Json(status)
}

async fn health_handler(State(service): State<PlayerService>) -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "service": "player",
        "uptime_secs": service.started_at.elapsed().as_secs(),
        "seq": service.next_seq(),
    }))
}

/// Build the backend selected by `player.type` and run the service.
pub async fn run(config: Config, cancel: CancellationToken) -> Result<()> {
    let client = PeerClient::new();
    let reporter = RouterReporter::new(client.clone(), config.router_url(), config.player.kind);

    let player: Arc<dyn Player> = match config.player.kind {
        PlayerType::Sonos | PlayerType::Bluesound => Arc::new(speaker::SpeakerPlayer::new(
            &config.player,
            client.clone(),
            reporter,
        )?),
        PlayerType::Local => Arc::new(local::LocalPlayer::new(&config.local_player, reporter)),
        PlayerType::None => {
            anyhow::bail!("player.type is none; player service has nothing to drive")
        }
    };

    player.start(cancel.clone()).await?;
    info!(kind = ?player.kind(), "player backend started");

    let service = PlayerService {
        player,
        started_at: Instant::now(),
        seq: Arc::new(std::sync::atomic::AtomicU64::new(0)),
    };

    let app = Router::new()
        .route("/command", post(command_handler))
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(service);

    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], config.ports.player));
    info!("player service listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn parses_media_keys() {
        assert_eq!(PlayerAction::parse("play", None), Some(PlayerAction::Play));
        assert_eq!(
            PlayerAction::parse("Previous", None),
            Some(PlayerAction::Prev)
        );
        assert_eq!(PlayerAction::parse("eject", None), None);
    }

    #[test]
    fn volume_set_needs_level() {
        assert_eq!(PlayerAction::parse("volume_set", None), None);
        let params = serde_json::json!({ "level": 130 });
        assert_eq!(
            PlayerAction::parse("volume_set", Some(&params)),
            Some(PlayerAction::VolumeSet { level: 100 })
        );
    }
}
