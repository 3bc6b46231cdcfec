//! Router HTTP and WebSocket surface.
//!
//! Handlers never touch router state directly; they post messages to the
//! state task and answer with whatever comes back. Overload is a
//! synchronous 503, never a queued command.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bus::fanout::{serve_socket, Fanout, DEFAULT_HIGH_WATER};
use crate::bus::{create_bus, MediaSnapshot, SharedBus, SourceRecord};
use crate::config::Config;
use crate::peer::PeerClient;
use crate::router::{MediaStatus, Overloaded, RouterCore, RouterHandle};

#[derive(Clone)]
pub struct RouterApi {
    handle: RouterHandle,
    fanout: Arc<Fanout>,
    bus: SharedBus,
    started_at: Instant,
}

fn overloaded() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "status": "overloaded" })),
    )
}

// =============================================================================
// Handlers
// =============================================================================

async fn source_handler(
    State(api): State<RouterApi>,
    Json(record): Json<SourceRecord>,
) -> impl IntoResponse {
    match api.handle.post_source(record).await {
        Ok(reply) => {
            let code = StatusCode::from_u16(reply.code).unwrap_or(StatusCode::OK);
            let mut body = serde_json::to_value(&reply).unwrap_or_default();
            if let Some(map) = body.as_object_mut() {
                map.insert("seq".into(), api.bus.next_seq().into());
            }
            (code, Json(body))
        }
        Err(Overloaded) => overloaded(),
    }
}

async fn media_handler(
    State(api): State<RouterApi>,
    Json(snapshot): Json<MediaSnapshot>,
) -> impl IntoResponse {
    match api.handle.post_media(snapshot).await {
        Ok(status) => {
            let token = match status {
                MediaStatus::Ok => "ok",
                MediaStatus::Suppressed => "suppressed",
            };
            (
                StatusCode::OK,
                Json(serde_json::json!({ "status": token, "seq": api.bus.next_seq() })),
            )
        }
        Err(Overloaded) => overloaded(),
    }
}

#[derive(Deserialize)]
struct CommandRequest {
    action: String,
    #[serde(default)]
    params: Option<serde_json::Value>,
}

async fn command_handler(
    State(api): State<RouterApi>,
    Json(request): Json<CommandRequest>,
) -> impl IntoResponse {
    match api.handle.command(request.action, request.params).await {
        Ok(reply) => {
            let code = StatusCode::from_u16(reply.code).unwrap_or(StatusCode::OK);
            let mut body = serde_json::to_value(&reply).unwrap_or_default();
            if let Some(map) = body.as_object_mut() {
                map.insert("seq".into(), api.bus.next_seq().into());
            }
            (code, Json(body))
        }
        Err(Overloaded) => overloaded(),
    }
}

#[derive(Deserialize)]
struct VolumeReportRequest {
    volume: u8,
    source: String,
}

async fn volume_report_handler(
    State(api): State<RouterApi>,
    Json(request): Json<VolumeReportRequest>,
) -> impl IntoResponse {
    match api.handle.volume_report(request.volume, request.source).await {
        Ok(status) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": status, "seq": api.bus.next_seq() })),
        ),
        Err(Overloaded) => overloaded(),
    }
}

#[derive(Deserialize)]
struct OverrideRequest {
    force: bool,
}

async fn override_handler(
    State(api): State<RouterApi>,
    Json(request): Json<OverrideRequest>,
) -> impl IntoResponse {
    match api.handle.set_override(request.force).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "ok": true, "seq": api.bus.next_seq() })),
        ),
        Err(Overloaded) => overloaded(),
    }
}

async fn status_handler(State(api): State<RouterApi>) -> impl IntoResponse {
    match api.handle.status().await {
        Ok(mut status) => {
            if let Some(map) = status.as_object_mut() {
                map.insert("subscribers".into(), api.fanout.subscriber_count().into());
                map.insert("dropped_messages".into(), api.fanout.total_dropped().into());
                map.insert("seq".into(), api.bus.next_seq().into());
            }
            (StatusCode::OK, Json(status))
        }
        Err(Overloaded) => overloaded(),
    }
}

async fn health_handler(State(api): State<RouterApi>) -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "service": "router",
        "uptime_secs": api.started_at.elapsed().as_secs(),
    }))
}

/// `GET /router/ws`: each new subscriber receives the cached snapshot once
/// (reason `client_connect`), then every accepted broadcast in order.
async fn ws_handler(State(api): State<RouterApi>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let last_media = match api.handle.status().await {
        Ok(status) => status
            .get("last_media")
            .cloned()
            .filter(|v| !v.is_null())
            .map(|v| serde_json::from_value::<MediaSnapshot>(v).unwrap_or_default()),
        Err(Overloaded) => None,
    };

    ws.on_upgrade(move |socket| async move {
        let replay = RouterCore::replay_snapshot(&last_media, api.bus.next_seq())
            .into_iter()
            .collect();
        let (id, queue) = api.fanout.subscribe(replay);
        serve_socket(socket, id, queue, api.fanout.clone()).await;
    })
}

// =============================================================================
// Assembly
// =============================================================================

/// Build the router app around an already-spawned state task. Split out so
/// integration tests can drive the full HTTP surface on an ephemeral port.
pub fn app(handle: RouterHandle, bus: SharedBus, fanout: Arc<Fanout>) -> Router {
    let api = RouterApi {
        handle,
        fanout,
        bus,
        started_at: Instant::now(),
    };

    Router::new()
        .route("/router/source", post(source_handler))
        .route("/router/media", post(media_handler))
        .route("/router/command", post(command_handler))
        .route("/router/volume_report", post(volume_report_handler))
        .route("/router/playback_override", post(override_handler))
        .route("/router/status", get(status_handler))
        .route("/router/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(api)
}

/// Run the router service until cancelled.
pub async fn run(config: Config, cancel: CancellationToken) -> anyhow::Result<()> {
    let bus = create_bus();
    let client = PeerClient::new();

    let mut core = RouterCore::new(&config, bus.clone(), client);
    core.restore().await;
    let handle = core.spawn(cancel.clone());

    let fanout = Fanout::new(DEFAULT_HIGH_WATER);
    fanout.start(bus.clone(), cancel.clone());

    let app = app(handle, bus, fanout);
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], config.ports.router));
    info!("router listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
