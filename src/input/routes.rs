//! Input daemon HTTP and WebSocket surface.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::bus::fanout::{serve_socket, Fanout};
use crate::bus::{Envelope, EventOrigin, InputEvent, SharedBus};
use crate::input::menu::{MenuModel, MenuRequest};

/// Shared input service state.
#[derive(Clone)]
pub struct InputApi {
    pub bus: SharedBus,
    pub fanout: Arc<Fanout>,
    pub menu: Arc<RwLock<MenuModel>>,
    pub hid_connected: Arc<AtomicBool>,
    pub emulated_events: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl InputApi {
    /// Broadcast the current menu to every subscriber.
    pub async fn broadcast_menu(&self) {
        let snapshot = self.menu.read().await.snapshot();
        self.bus.stamp(Envelope::menu_update(&snapshot, 0));
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn menu_handler(
    State(api): State<InputApi>,
    Json(request): Json<MenuRequest>,
) -> impl IntoResponse {
    let outcome = api.menu.write().await.apply(request);
    match outcome {
        Ok(changed) => {
            if changed {
                api.broadcast_menu().await;
            }
            let menu = api.menu.read().await.snapshot();
            (
                StatusCode::OK,
                Json(serde_json::json!({ "ok": true, "menu": menu, "seq": api.bus.next_seq() })),
            )
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "ok": false, "error": e.to_string() })),
        ),
    }
}

#[derive(Deserialize)]
struct EmulateRequest {
    #[serde(rename = "type")]
    kind: String,
    data: serde_json::Value,
}

/// `POST /input/emulate`: treated identically to a decoded event apart from
/// the origin marker.
async fn emulate_handler(
    State(api): State<InputApi>,
    Json(request): Json<EmulateRequest>,
) -> impl IntoResponse {
    let tagged = serde_json::json!({ "type": request.kind, "data": request.data });
    match serde_json::from_value::<InputEvent>(tagged) {
        Ok(event) => {
            api.emulated_events.fetch_add(1, Ordering::Relaxed);
            api.bus
                .stamp(Envelope::input(&event, 0, EventOrigin::Emulated));
            (
                StatusCode::OK,
                Json(serde_json::json!({ "ok": true, "seq": api.bus.next_seq() })),
            )
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "ok": false, "error": format!("bad event: {}", e) })),
        ),
    }
}

#[derive(Deserialize)]
struct BroadcastRequest {
    #[serde(rename = "type")]
    kind: String,
    data: serde_json::Value,
    #[serde(default)]
    reason: Option<String>,
}

/// `POST /input/broadcast`: source-specific telemetry (`<id>_update`)
/// fanned out verbatim to subscribers.
async fn broadcast_handler(
    State(api): State<InputApi>,
    Json(request): Json<BroadcastRequest>,
) -> impl IntoResponse {
    let mut envelope = Envelope::new(request.kind, request.data, 0);
    envelope.reason = request.reason;
    api.bus.stamp(envelope);
    (
        StatusCode::OK,
        Json(serde_json::json!({ "ok": true, "seq": api.bus.next_seq() })),
    )
}

async fn status_handler(State(api): State<InputApi>) -> impl IntoResponse {
    let menu = api.menu.read().await.snapshot();
    Json(serde_json::json!({
        "service": "input",
        "uptime_secs": api.started_at.elapsed().as_secs(),
        "menu": menu,
        "connected": api.hid_connected.load(Ordering::Relaxed),
        "emulated": api.emulated_events.load(Ordering::Relaxed) > 0,
        "subscribers": api.fanout.subscriber_count(),
        "dropped_messages": api.fanout.total_dropped(),
        "seq": api.bus.next_seq(),
    }))
}

async fn health_handler(State(api): State<InputApi>) -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "service": "input",
        "uptime_secs": api.started_at.elapsed().as_secs(),
    }))
}

/// `GET /input/ws`: realtime events only — no backlog, but the current menu
/// arrives once as a `menu_update`.
async fn ws_handler(State(api): State<InputApi>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let menu = api.menu.read().await.snapshot();
    ws.on_upgrade(move |socket| async move {
        let replay = vec![Envelope::menu_update(&menu, api.bus.next_seq())];
        let (id, queue) = api.fanout.subscribe(replay);
        serve_socket(socket, id, queue, api.fanout.clone()).await;
    })
}

/// Assemble the input daemon's router.
pub fn app(api: InputApi) -> Router {
    Router::new()
        .route("/input/menu", post(menu_handler))
        .route("/input/emulate", post(emulate_handler))
        .route("/input/broadcast", post(broadcast_handler))
        .route("/input/status", get(status_handler))
        .route("/input/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(api)
}
