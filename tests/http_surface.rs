#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! HTTP contract tests for the router and input surfaces.
//!
//! Services are bound to ephemeral loopback ports and driven with a plain
//! reqwest client, the same way the real peers talk to them.

mod mock_peers;

use arcdeck::bus::fanout::{Fanout, DEFAULT_HIGH_WATER};
use arcdeck::bus::{create_bus, SharedBus};
use arcdeck::config::Config;
use arcdeck::input::menu::MenuModel;
use arcdeck::input::routes::{app as input_app, InputApi};
use arcdeck::peer::PeerClient;
use arcdeck::router::routes::app as router_app;
use arcdeck::router::RouterCore;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use mock_peers::MockSource;

async fn serve(app: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

async fn start_router(dir: &tempfile::TempDir) -> (SocketAddr, SharedBus) {
    let mut config: Config = serde_json::from_value(serde_json::json!({
        "default_player": "sonos",
        "player": { "type": "sonos", "ip": "192.168.1.40" },
        "volume": { "type": "sonos" },
    }))
    .unwrap();
    config.state_file = dir
        .path()
        .join("router-state.json")
        .to_string_lossy()
        .into_owned();

    let bus = create_bus();
    let cancel = CancellationToken::new();
    let core = RouterCore::new(&config, bus.clone(), PeerClient::new());
    let handle = core.spawn(cancel.clone());
    let fanout = Fanout::new(DEFAULT_HIGH_WATER);
    fanout.start(bus.clone(), cancel);

    (serve(router_app(handle, bus.clone(), fanout)).await, bus)
}

fn input_api(menu_labels: &[&str]) -> (InputApi, SharedBus) {
    let bus = create_bus();
    let fanout = Fanout::new(DEFAULT_HIGH_WATER);
    let items = menu_labels
        .iter()
        .map(|label| arcdeck::bus::MenuItem {
            label: (*label).to_string(),
            route: format!("menu/{}", label.to_lowercase()),
            source_id: None,
        })
        .collect();
    let api = InputApi {
        bus: bus.clone(),
        fanout,
        menu: Arc::new(RwLock::new(MenuModel::new(items))),
        hid_connected: Arc::new(AtomicBool::new(false)),
        emulated_events: Arc::new(AtomicU64::new(0)),
        started_at: Instant::now(),
    };
    (api, bus)
}

// =============================================================================
// Router surface
// =============================================================================

#[tokio::test]
async fn source_registration_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _bus) = start_router(&dir).await;
    let source = MockSource::start("cd").await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("http://{}/router/source", addr))
        .json(&serde_json::json!({
            "id": "cd",
            "state": "playing",
            "name": "CD",
            "command_url": source.command_url(),
            "player": "local",
            "handles": ["play", "pause", "next", "prev", "stop"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["active_source"], "cd");
    assert!(body["seq"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn unreachable_registration_is_409() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _bus) = start_router(&dir).await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("http://{}/router/source", addr))
        .json(&serde_json::json!({
            "id": "ghost",
            "state": "idle",
            "name": "Ghost",
            "command_url": "http://127.0.0.1:1/command",
            "player": "local",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
}

#[tokio::test]
async fn malformed_source_body_is_400() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _bus) = start_router(&dir).await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("http://{}/router/source", addr))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn media_post_reports_suppression_to_the_caller() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _bus) = start_router(&dir).await;
    let source = MockSource::start("cd").await;
    let http = reqwest::Client::new();

    // Local source takes the device.
    http.post(format!("http://{}/router/source", addr))
        .json(&serde_json::json!({
            "id": "cd",
            "state": "playing",
            "name": "CD",
            "command_url": source.command_url(),
            "player": "local",
            "handles": ["play", "pause"],
        }))
        .send()
        .await
        .unwrap();

    // The speaker's telemetry gets a suppressed status, not an error.
    let response = http
        .post(format!("http://{}/router/media", addr))
        .json(&serde_json::json!({
            "title": "Sonos-X",
            "state": "playing",
            "source_id": "sonos",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "suppressed");
}

#[tokio::test]
async fn status_exposes_full_router_state() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _bus) = start_router(&dir).await;
    let http = reqwest::Client::new();

    let body: serde_json::Value = http
        .get(format!("http://{}/router/status", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["service"], "router");
    assert_eq!(body["active_source"], serde_json::Value::Null);
    assert_eq!(body["subscribers"], 0);
    assert!(body["sources"].is_object());
}

#[tokio::test]
async fn health_answers_quickly() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _bus) = start_router(&dir).await;
    let client = PeerClient::new();
    client
        .probe(
            &format!("http://{}/health", addr),
            arcdeck::peer::HEALTH_DEADLINE,
        )
        .await
        .unwrap();
}

// =============================================================================
// Input surface
// =============================================================================

#[tokio::test]
async fn menu_add_after_inserts_and_broadcasts_once() {
    let (api, bus) = input_api(&["A", "B", "C"]);
    let addr = serve(input_app(api)).await;
    let mut events = bus.subscribe();
    let http = reqwest::Client::new();

    let body: serde_json::Value = http
        .post(format!("http://{}/input/menu", addr))
        .json(&serde_json::json!({
            "action": "add",
            "item": { "label": "D", "route": "menu/d" },
            "after": "B",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["ok"], true);
    let labels: Vec<&str> = body["menu"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["label"].as_str().unwrap())
        .collect();
    assert_eq!(labels, vec!["A", "B", "D", "C"]);

    // Exactly one menu_update with the same ordering.
    let mut updates = 0;
    while let Ok(event) = events.try_recv() {
        if event.kind == "menu_update" {
            updates += 1;
            let broadcast: Vec<&str> = event.data["items"]
                .as_array()
                .unwrap()
                .iter()
                .map(|item| item["label"].as_str().unwrap())
                .collect();
            assert_eq!(broadcast, vec!["A", "B", "D", "C"]);
        }
    }
    assert_eq!(updates, 1);
}

#[tokio::test]
async fn emulated_events_are_marked_but_otherwise_identical() {
    let (api, bus) = input_api(&[]);
    let addr = serve(input_app(api)).await;
    let mut events = bus.subscribe();
    let http = reqwest::Client::new();

    let response = http
        .post(format!("http://{}/input/emulate", addr))
        .json(&serde_json::json!({
            "type": "nav",
            "data": { "direction": "clock", "speed": 2 },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let event = events.try_recv().unwrap();
    assert_eq!(event.kind, "nav");
    assert_eq!(event.data["speed"], 2);
    assert_eq!(
        serde_json::to_value(&event).unwrap()["origin"],
        "emulated"
    );
}

#[tokio::test]
async fn bad_emulated_event_is_400() {
    let (api, _bus) = input_api(&[]);
    let addr = serve(input_app(api)).await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("http://{}/input/emulate", addr))
        .json(&serde_json::json!({
            "type": "warp",
            "data": {},
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn source_telemetry_broadcasts_verbatim() {
    let (api, bus) = input_api(&[]);
    let addr = serve(input_app(api)).await;
    let mut events = bus.subscribe();
    let http = reqwest::Client::new();

    http.post(format!("http://{}/input/broadcast", addr))
        .json(&serde_json::json!({
            "type": "cd_update",
            "data": { "track_count": 12 },
        }))
        .send()
        .await
        .unwrap();

    let event = events.try_recv().unwrap();
    assert_eq!(event.kind, "cd_update");
    assert_eq!(event.data["track_count"], 12);
}

#[tokio::test]
async fn input_status_reports_menu_and_connectivity() {
    let (api, _bus) = input_api(&["A"]);
    let addr = serve(input_app(api)).await;
    let http = reqwest::Client::new();

    let body: serde_json::Value = http
        .get(format!("http://{}/input/status", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["service"], "input");
    assert_eq!(body["connected"], false);
    assert_eq!(body["emulated"], false);
    assert_eq!(body["menu"][0]["label"], "A");
}
