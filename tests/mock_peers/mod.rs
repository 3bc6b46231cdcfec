#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Mock localhost peers for integration testing.
//!
//! Real axum servers on ephemeral loopback ports, so registration probes,
//! depositions and command forwards exercise the actual HTTP path.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// A source peer: `/health`, `/status` and `/command`, with every received
/// command action recorded for assertions.
pub struct MockSource {
    id: String,
    addr: SocketAddr,
    commands: Arc<Mutex<Vec<String>>>,
}

#[derive(Clone)]
struct MockState {
    id: String,
    commands: Arc<Mutex<Vec<String>>>,
}

impl MockSource {
    pub async fn start(id: &str) -> Self {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let state = MockState {
            id: id.to_string(),
            commands: commands.clone(),
        };

        let app = Router::new()
            .route(
                "/health",
                get(|State(state): State<MockState>| async move {
                    Json(serde_json::json!({ "ok": true, "service": state.id }))
                }),
            )
            .route(
                "/status",
                get(|State(state): State<MockState>| async move {
                    Json(serde_json::json!({ "id": state.id, "state": "playing" }))
                }),
            )
            .route(
                "/command",
                post(
                    |State(state): State<MockState>, Json(body): Json<serde_json::Value>| async move {
                        if let Some(action) = body.get("action").and_then(|a| a.as_str()) {
                            state.commands.lock().unwrap().push(action.to_string());
                        }
                        Json(serde_json::json!({ "ok": true }))
                    },
                ),
            )
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            id: id.to_string(),
            addr,
            commands,
        }
    }

    pub fn command_url(&self) -> String {
        format!("http://{}/command", self.addr)
    }

    pub fn received_commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// A router + input daemon stand-in recording everything sources post:
/// source records at `/router/source`, menu mutations at `/input/menu`,
/// telemetry at `/input/broadcast`.
#[allow(dead_code)]
pub struct MockFabric {
    addr: SocketAddr,
    source_posts: Arc<Mutex<Vec<serde_json::Value>>>,
    menu_posts: Arc<Mutex<Vec<serde_json::Value>>>,
    broadcasts: Arc<Mutex<Vec<serde_json::Value>>>,
}

#[derive(Clone)]
struct FabricState {
    source_posts: Arc<Mutex<Vec<serde_json::Value>>>,
    menu_posts: Arc<Mutex<Vec<serde_json::Value>>>,
    broadcasts: Arc<Mutex<Vec<serde_json::Value>>>,
}

#[allow(dead_code)]
impl MockFabric {
    pub async fn start() -> Self {
        let state = FabricState {
            source_posts: Arc::new(Mutex::new(Vec::new())),
            menu_posts: Arc::new(Mutex::new(Vec::new())),
            broadcasts: Arc::new(Mutex::new(Vec::new())),
        };

        let app = Router::new()
            .route(
                "/router/source",
                post(
                    |State(state): State<FabricState>, Json(body): Json<serde_json::Value>| async move {
                        state.source_posts.lock().unwrap().push(body.clone());
                        Json(serde_json::json!({
                            "ok": true,
                            "active_source": body.get("id"),
                            "seq": 1,
                        }))
                    },
                ),
            )
            .route(
                "/input/menu",
                post(
                    |State(state): State<FabricState>, Json(body): Json<serde_json::Value>| async move {
                        state.menu_posts.lock().unwrap().push(body);
                        Json(serde_json::json!({ "ok": true, "menu": [], "seq": 1 }))
                    },
                ),
            )
            .route(
                "/input/broadcast",
                post(
                    |State(state): State<FabricState>, Json(body): Json<serde_json::Value>| async move {
                        state.broadcasts.lock().unwrap().push(body);
                        Json(serde_json::json!({ "ok": true, "seq": 1 }))
                    },
                ),
            )
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            addr,
            source_posts: state.source_posts,
            menu_posts: state.menu_posts,
            broadcasts: state.broadcasts,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn source_posts(&self) -> Vec<serde_json::Value> {
        self.source_posts.lock().unwrap().clone()
    }

    pub fn menu_posts(&self) -> Vec<serde_json::Value> {
        self.menu_posts.lock().unwrap().clone()
    }

    pub fn broadcasts(&self) -> Vec<serde_json::Value> {
        self.broadcasts.lock().unwrap().clone()
    }
}
