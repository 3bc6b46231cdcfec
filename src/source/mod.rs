//! Generic source-adapter scaffold.
//!
//! A source is a long-running localhost HTTP server owning one content
//! domain. Concrete sources implement [`SourceLogic`]; the [`SourceService`]
//! wrapper owns the whole lifecycle protocol — registration with the
//! router, menu announcement at the input daemon, the `/command` server
//! honoring the declared handles exactly, state posting as transitions
//! occur, and a graceful `state=gone` inside the shutdown grace period.

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{MediaAction, MenuItem, PlayerKind, SourceRecord, SourceState};
use crate::config::Config;
use crate::peer::{PeerClient, PeerError, COMMAND_DEADLINE};

/// Grace period for posting `state=gone` on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);
/// Registration retry backoff bounds.
const REGISTER_INITIAL: Duration = Duration::from_secs(2);
const REGISTER_MAX: Duration = Duration::from_secs(30);

/// Source-domain logic. Implementors own content; the service owns the
/// protocol.
#[async_trait]
pub trait SourceLogic: Send + Sync + 'static {
    /// Stable short id, e.g. "cd", "radio", "usb".
    fn id(&self) -> &str;

    /// Human label for the menu and status surfaces.
    fn name(&self) -> &str;

    /// Whether this source plays on the device or a networked speaker.
    fn player(&self) -> PlayerKind;

    /// Actions the source accepts. The service enforces this set exactly.
    fn handles(&self) -> Vec<MediaAction>;

    /// Menu entry announced at startup and removed on shutdown.
    fn menu_item(&self) -> Option<MenuItem>;

    /// UI preset identifier carried on the source record.
    fn menu_preset(&self) -> Option<String> {
        None
    }

    /// Execute one declared action. Undeclared actions never reach this.
    /// Returns an optional playback payload echoed to the caller.
    async fn command(
        &self,
        action: MediaAction,
        params: Option<serde_json::Value>,
        ctx: &SourceContext,
    ) -> Result<Option<serde_json::Value>>;

    /// Source-specific status payload.
    async fn status(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Optional content loop (folder watching, disc polling). Runs until
    /// the context's shutdown token fires.
    async fn run(&self, ctx: SourceContext) -> Result<()> {
        ctx.shutdown.cancelled().await;
        Ok(())
    }
}

/// Handle a source uses to talk back into the fabric.
#[derive(Clone)]
pub struct SourceContext {
    client: PeerClient,
    router_url: String,
    input_url: String,
    record: Arc<RwLock<SourceRecord>>,
    pub shutdown: CancellationToken,
}

impl SourceContext {
    /// Post a state transition to the router. Transitions are posted as
    /// they occur, never on a schedule.
    pub async fn post_state(&self, state: SourceState) -> Result<(), PeerError> {
        let record = {
            let mut record = self.record.write().await;
            record.state = state;
            record.clone()
        };
        let url = format!("{}/router/source", self.router_url);
        self.client
            .post_json::<_, serde_json::Value>(&url, &record, COMMAND_DEADLINE)
            .await
            .map(|_| ())
    }

    /// Publish source-specific telemetry (`<id>_update`) through the input
    /// daemon's broadcast endpoint.
    pub async fn broadcast(&self, data: serde_json::Value) {
        let kind = {
            let record = self.record.read().await;
            format!("{}_update", record.id)
        };
        let url = format!("{}/input/broadcast", self.input_url);
        let body = serde_json::json!({ "type": kind, "data": data });
        if let Err(e) = self
            .client
            .post_json::<_, serde_json::Value>(&url, &body, COMMAND_DEADLINE)
            .await
        {
            debug!(error = %e, "source telemetry broadcast failed");
        }
    }

    pub async fn current_state(&self) -> SourceState {
        self.record.read().await.state
    }
}

// =============================================================================
// Service
// =============================================================================

struct SourceApi<T: SourceLogic> {
    logic: Arc<T>,
    ctx: SourceContext,
    handles: Arc<Vec<MediaAction>>,
    started_at: Instant,
    seq: Arc<std::sync::atomic::AtomicU64>,
}

// Manual impl: the derive would demand T: Clone, but only the Arc is
// cloned.
impl<T: SourceLogic> Clone for SourceApi<T> {
    fn clone(&self) -> Self {
        Self {
            logic: self.logic.clone(),
            ctx: self.ctx.clone(),
            handles: self.handles.clone(),
            started_at: self.started_at,
            seq: self.seq.clone(),
        }
    }
}

impl<T: SourceLogic> SourceApi<T> {
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

async fn command_handler<T: SourceLogic>(
    State(api): State<SourceApi<T>>,
    Json(request): Json<CommandRequest>,
) -> impl IntoResponse {
    // The declared handles set is honored exactly: anything else is a 405,
    // never a silent drop.
    let action = MediaAction::parse(&request.action);
    let allowed = action.map(|a| api.handles.contains(&a)).unwrap_or(false);
    let Some(action) = action.filter(|_| allowed) else {
        warn!(action = %request.action, source = api.logic.id(), "command outside declared handles");
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            Json(serde_json::json!({
                "ok": false,
                "error": format!("unhandled action: {}", request.action),
                "seq": api.next_seq(),
            })),
        );
    };

    match api.logic.command(action, request.params, &api.ctx).await {
        Ok(playback) => {
            let mut body = serde_json::json!({ "ok": true, "seq": api.next_seq() });
            if let (Some(map), Some(playback)) = (body.as_object_mut(), playback) {
                map.insert("playback".into(), playback);
            }
            (StatusCode::OK, Json(body))
        }
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({ "ok": false, "error": e.to_string(), "seq": api.next_seq() })),
        ),
    }
}

async fn status_handler<T: SourceLogic>(State(api): State<SourceApi<T>>) -> impl IntoResponse {
    let state = api.ctx.current_state().await;
    let mut body = serde_json::json!({
        "id": api.logic.id(),
        "name": api.logic.name(),
        "state": state,
        "seq": api.next_seq(),
    });
    let detail = api.logic.status().await;
    if let (Some(map), Some(extra)) = (body.as_object_mut(), detail.as_object()) {
        for (key, value) in extra {
            map.insert(key.clone(), value.clone());
        }
    }
    Json(body)
}

async fn health_handler<T: SourceLogic>(State(api): State<SourceApi<T>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "service": api.logic.id(),
        "uptime_secs": api.started_at.elapsed().as_secs(),
        "seq": api.next_seq(),
    }))
}

/// Runs one source: HTTP server, registration, menu announcement, graceful
/// exit. The whole lifecycle protocol lives here so concrete sources only
/// write domain logic.
pub struct SourceService<T: SourceLogic> {
    logic: Arc<T>,
    port: u16,
    router_url: String,
    input_url: String,
}

impl<T: SourceLogic> SourceService<T> {
    pub fn new(logic: T, port: u16, config: &Config) -> Self {
        Self {
            logic: Arc::new(logic),
            port,
            router_url: config.router_url(),
            input_url: config.input_url(),
        }
    }

    /// URL the router reaches this source's commands at.
    pub fn command_url(&self) -> String {
        format!("http://127.0.0.1:{}/command", self.port)
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let client = PeerClient::new();
        let record = Arc::new(RwLock::new(SourceRecord {
            id: self.logic.id().to_string(),
            state: SourceState::Idle,
            name: self.logic.name().to_string(),
            command_url: self.command_url(),
            player: self.logic.player(),
            handles: self.logic.handles(),
            menu_preset: self.logic.menu_preset(),
        }));

        let ctx = SourceContext {
            client: client.clone(),
            router_url: self.router_url.clone(),
            input_url: self.input_url.clone(),
            record: record.clone(),
            shutdown: cancel.child_token(),
        };

        let api = SourceApi {
            logic: self.logic.clone(),
            ctx: ctx.clone(),
            handles: Arc::new(self.logic.handles()),
            started_at: Instant::now(),
            seq: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        };

        let app = Router::new()
            .route("/command", post(command_handler::<T>))
            .route("/status", get(status_handler::<T>))
            .route("/health", get(health_handler::<T>))
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(api);

        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], self.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(source = self.logic.id(), "source listening on http://{}", addr);

        // The HTTP surface must be up before registration: the router
        // probes command_url and refuses unreachable registrations.
        let server_cancel = cancel.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_cancel.cancelled().await })
                .await
        });

        self.register_with_retry(&ctx, &cancel).await;
        self.announce_menu(&client).await;

        // Content loop until shutdown.
        let logic = self.logic.clone();
        let run_ctx = ctx.clone();
        let content = tokio::spawn(async move { logic.run(run_ctx).await });

        cancel.cancelled().await;

        // Graceful exit: gone + menu removal, bounded by the grace period.
        let farewell = async {
            if let Err(e) = ctx.post_state(SourceState::Gone).await {
                warn!(error = %e, "gone transition not delivered");
            }
            self.withdraw_menu(&client).await;
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, farewell).await.is_err() {
            warn!(source = self.logic.id(), "shutdown grace period elapsed");
        }

        content.abort();
        let _ = server.await;
        Ok(())
    }

    async fn register_with_retry(&self, ctx: &SourceContext, cancel: &CancellationToken) {
        let mut delay = REGISTER_INITIAL;
        loop {
            match ctx.post_state(SourceState::Idle).await {
                Ok(()) => {
                    info!(source = self.logic.id(), "registered with router");
                    return;
                }
                Err(e) => {
                    warn!(source = self.logic.id(), error = %e, "registration failed, retrying in {:?}", delay);
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {
                    delay = (delay * 2).min(REGISTER_MAX);
                }
            }
        }
    }

    async fn announce_menu(&self, client: &PeerClient) {
        let Some(item) = self.logic.menu_item() else {
            return;
        };
        let url = format!("{}/input/menu", self.input_url);
        let body = serde_json::json!({ "action": "add", "item": item });
        if let Err(e) = client
            .post_json::<_, serde_json::Value>(&url, &body, COMMAND_DEADLINE)
            .await
        {
            warn!(source = self.logic.id(), error = %e, "menu announcement failed");
        }
    }

    async fn withdraw_menu(&self, client: &PeerClient) {
        if self.logic.menu_item().is_none() {
            return;
        }
        let url = format!("{}/input/menu", self.input_url);
        let body = serde_json::json!({ "action": "remove", "id": self.logic.id() });
        if let Err(e) = client
            .post_json::<_, serde_json::Value>(&url, &body, COMMAND_DEADLINE)
            .await
        {
            debug!(source = self.logic.id(), error = %e, "menu withdrawal failed");
        }
    }
}
