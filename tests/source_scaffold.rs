#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Lifecycle tests for the generic source scaffold.
//!
//! A minimal source runs against a recording fabric stand-in; the test
//! asserts the full protocol: registration, menu announcement, the handles
//! set honored exactly, state posting on command, and the graceful gone on
//! shutdown.

mod mock_peers;

use arcdeck::bus::{MediaAction, MenuItem, PlayerKind, SourceState};
use arcdeck::config::Config;
use arcdeck::source::{SourceContext, SourceLogic, SourceService};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use mock_peers::MockFabric;

struct DiscSource;

#[async_trait]
impl SourceLogic for DiscSource {
    fn id(&self) -> &str {
        "cd"
    }

    fn name(&self) -> &str {
        "CD"
    }

    fn player(&self) -> PlayerKind {
        PlayerKind::Local
    }

    fn handles(&self) -> Vec<MediaAction> {
        vec![MediaAction::Play, MediaAction::Pause, MediaAction::Stop]
    }

    fn menu_item(&self) -> Option<MenuItem> {
        Some(MenuItem {
            label: "CD".into(),
            route: "menu/cd".into(),
            source_id: Some("cd".into()),
        })
    }

    async fn command(
        &self,
        action: MediaAction,
        _params: Option<serde_json::Value>,
        ctx: &SourceContext,
    ) -> anyhow::Result<Option<serde_json::Value>> {
        match action {
            MediaAction::Play => {
                ctx.post_state(SourceState::Playing).await?;
                Ok(Some(serde_json::json!({ "track": 1 })))
            }
            MediaAction::Pause => {
                ctx.post_state(SourceState::Paused).await?;
                Ok(None)
            }
            _ => {
                ctx.post_state(SourceState::Idle).await?;
                Ok(None)
            }
        }
    }

    async fn status(&self) -> serde_json::Value {
        serde_json::json!({ "disc_loaded": true })
    }
}

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

async fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
    for _ in 0..100 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread")]
async fn full_source_lifecycle() {
    let fabric = MockFabric::start().await;
    let mut config: Config = serde_json::from_value(serde_json::json!({})).unwrap();
    config.ports.router = fabric.port();
    config.ports.input = fabric.port();

    let port = free_port().await;
    let service = SourceService::new(DiscSource, port, &config);
    let command_url = service.command_url();

    let cancel = CancellationToken::new();
    let task = tokio::spawn(service.run(cancel.clone()));

    // Registration (state idle) and menu announcement arrive.
    wait_until("registration", || !fabric.source_posts().is_empty()).await;
    let registration = fabric.source_posts()[0].clone();
    assert_eq!(registration["id"], "cd");
    assert_eq!(registration["state"], "idle");
    assert_eq!(registration["command_url"], command_url);
    assert_eq!(registration["player"], "local");

    wait_until("menu announcement", || !fabric.menu_posts().is_empty()).await;
    let announcement = fabric.menu_posts()[0].clone();
    assert_eq!(announcement["action"], "add");
    assert_eq!(announcement["item"]["label"], "CD");

    let http = reqwest::Client::new();

    // The declared handles set is honored exactly: next is not in it.
    let response = http
        .post(&command_url)
        .json(&serde_json::json!({ "action": "next" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 405);

    // A declared action executes and posts the transition to the router.
    let response = http
        .post(&command_url)
        .json(&serde_json::json!({ "action": "play" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["playback"]["track"], 1);

    wait_until("playing transition", || {
        fabric
            .source_posts()
            .iter()
            .any(|post| post["state"] == "playing")
    })
    .await;

    // Status merges the scaffold fields with source-specific ones.
    let status: serde_json::Value = http
        .get(command_url.replace("/command", "/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["id"], "cd");
    assert_eq!(status["state"], "playing");
    assert_eq!(status["disc_loaded"], true);

    // Graceful shutdown: gone posted, menu entry withdrawn.
    cancel.cancel();
    task.await.unwrap().unwrap();

    let last = fabric.source_posts().last().cloned().unwrap();
    assert_eq!(last["state"], "gone");
    let withdrawal = fabric.menu_posts().last().cloned().unwrap();
    assert_eq!(withdrawal["action"], "remove");
    assert_eq!(withdrawal["id"], "cd");
}
