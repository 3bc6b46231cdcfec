//! Event router: the authoritative active-source state machine.
//!
//! The router owns the source table, is the single writer of the media
//! snapshot the UI sees, and is the single destination for remote-control
//! intents. All state lives in one task; HTTP handlers post messages over a
//! bounded channel and get their answer on a oneshot. Pure transitions are
//! atomic; only outbound probes, depositions and command forwards suspend.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{
    Envelope, MediaAction, MediaSnapshot, PlaybackState, PlayerKind, SharedBus, SourceRecord,
    SourceState, REASON_EXTERNAL_TAKEOVER,
};
use crate::config::{Config, PlayerType, VolumeType};
use crate::peer::{PeerClient, PeerError, COMMAND_DEADLINE, METADATA_DEADLINE};

pub mod persist;
pub mod routes;

/// Forward timeouts within [`DEGRADE_WINDOW`] before a source is degraded.
const DEGRADE_STRIKES: usize = 3;
const DEGRADE_WINDOW: Duration = Duration::from_secs(30);
/// How often the TTL sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
/// Router message channel capacity; overflow is a synchronous 503.
const CHANNEL_CAPACITY: usize = 64;

/// Whether the router forwards commands itself or annotates the source as
/// the forwarder. Fan-out resolution is identical either way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Direct,
    Proxy,
}

// =============================================================================
// Messages and replies
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SourceReply {
    pub ok: bool,
    /// HTTP status the route layer should answer with.
    #[serde(skip)]
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub active_source: Option<String>,
}

impl SourceReply {
    fn ok(active: Option<String>) -> Self {
        Self {
            ok: true,
            code: 200,
            error: None,
            active_source: active,
        }
    }

    fn conflict(error: impl Into<String>, active: Option<String>) -> Self {
        Self {
            ok: false,
            code: 409,
            error: Some(error.into()),
            active_source: active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaStatus {
    Ok,
    Suppressed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandReply {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forwarded_to: Option<String>,
    #[serde(skip)]
    pub code: u16,
}

pub enum RouterMsg {
    Source {
        record: SourceRecord,
        reply: oneshot::Sender<SourceReply>,
    },
    Media {
        snapshot: MediaSnapshot,
        reply: oneshot::Sender<MediaStatus>,
    },
    Command {
        action: String,
        params: Option<serde_json::Value>,
        reply: oneshot::Sender<CommandReply>,
    },
    VolumeReport {
        volume: u8,
        source: String,
        reply: oneshot::Sender<&'static str>,
    },
    Override {
        force: bool,
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<serde_json::Value>,
    },
}

/// Cheap handle HTTP handlers use to reach the state task.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<RouterMsg>,
}

/// The state task is overloaded; callers get a synchronous 503.
#[derive(Debug)]
pub struct Overloaded;

impl RouterHandle {
    fn send(&self, msg: RouterMsg) -> Result<(), Overloaded> {
        self.tx.try_send(msg).map_err(|_| Overloaded)
    }

    pub async fn post_source(&self, record: SourceRecord) -> Result<SourceReply, Overloaded> {
        let (tx, rx) = oneshot::channel();
        self.send(RouterMsg::Source { record, reply: tx })?;
        rx.await.map_err(|_| Overloaded)
    }

    pub async fn post_media(&self, snapshot: MediaSnapshot) -> Result<MediaStatus, Overloaded> {
        let (tx, rx) = oneshot::channel();
        self.send(RouterMsg::Media {
            snapshot,
            reply: tx,
        })?;
        rx.await.map_err(|_| Overloaded)
    }

    pub async fn command(
        &self,
        action: String,
        params: Option<serde_json::Value>,
    ) -> Result<CommandReply, Overloaded> {
        let (tx, rx) = oneshot::channel();
        self.send(RouterMsg::Command {
            action,
            params,
            reply: tx,
        })?;
        rx.await.map_err(|_| Overloaded)
    }

    pub async fn volume_report(&self, volume: u8, source: String) -> Result<&'static str, Overloaded> {
        let (tx, rx) = oneshot::channel();
        self.send(RouterMsg::VolumeReport {
            volume,
            source,
            reply: tx,
        })?;
        rx.await.map_err(|_| Overloaded)
    }

    pub async fn set_override(&self, force: bool) -> Result<(), Overloaded> {
        let (tx, rx) = oneshot::channel();
        self.send(RouterMsg::Override { force, reply: tx })?;
        rx.await.map_err(|_| Overloaded)
    }

    pub async fn status(&self) -> Result<serde_json::Value, Overloaded> {
        let (tx, rx) = oneshot::channel();
        self.send(RouterMsg::Status { reply: tx })?;
        rx.await.map_err(|_| Overloaded)
    }
}

// =============================================================================
// Core state
// =============================================================================

struct SourceEntry {
    record: SourceRecord,
    last_transition_at: Instant,
    degraded: bool,
    strikes: VecDeque<Instant>,
}

impl SourceEntry {
    fn new(record: SourceRecord) -> Self {
        Self {
            record,
            last_transition_at: Instant::now(),
            degraded: false,
            strikes: VecDeque::new(),
        }
    }
}

/// The single-owner router state. Constructed once, then moved into the
/// state task; everything else talks through [`RouterHandle`].
pub struct RouterCore {
    bus: SharedBus,
    client: PeerClient,

    default_player: PlayerType,
    player_kind: PlayerType,
    player_url: String,
    volume_kind: VolumeType,
    source_ttl: Duration,
    state_path: PathBuf,

    sources: HashMap<String, SourceEntry>,
    active_source: Option<String>,
    last_media: Option<MediaSnapshot>,
    /// Ids that posted `gone`; they must re-register before playing again.
    recently_gone: HashSet<String>,
    transport_mode: TransportMode,
    force_override: bool,

    suppressed_count: u64,
    takeover_unacked: u64,
    started_at: Instant,
}

impl RouterCore {
    pub fn new(config: &Config, bus: SharedBus, client: PeerClient) -> Self {
        Self {
            bus,
            client,
            default_player: config.default_player,
            player_kind: config.player.kind,
            player_url: config.player_url(),
            volume_kind: config.volume.kind,
            source_ttl: Duration::from_secs(config.source_ttl_secs),
            state_path: PathBuf::from(&config.state_file),
            sources: HashMap::new(),
            active_source: None,
            last_media: None,
            recently_gone: HashSet::new(),
            transport_mode: TransportMode::default(),
            force_override: false,
            suppressed_count: 0,
            takeover_unacked: 0,
            started_at: Instant::now(),
        }
    }

    /// Read back persisted state. The snapshot is only replayed if the
    /// persisted active source is alive and still reports playing; the
    /// source table itself is rebuilt by the sources re-registering.
    pub async fn restore(&mut self) {
        let persisted = persist::load(&self.state_path);
        let Some(snapshot) = persisted.last_media else {
            return;
        };

        match persisted.active_source {
            Some(id) => {
                let status_url = sibling_url(
                    persisted.active_command_url.as_deref().unwrap_or_default(),
                    "status",
                );
                // Without a persisted command_url the probe has no target;
                // keep the snapshot only if the source proves it is playing.
                let alive_and_playing = if status_url.is_empty() {
                    false
                } else {
                    matches!(
                        self.client
                            .get_json::<serde_json::Value>(&status_url, METADATA_DEADLINE)
                            .await,
                        Ok(status) if status.get("state").and_then(|s| s.as_str()) == Some("playing")
                    )
                };
                if alive_and_playing {
                    info!(source = %id, "restored media snapshot from disk");
                    self.last_media = Some(snapshot);
                } else {
                    debug!(source = %id, "persisted active source not playing; snapshot discarded");
                }
            }
            None => {
                // No owner recorded: the snapshot is display state only.
                self.last_media = Some(snapshot);
            }
        }
    }

    /// Create the channel pair and spawn the state task.
    pub fn spawn(self, cancel: CancellationToken) -> RouterHandle {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(self.run(rx, cancel));
        RouterHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<RouterMsg>, cancel: CancellationToken) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("router state task started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sweep.tick() => self.sweep(),
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
            }
        }

        self.persist();
        info!("router state task stopped");
    }

    async fn handle(&mut self, msg: RouterMsg) {
        match msg {
            RouterMsg::Source { record, reply } => {
                let answer = self.handle_source(record).await;
                let _ = reply.send(answer);
            }
            RouterMsg::Media { snapshot, reply } => {
                let answer = self.handle_media(snapshot);
                let _ = reply.send(answer);
            }
            RouterMsg::Command {
                action,
                params,
                reply,
            } => {
                let answer = self.handle_command(&action, params).await;
                let _ = reply.send(answer);
            }
            RouterMsg::VolumeReport {
                volume,
                source,
                reply,
            } => {
                let _ = reply.send(self.handle_volume_report(volume, &source));
            }
            RouterMsg::Override { force, reply } => {
                info!(force, "playback override set");
                self.force_override = force;
                let _ = reply.send(());
            }
            RouterMsg::Status { reply } => {
                let _ = reply.send(self.status_json());
            }
        }
    }

    // =========================================================================
    // Source lifecycle
    // =========================================================================

    async fn handle_source(&mut self, record: SourceRecord) -> SourceReply {
        let id = record.id.clone();
        let exists = self.sources.contains_key(&id);

        match (exists, record.state) {
            // Registration (fresh or refresh). Probing an unreachable
            // command_url refuses the registration outright.
            (false, SourceState::Idle) => {
                if let Err(e) = self.probe_command_url(&record.command_url).await {
                    warn!(source = %id, error = %e, "registration refused: command_url unreachable");
                    return SourceReply::conflict(
                        "command_url_unreachable",
                        self.active_source.clone(),
                    );
                }
                self.recently_gone.remove(&id);
                self.commit(record);
                SourceReply::ok(self.active_source.clone())
            }

            // Stop (playing/paused -> registered) or an idempotent refresh.
            (true, SourceState::Idle) => {
                let was_owning = self.active_source.as_deref() == Some(id.as_str());
                self.commit(record);
                if was_owning {
                    self.active_source = None;
                    self.persist();
                }
                SourceReply::ok(self.active_source.clone())
            }

            // Start or resume. A source that posted gone must re-register
            // first, and an unknown id cannot begin life playing unless it
            // ships a probeable record (register + start in one step).
            (_, SourceState::Playing) => {
                if self.recently_gone.contains(&id) {
                    return SourceReply::conflict(
                        "gone_requires_register",
                        self.active_source.clone(),
                    );
                }
                if !exists {
                    if let Err(e) = self.probe_command_url(&record.command_url).await {
                        warn!(source = %id, error = %e, "start refused: command_url unreachable");
                        return SourceReply::conflict(
                            "command_url_unreachable",
                            self.active_source.clone(),
                        );
                    }
                } else if self
                    .sources
                    .get(&id)
                    .map(|entry| entry.degraded)
                    .unwrap_or(false)
                {
                    // Degraded sources get their registration re-probed
                    // before they may own the device again.
                    if let Err(e) = self.probe_command_url(&record.command_url).await {
                        warn!(source = %id, error = %e, "degraded source failed re-probe");
                        return SourceReply::conflict(
                            "command_url_unreachable",
                            self.active_source.clone(),
                        );
                    }
                    if let Some(entry) = self.sources.get_mut(&id) {
                        entry.degraded = false;
                        entry.strikes.clear();
                    }
                }

                self.depose_previous_owner(&id).await;
                self.commit(record);
                self.active_source = Some(id);
                self.persist();
                SourceReply::ok(self.active_source.clone())
            }

            // Pause is only reachable from playing (or idempotently from
            // paused); anything else is a state violation.
            (true, SourceState::Paused) => {
                let current = self
                    .sources
                    .get(&id)
                    .map(|entry| entry.record.state)
                    .unwrap_or_default();
                if !matches!(current, SourceState::Playing | SourceState::Paused) {
                    return SourceReply::conflict(
                        format!("cannot pause from {}", current),
                        self.active_source.clone(),
                    );
                }
                self.commit(record);
                SourceReply::ok(self.active_source.clone())
            }
            (false, SourceState::Paused) => {
                SourceReply::conflict("pause_without_register", self.active_source.clone())
            }

            // Gone destroys the record from any state.
            (_, SourceState::Gone) => {
                self.remove_source(&id, "source_gone");
                SourceReply::ok(self.active_source.clone())
            }
        }
    }

    /// Insert/update the record, stamp the transition, broadcast it.
    fn commit(&mut self, record: SourceRecord) {
        use std::collections::hash_map::Entry;

        let entry = match self.sources.entry(record.id.clone()) {
            Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                entry.record = record;
                entry.last_transition_at = Instant::now();
                entry
            }
            Entry::Vacant(vacant) => vacant.insert(SourceEntry::new(record)),
        };
        let envelope = Envelope::source_update(&entry.record, 0);
        self.bus.stamp(envelope);
    }

    fn remove_source(&mut self, id: &str, reason: &str) {
        if let Some(mut entry) = self.sources.remove(id) {
            entry.record.state = SourceState::Gone;
            self.recently_gone.insert(id.to_string());
            let envelope = Envelope::source_update(&entry.record, 0).with_reason(reason);
            self.bus.stamp(envelope);
        }
        if self.active_source.as_deref() == Some(id) {
            self.active_source = None;
            self.persist();
        }
    }

    /// Politely hand the device away from the previous owner before the new
    /// one commits. An unacknowledged deposition still transfers ownership.
    async fn depose_previous_owner(&mut self, new_owner: &str) {
        let Some(prev_id) = self.active_source.clone() else {
            return;
        };
        if prev_id == new_owner {
            return;
        }
        let Some(prev) = self.sources.get(&prev_id) else {
            return;
        };

        let action = if prev.record.handles(MediaAction::Pause) {
            MediaAction::Pause
        } else {
            MediaAction::Stop
        };
        let body = serde_json::json!({ "action": action.as_str() });
        let url = prev.record.command_url.clone();

        match self
            .client
            .post_json::<_, serde_json::Value>(&url, &body, COMMAND_DEADLINE)
            .await
        {
            Ok(_) => debug!(previous = %prev_id, new = %new_owner, action = %action, "previous owner deposed"),
            Err(e) => {
                self.takeover_unacked += 1;
                warn!(
                    previous = %prev_id,
                    new = %new_owner,
                    error = %e,
                    "takeover_unacknowledged"
                );
            }
        }
    }

    async fn probe_command_url(&self, command_url: &str) -> Result<(), PeerError> {
        let health = sibling_url(command_url, "health");
        self.client.probe(&health, COMMAND_DEADLINE).await
    }

    /// TTL sweep: owning states older than the liveness TTL go to gone and
    /// the active source is recomputed.
    fn sweep(&mut self) {
        let expired: Vec<String> = self
            .sources
            .iter()
            .filter(|(_, entry)| {
                matches!(
                    entry.record.state,
                    SourceState::Playing | SourceState::Paused
                ) && entry.last_transition_at.elapsed() > self.source_ttl
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            warn!(source = %id, ttl_secs = self.source_ttl.as_secs(), "source liveness TTL expired");
            self.remove_source(&id, "liveness_timeout");
        }
    }

    // =========================================================================
    // Media gating
    // =========================================================================

    fn handle_media(&mut self, snapshot: MediaSnapshot) -> MediaStatus {
        let external = snapshot.reason.as_deref() == Some(REASON_EXTERNAL_TAKEOVER);

        let accept = if self.force_override {
            true
        } else {
            match self.active_source.clone() {
                None => {
                    // Only the configured default player may paint the UI
                    // while nothing owns the device.
                    self.default_player != PlayerType::None
                        && self.posting_player(&snapshot) == Some(self.default_player)
                }
                Some(active_id) => {
                    let active_kind = self
                        .sources
                        .get(&active_id)
                        .map(|entry| entry.record.player);

                    if snapshot.source_id.as_deref() == Some(active_id.as_str()) {
                        true
                    } else if external && active_kind == Some(PlayerKind::Local) {
                        // A networked speaker started playing while a local
                        // source was active: the speaker wins, the local
                        // source is forcibly gone.
                        info!(deposed = %active_id, "external takeover of local source");
                        self.remove_source(&active_id, REASON_EXTERNAL_TAKEOVER);
                        true
                    } else {
                        self.posting_kind(&snapshot) == active_kind
                    }
                }
            }
        };

        if !accept {
            self.suppressed_count += 1;
            debug!(
                source_id = snapshot.source_id.as_deref().unwrap_or("-"),
                state = %snapshot.state,
                active = self.active_source.as_deref().unwrap_or("none"),
                "media snapshot suppressed"
            );
            return MediaStatus::Suppressed;
        }

        self.accept_media(snapshot);
        MediaStatus::Ok
    }

    fn accept_media(&mut self, mut snapshot: MediaSnapshot) {
        // Stop transitions keep the previous artwork so the UI dims the
        // last cover instead of flashing a placeholder.
        if matches!(snapshot.state, PlaybackState::Stopped | PlaybackState::Idle)
            && snapshot.artwork_url.is_none()
        {
            snapshot.artwork_url = self
                .last_media
                .as_ref()
                .and_then(|m| m.artwork_url.clone());
        }

        self.last_media = Some(snapshot.clone());
        self.persist();

        let envelope = Envelope::media_update(&snapshot, 0);
        self.bus.stamp(envelope);
    }

    /// Which configured player type a snapshot's poster corresponds to.
    fn posting_player(&self, snapshot: &MediaSnapshot) -> Option<PlayerType> {
        let source_id = snapshot.source_id.as_deref()?;
        if let Some(entry) = self.sources.get(source_id) {
            return Some(match entry.record.player {
                PlayerKind::Local => PlayerType::Local,
                PlayerKind::Remote => self.player_kind,
            });
        }
        parse_player_type(source_id)
    }

    fn posting_kind(&self, snapshot: &MediaSnapshot) -> Option<PlayerKind> {
        self.posting_player(snapshot).map(|player| match player {
            PlayerType::Local => PlayerKind::Local,
            _ => PlayerKind::Remote,
        })
    }

    // =========================================================================
    // Command forwarding
    // =========================================================================

    async fn handle_command(
        &mut self,
        action_str: &str,
        params: Option<serde_json::Value>,
    ) -> CommandReply {
        let action = MediaAction::parse(action_str);

        // 1. The active source, if it declares the action.
        if let (Some(active_id), Some(action)) = (self.active_source.clone(), action) {
            let handles = self
                .sources
                .get(&active_id)
                .map(|entry| entry.record.handles(action))
                .unwrap_or(false);
            if handles {
                let url = self
                    .sources
                    .get(&active_id)
                    .map(|entry| entry.record.command_url.clone())
                    .unwrap_or_default();
                return self
                    .forward(&url, action_str, params, Some(active_id))
                    .await;
            }
        }

        // 2. Media keys fall through to the configured default player.
        if action.is_some() && self.default_player != PlayerType::None {
            let url = format!("{}/command", self.player_url);
            let target = format!("player:{:?}", self.default_player).to_lowercase();
            return self.forward(&url, action_str, params, Some(target)).await;
        }

        // 3. Nobody wants it.
        CommandReply {
            status: "unhandled".into(),
            forwarded_to: None,
            code: 200,
        }
    }

    async fn forward(
        &mut self,
        url: &str,
        action: &str,
        params: Option<serde_json::Value>,
        target: Option<String>,
    ) -> CommandReply {
        let body = serde_json::json!({ "action": action, "params": params });
        match self
            .client
            .post_json::<_, serde_json::Value>(url, &body, COMMAND_DEADLINE)
            .await
        {
            Ok(_) => CommandReply {
                status: "ok".into(),
                forwarded_to: target,
                code: 200,
            },
            Err(PeerError::Timeout { .. }) => {
                if let Some(id) = target.as_deref() {
                    self.record_timeout_strike(id);
                }
                CommandReply {
                    status: "timeout".into(),
                    forwarded_to: target,
                    code: 408,
                }
            }
            Err(e) => {
                warn!(url, action, error = %e, "command forward failed");
                CommandReply {
                    status: e.status_token().into(),
                    forwarded_to: target,
                    code: 502,
                }
            }
        }
    }

    fn record_timeout_strike(&mut self, id: &str) {
        let Some(entry) = self.sources.get_mut(id) else {
            return;
        };
        let now = Instant::now();
        entry.strikes.push_back(now);
        while entry
            .strikes
            .front()
            .map(|at| now.duration_since(*at) > DEGRADE_WINDOW)
            .unwrap_or(false)
        {
            entry.strikes.pop_front();
        }
        if entry.strikes.len() >= DEGRADE_STRIKES && !entry.degraded {
            entry.degraded = true;
            warn!(source = %id, strikes = entry.strikes.len(), "source degraded");
        }
    }

    // =========================================================================
    // Volume reports
    // =========================================================================

    fn handle_volume_report(&mut self, volume: u8, source: &str) -> &'static str {
        let Some(player) = parse_player_type(source) else {
            warn!(source, "volume report from unknown player type dropped");
            return "rejected";
        };
        if !self.volume_kind.matches_player(player) {
            warn!(
                source,
                adapter = ?self.volume_kind,
                "volume report dropped: adapter/player type mismatch"
            );
            return "rejected";
        }

        let envelope = Envelope::new(
            "volume_report",
            serde_json::json!({ "volume": volume, "source": source }),
            0,
        );
        self.bus.stamp(envelope);
        "ok"
    }

    // =========================================================================
    // Status and persistence
    // =========================================================================

    fn status_json(&self) -> serde_json::Value {
        let sources: serde_json::Map<String, serde_json::Value> = self
            .sources
            .iter()
            .map(|(id, entry)| {
                (
                    id.clone(),
                    serde_json::json!({
                        "record": entry.record,
                        "degraded": entry.degraded,
                        "last_transition_secs": entry.last_transition_at.elapsed().as_secs(),
                    }),
                )
            })
            .collect();

        serde_json::json!({
            "service": "router",
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "active_source": self.active_source,
            "sources": sources,
            "last_media": self.last_media,
            "transport_mode": self.transport_mode,
            "force_override": self.force_override,
            "suppressed_count": self.suppressed_count,
            "takeover_unacknowledged": self.takeover_unacked,
        })
    }

    fn persist(&self) {
        let state = persist::PersistedState {
            active_source: self.active_source.clone(),
            active_command_url: self
                .active_source
                .as_deref()
                .and_then(|id| self.sources.get(id))
                .map(|entry| entry.record.command_url.clone()),
            last_media: self.last_media.clone(),
        };
        if let Err(e) = persist::save(&self.state_path, &state) {
            warn!(error = %e, "router state persist failed");
        }
    }

    /// Cached snapshot replayed to late-joining subscribers.
    pub fn replay_snapshot(last_media: &Option<MediaSnapshot>, seq: u64) -> Option<Envelope> {
        let snapshot = last_media.clone().unwrap_or_default();
        let mut envelope = Envelope::media_update(&snapshot, seq);
        envelope.reason = Some("client_connect".into());
        Some(envelope)
    }
}

/// `http://host:port/command` -> `http://host:port/health` etc.
fn sibling_url(command_url: &str, leaf: &str) -> String {
    if command_url.is_empty() {
        return String::new();
    }
    match command_url.rsplit_once('/') {
        Some((base, _)) if base.contains("://") => format!("{}/{}", base, leaf),
        _ => format!("{}/{}", command_url.trim_end_matches('/'), leaf),
    }
}

fn parse_player_type(s: &str) -> Option<PlayerType> {
    match s.to_lowercase().as_str() {
        "sonos" => Some(PlayerType::Sonos),
        "bluesound" => Some(PlayerType::Bluesound),
        "local" => Some(PlayerType::Local),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn sibling_url_rewrites_the_leaf() {
        assert_eq!(
            sibling_url("http://127.0.0.1:8769/command", "health"),
            "http://127.0.0.1:8769/health"
        );
        assert_eq!(
            sibling_url("http://127.0.0.1:8769/cd/command", "status"),
            "http://127.0.0.1:8769/cd/status"
        );
        assert_eq!(sibling_url("", "health"), "");
    }

    #[test]
    fn player_type_parsing() {
        assert_eq!(parse_player_type("Sonos"), Some(PlayerType::Sonos));
        assert_eq!(parse_player_type("local"), Some(PlayerType::Local));
        assert_eq!(parse_player_type("chromecast"), None);
    }

    #[test]
    fn replay_envelope_carries_client_connect_reason() {
        let envelope = RouterCore::replay_snapshot(&None, 1).unwrap();
        assert_eq!(envelope.kind, "media_update");
        assert_eq!(envelope.reason.as_deref(), Some("client_connect"));
    }
}
