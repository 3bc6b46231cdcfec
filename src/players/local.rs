//! Local decoder player adapter.
//!
//! Spawns one decoder child process per track. The decoder's stdout carries
//! progress ticks (`tick <pos_ms> <dur_ms>`), stderr is logged, and stdin
//! accepts `pause` / `resume` / `start` / `quit` lines. Gapless playback
//! pre-queues the next decoder in preload mode once the current track's
//! remaining time drops below the configured threshold; on the track
//! boundary the emitted state goes straight from playing(N) to
//! playing(N+1), never through stopped.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{MediaSnapshot, PlaybackState};
use crate::config::{LocalPlayerConfig, PlayerType};
use crate::players::{Player, PlayerAction, RouterReporter};

/// One entry in the local play queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub path: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub artwork_url: Option<String>,
}

/// Queue payload accepted by `{action: "play", params: {...}}`.
#[derive(Debug, Clone, Deserialize)]
struct LoadRequest {
    source_id: String,
    tracks: Vec<Track>,
    #[serde(default)]
    index: usize,
}

#[derive(Debug)]
enum ControlMessage {
    Load(LoadRequest),
    Action(PlayerAction),
}

#[derive(Debug)]
enum DecoderEvent {
    /// Progress tick from the current decoder.
    Tick {
        generation: u64,
        pos_ms: u64,
        dur_ms: u64,
    },
    /// The decoder exited (end of track, error, or deliberate kill).
    /// Stale generations are ignored so replacing a child is not mistaken
    /// for a track boundary.
    Exited { generation: u64, clean: bool },
}

/// A spawned decoder child plus its stdin command pipe.
struct DecoderChild {
    child: Child,
    stdin: ChildStdin,
}

impl DecoderChild {
    /// Spawn a decoder for `track`. In preload mode the decoder opens and
    /// primes the file, then blocks until `start` arrives on stdin.
    fn spawn(
        binary: &str,
        track: &Track,
        preload: bool,
        events: Option<(u64, mpsc::Sender<DecoderEvent>)>,
    ) -> Result<Self> {
        let mut command = Command::new(binary);
        command
            .arg("--progress")
            .arg(&track.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if preload {
            command.arg("--preload");
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("spawn decoder {}", binary))?;

        let stdin = child.stdin.take().context("decoder stdin unavailable")?;

        // stderr is logged regardless of preload state.
        if let Some(stderr) = child.stderr.take() {
            let path = track.path.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(track = %path, "decoder: {}", line);
                }
            });
        }

        // stdout ticks are only routed for the active child; a preloaded
        // child keeps its stdout attached until activate() takes it.
        if let Some((generation, tx)) = events {
            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(read_progress(stdout, generation, tx));
            }
        }

        Ok(Self { child, stdin })
    }

    /// Route a preloaded child's progress output and release it.
    fn activate(&mut self, generation: u64, events: mpsc::Sender<DecoderEvent>) {
        if let Some(stdout) = self.child.stdout.take() {
            tokio::spawn(read_progress(stdout, generation, events));
        }
    }

    async fn send(&mut self, line: &str) {
        if let Err(e) = self.stdin.write_all(format!("{}\n", line).as_bytes()).await {
            warn!(error = %e, "decoder stdin write failed");
        }
    }

    async fn quit(mut self) {
        self.send("quit").await;
        match tokio::time::timeout(Duration::from_millis(500), self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = self.child.kill().await;
            }
        }
    }
}

async fn read_progress(
    stdout: tokio::process::ChildStdout,
    generation: u64,
    tx: mpsc::Sender<DecoderEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some((pos_ms, dur_ms)) = parse_tick(&line) {
                    let tick = DecoderEvent::Tick {
                        generation,
                        pos_ms,
                        dur_ms,
                    };
                    if tx.send(tick).await.is_err() {
                        return;
                    }
                }
            }
            Ok(None) => {
                let _ = tx
                    .send(DecoderEvent::Exited {
                        generation,
                        clean: true,
                    })
                    .await;
                return;
            }
            Err(e) => {
                warn!(error = %e, "decoder stdout read failed");
                let _ = tx
                    .send(DecoderEvent::Exited {
                        generation,
                        clean: false,
                    })
                    .await;
                return;
            }
        }
    }
}

/// `tick <pos_ms> <dur_ms>`
fn parse_tick(line: &str) -> Option<(u64, u64)> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "tick" {
        return None;
    }
    let pos = parts.next()?.parse().ok()?;
    let dur = parts.next()?.parse().ok()?;
    Some((pos, dur))
}

// =============================================================================
// Manager
// =============================================================================

#[derive(Debug, Clone, Default, Serialize)]
struct LocalStatus {
    source_id: Option<String>,
    state: PlaybackState,
    index: usize,
    queue_len: usize,
    position_ms: Option<u64>,
    duration_ms: Option<u64>,
}

struct Manager {
    binary: String,
    gapless_threshold: Duration,
    reporter: RouterReporter,
    status: Arc<RwLock<LocalStatus>>,

    source_id: Option<String>,
    queue: Vec<Track>,
    index: usize,
    current: Option<DecoderChild>,
    prequeued: Option<(usize, DecoderChild)>,
    paused: bool,
    position_ms: u64,
    duration_ms: u64,
    /// Bumped whenever a new child becomes current; stale reader events
    /// carry an older value and are dropped.
    generation: u64,
}

impl Manager {
    async fn run(
        mut self,
        mut control: mpsc::Receiver<ControlMessage>,
        cancel: CancellationToken,
    ) {
        let (tick_tx, mut tick_rx) = mpsc::channel::<DecoderEvent>(64);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = control.recv() => match message {
                    Some(ControlMessage::Load(request)) => self.load(request, &tick_tx).await,
                    Some(ControlMessage::Action(action)) => self.action(action, &tick_tx).await,
                    None => break,
                },
                event = tick_rx.recv() => match event {
                    Some(DecoderEvent::Tick { generation, pos_ms, dur_ms }) => {
                        if generation == self.generation {
                            self.on_tick(pos_ms, dur_ms).await;
                        }
                    }
                    Some(DecoderEvent::Exited { generation, clean }) => {
                        if generation == self.generation {
                            self.on_exit(clean, &tick_tx).await;
                        }
                    }
                    None => break,
                },
            }
        }

        // Shutdown: stop children, report stopped within the grace period.
        if let Some(current) = self.current.take() {
            current.quit().await;
        }
        if let Some((_, prequeued)) = self.prequeued.take() {
            prequeued.quit().await;
        }
        info!("local player manager stopped");
    }

    async fn load(&mut self, request: LoadRequest, ticks: &mpsc::Sender<DecoderEvent>) {
        if request.tracks.is_empty() {
            warn!("load request with empty track list ignored");
            return;
        }
        self.teardown().await;
        self.source_id = Some(request.source_id);
        self.index = request.index.min(request.tracks.len() - 1);
        self.queue = request.tracks;
        self.start_current(ticks).await;
    }

    async fn action(&mut self, action: PlayerAction, ticks: &mpsc::Sender<DecoderEvent>) {
        match action {
            PlayerAction::Play => {
                if self.paused {
                    if let Some(current) = self.current.as_mut() {
                        current.send("resume").await;
                    }
                    self.paused = false;
                    self.emit(PlaybackState::Playing).await;
                } else if self.current.is_none() && !self.queue.is_empty() {
                    self.start_current(ticks).await;
                }
            }
            PlayerAction::Pause => {
                if let Some(current) = self.current.as_mut() {
                    current.send("pause").await;
                    self.paused = true;
                    self.emit(PlaybackState::Paused).await;
                }
            }
            PlayerAction::Toggle => {
                let next = if self.paused || self.current.is_none() {
                    PlayerAction::Play
                } else {
                    PlayerAction::Pause
                };
                Box::pin(self.action(next, ticks)).await;
            }
            PlayerAction::Next => {
                if self.index + 1 < self.queue.len() {
                    self.index += 1;
                    self.restart_at_index(ticks).await;
                }
            }
            PlayerAction::Prev => {
                if self.index > 0 {
                    self.index -= 1;
                }
                self.restart_at_index(ticks).await;
            }
            PlayerAction::Stop => {
                self.teardown().await;
                self.emit(PlaybackState::Stopped).await;
            }
            PlayerAction::VolumeSet { .. } => {
                // Local output volume is the volume adapter's concern.
            }
        }
    }

    async fn on_tick(&mut self, pos_ms: u64, dur_ms: u64) {
        self.position_ms = pos_ms;
        self.duration_ms = dur_ms;
        {
            let mut status = self.status.write().await;
            status.position_ms = Some(pos_ms);
            status.duration_ms = Some(dur_ms);
        }

        // Pre-queue the next decoder for a gapless boundary.
        let remaining = dur_ms.saturating_sub(pos_ms);
        let next_index = self.index + 1;
        let wanted = remaining <= self.gapless_threshold.as_millis() as u64
            && next_index < self.queue.len();
        let already = self.prequeued.as_ref().map(|(i, _)| *i) == Some(next_index);
        if wanted && !already {
            match DecoderChild::spawn(&self.binary, &self.queue[next_index], true, None) {
                Ok(child) => {
                    debug!(index = next_index, "pre-queued next decoder");
                    self.prequeued = Some((next_index, child));
                }
                Err(e) => warn!(error = %e, "gapless pre-queue failed"),
            }
        }
    }

    async fn on_exit(&mut self, clean: bool, ticks: &mpsc::Sender<DecoderEvent>) {
        if let Some(current) = self.current.take() {
            current.quit().await;
        }

        if !clean {
            warn!(index = self.index, "decoder exited with error");
        }

        // Gapless handoff: the preloaded child starts immediately and the
        // emitted state never passes through stopped.
        if let Some((next_index, mut next)) = self.prequeued.take() {
            self.generation += 1;
            next.activate(self.generation, ticks.clone());
            next.send("start").await;
            self.index = next_index;
            self.current = Some(next);
            self.position_ms = 0;
            self.duration_ms = 0;
            self.emit(PlaybackState::Playing).await;
            return;
        }

        if self.index + 1 < self.queue.len() {
            self.index += 1;
            self.restart_at_index(ticks).await;
        } else {
            self.emit(PlaybackState::Stopped).await;
        }
    }

    async fn restart_at_index(&mut self, ticks: &mpsc::Sender<DecoderEvent>) {
        if let Some(current) = self.current.take() {
            current.quit().await;
        }
        if let Some((_, prequeued)) = self.prequeued.take() {
            prequeued.quit().await;
        }
        self.start_current(ticks).await;
    }

    async fn start_current(&mut self, ticks: &mpsc::Sender<DecoderEvent>) {
        let Some(track) = self.queue.get(self.index) else {
            return;
        };
        self.generation += 1;
        match DecoderChild::spawn(
            &self.binary,
            track,
            false,
            Some((self.generation, ticks.clone())),
        ) {
            Ok(child) => {
                self.current = Some(child);
                self.paused = false;
                self.position_ms = 0;
                self.duration_ms = 0;
                self.emit(PlaybackState::Playing).await;
            }
            Err(e) => {
                warn!(error = %e, path = %track.path, "decoder spawn failed");
                self.emit(PlaybackState::Idle).await;
            }
        }
    }

    async fn teardown(&mut self) {
        if let Some(current) = self.current.take() {
            current.quit().await;
        }
        if let Some((_, prequeued)) = self.prequeued.take() {
            prequeued.quit().await;
        }
        self.paused = false;
        // Invalidate anything the killed readers still emit.
        self.generation += 1;
    }

    async fn emit(&self, state: PlaybackState) {
        let track = self.queue.get(self.index);
        {
            let mut status = self.status.write().await;
            status.source_id = self.source_id.clone();
            status.state = state;
            status.index = self.index;
            status.queue_len = self.queue.len();
        }
        let snapshot = MediaSnapshot {
            title: track.and_then(|t| t.title.clone()),
            artist: track.and_then(|t| t.artist.clone()),
            album: track.and_then(|t| t.album.clone()),
            artwork_url: track.and_then(|t| t.artwork_url.clone()),
            state,
            position_ms: (state == PlaybackState::Playing).then_some(self.position_ms),
            duration_ms: (self.duration_ms > 0).then_some(self.duration_ms),
            source_id: self.source_id.clone(),
            reason: None,
        };
        self.reporter.post_media(snapshot).await;
    }
}

// =============================================================================
// Player facade
// =============================================================================

/// Local decoder backend. Command handlers post into the manager task over
/// a channel; the manager is the only owner of the child processes.
pub struct LocalPlayer {
    config: LocalPlayerConfig,
    reporter: RouterReporter,
    control: mpsc::Sender<ControlMessage>,
    control_rx: std::sync::Mutex<Option<mpsc::Receiver<ControlMessage>>>,
    status: Arc<RwLock<LocalStatus>>,
}

impl LocalPlayer {
    pub fn new(config: &LocalPlayerConfig, reporter: RouterReporter) -> Self {
        let (tx, rx) = mpsc::channel(32);
        Self {
            config: config.clone(),
            reporter,
            control: tx,
            control_rx: std::sync::Mutex::new(Some(rx)),
            status: Arc::new(RwLock::new(LocalStatus::default())),
        }
    }
}

#[async_trait]
impl Player for LocalPlayer {
    fn kind(&self) -> PlayerType {
        PlayerType::Local
    }

    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let rx = self
            .control_rx
            .lock()
            .map_err(|_| anyhow::anyhow!("control receiver lock poisoned"))?
            .take()
            .context("local player already started")?;

        let manager = Manager {
            binary: self.config.decoder.clone(),
            gapless_threshold: Duration::from_millis(self.config.gapless_threshold_ms),
            reporter: self.reporter.clone(),
            status: self.status.clone(),
            source_id: None,
            queue: Vec::new(),
            index: 0,
            current: None,
            prequeued: None,
            paused: false,
            position_ms: 0,
            duration_ms: 0,
            generation: 0,
        };
        tokio::spawn(manager.run(rx, cancel));
        Ok(())
    }

    async fn command(&self, action: PlayerAction, params: Option<serde_json::Value>) -> Result<()> {
        let message = if action == PlayerAction::Play {
            match params.map(serde_json::from_value::<LoadRequest>) {
                Some(Ok(request)) => ControlMessage::Load(request),
                _ => ControlMessage::Action(action),
            }
        } else {
            ControlMessage::Action(action)
        };
        self.control
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("local player manager gone"))
    }

    async fn status(&self) -> serde_json::Value {
        serde_json::to_value(&*self.status.read().await).unwrap_or(serde_json::Value::Null)
    }
}
