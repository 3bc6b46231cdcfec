//! Networked-speaker player adapter.
//!
//! Polls the speaker's control endpoint for transport changes, POSTs media
//! snapshots to the router, and translates abstract commands into the
//! speaker's native protocol (Sonos UPnP AV SOAP or Bluesound HTTP).
//!
//! Takeover detection is heuristic: a track change arriving more than
//! `EXTERNAL_TAKEOVER_GRACE` after the last command issued by this adapter
//! was initiated by a third party, and the resulting snapshot carries
//! `reason: external_takeover`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{MediaSnapshot, PlaybackState, REASON_EXTERNAL_TAKEOVER};
use crate::config::{PlayerConfig, PlayerType};
use crate::peer::xml::xml_text;
use crate::peer::{PeerClient, COMMAND_DEADLINE, METADATA_DEADLINE};
use crate::players::{Player, PlayerAction, RouterReporter};

/// Track changes later than this after our own command are third-party.
const EXTERNAL_TAKEOVER_GRACE: Duration = Duration::from_secs(3);
/// Idle polls before the interval starts stretching.
const IDLE_BACKOFF_AFTER: u32 = 10;
/// Ceiling for the stretched idle interval.
const IDLE_POLL_MAX: Duration = Duration::from_secs(4);

/// What one poll of the speaker yielded.
#[derive(Debug, Clone, Default, PartialEq)]
struct TransportSnapshot {
    state: PlaybackState,
    title: Option<String>,
    artist: Option<String>,
    album: Option<String>,
    artwork_url: Option<String>,
    position_ms: Option<u64>,
    duration_ms: Option<u64>,
    /// Identity used for track-change detection.
    track_key: String,
}

struct SpeakerState {
    last: Option<TransportSnapshot>,
    last_command_at: Option<Instant>,
    idle_polls: u32,
    reachable: bool,
}

/// Adapter for Sonos- and Bluesound-style networked speakers.
pub struct SpeakerPlayer {
    kind: PlayerType,
    host: String,
    poll: Duration,
    client: PeerClient,
    reporter: RouterReporter,
    state: Arc<RwLock<SpeakerState>>,
}

impl SpeakerPlayer {
    pub fn new(config: &PlayerConfig, client: PeerClient, reporter: RouterReporter) -> Result<Self> {
        let host = config
            .endpoint()
            .context("player.ip or player.host required for a networked speaker")?
            .to_string();
        Ok(Self {
            kind: config.kind,
            host,
            poll: Duration::from_millis(config.poll_ms),
            client,
            reporter,
            state: Arc::new(RwLock::new(SpeakerState {
                last: None,
                last_command_at: None,
                idle_polls: 0,
                reachable: false,
            })),
        })
    }

    // =========================================================================
    // Poll loop
    // =========================================================================

    async fn poll_loop(self: Arc<Self>, cancel: CancellationToken) {
        info!(host = %self.host, kind = ?self.kind, "speaker poll loop started");

        loop {
            let delay = self.current_interval().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.fetch_transport().await {
                Ok(snapshot) => self.handle_poll(snapshot).await,
                Err(e) => {
                    let mut state = self.state.write().await;
                    if state.reachable {
                        warn!(host = %self.host, error = %e, "speaker unreachable");
                        state.reachable = false;
                    }
                }
            }
        }

        info!("speaker poll loop stopped");
    }

    /// Stretch the interval while the speaker sits idle; snap back on
    /// activity.
    async fn current_interval(&self) -> Duration {
        let state = self.state.read().await;
        if state.idle_polls <= IDLE_BACKOFF_AFTER {
            return self.poll;
        }
        let factor = ((state.idle_polls - IDLE_BACKOFF_AFTER) / 5 + 2) as u32;
        (self.poll * factor).min(IDLE_POLL_MAX)
    }

    async fn handle_poll(&self, snapshot: TransportSnapshot) {
        let report = {
            let mut state = self.state.write().await;

            if !state.reachable {
                state.reachable = true;
                debug!(host = %self.host, "speaker reachable");
            }

            if snapshot.state == PlaybackState::Playing {
                state.idle_polls = 0;
            } else {
                state.idle_polls = state.idle_polls.saturating_add(1);
            }

            let changed = state.last.as_ref() != Some(&snapshot);
            if !changed {
                return;
            }

            let track_changed = state
                .last
                .as_ref()
                .map(|prev| prev.track_key != snapshot.track_key && !snapshot.track_key.is_empty())
                .unwrap_or(false);
            let commanded_recently = state
                .last_command_at
                .map(|at| at.elapsed() <= EXTERNAL_TAKEOVER_GRACE)
                .unwrap_or(false);
            let external = track_changed && !commanded_recently;

            state.last = Some(snapshot.clone());
            (snapshot, external)
        };

        let (snapshot, external) = report;
        let media = MediaSnapshot {
            title: snapshot.title,
            artist: snapshot.artist,
            album: snapshot.album,
            artwork_url: snapshot.artwork_url,
            state: snapshot.state,
            position_ms: snapshot.position_ms,
            duration_ms: snapshot.duration_ms,
            source_id: None,
            reason: external.then(|| REASON_EXTERNAL_TAKEOVER.to_string()),
        };
        self.reporter.post_media(media).await;
    }

    async fn mark_commanded(&self) {
        let mut state = self.state.write().await;
        state.last_command_at = Some(Instant::now());
        state.idle_polls = 0;
    }

    // =========================================================================
    // Protocol: fetch
    // =========================================================================

    async fn fetch_transport(&self) -> Result<TransportSnapshot> {
        match self.kind {
            PlayerType::Sonos => self.fetch_sonos().await,
            PlayerType::Bluesound => self.fetch_bluesound().await,
            _ => anyhow::bail!("not a networked speaker"),
        }
    }

    async fn fetch_sonos(&self) -> Result<TransportSnapshot> {
        let transport = self
            .soap(
                "AVTransport",
                "GetTransportInfo",
                r#"<u:GetTransportInfo xmlns:u="urn:schemas-upnp-org:service:AVTransport:1"><InstanceID>0</InstanceID></u:GetTransportInfo>"#,
            )
            .await?;
        let position = self
            .soap(
                "AVTransport",
                "GetPositionInfo",
                r#"<u:GetPositionInfo xmlns:u="urn:schemas-upnp-org:service:AVTransport:1"><InstanceID>0</InstanceID></u:GetPositionInfo>"#,
            )
            .await?;

        let state = match xml_text(&transport, "CurrentTransportState").as_deref() {
            Some("PLAYING") => PlaybackState::Playing,
            Some("PAUSED_PLAYBACK") => PlaybackState::Paused,
            Some("TRANSITIONING") => PlaybackState::Buffering,
            Some("STOPPED") => PlaybackState::Stopped,
            _ => PlaybackState::Idle,
        };

        // TrackMetaData holds an escaped DIDL-Lite document; quick-xml
        // unescapes the text event so it parses as regular XML here.
        let meta = xml_text(&position, "TrackMetaData").unwrap_or_default();
        let title = xml_text(&meta, "title");
        let artist = xml_text(&meta, "creator");
        let album = xml_text(&meta, "album");
        let artwork_url = xml_text(&meta, "albumArtURI").map(|uri| {
            if uri.starts_with("http") {
                uri
            } else {
                format!("http://{}:1400{}", self.host, uri)
            }
        });

        let track_uri = xml_text(&position, "TrackURI").unwrap_or_default();

        Ok(TransportSnapshot {
            state,
            position_ms: xml_text(&position, "RelTime").and_then(|t| hms_to_ms(&t)),
            duration_ms: xml_text(&position, "TrackDuration").and_then(|t| hms_to_ms(&t)),
            track_key: if track_uri.is_empty() {
                title.clone().unwrap_or_default()
            } else {
                track_uri
            },
            title,
            artist,
            album,
            artwork_url,
        })
    }

    async fn fetch_bluesound(&self) -> Result<TransportSnapshot> {
        let url = format!("http://{}:11000/Status", self.host);
        let xml = self.client.get_text(&url, METADATA_DEADLINE).await?;

        let state = match xml_text(&xml, "state").as_deref() {
            Some("play") | Some("stream") => PlaybackState::Playing,
            Some("pause") => PlaybackState::Paused,
            Some("stop") => PlaybackState::Stopped,
            Some("connecting") => PlaybackState::Buffering,
            _ => PlaybackState::Idle,
        };

        let title = xml_text(&xml, "title1");
        let artist = xml_text(&xml, "title2");
        let album = xml_text(&xml, "title3");
        let artwork_url = xml_text(&xml, "image").map(|path| {
            if path.starts_with("http") {
                path
            } else {
                format!("http://{}:11000{}", self.host, path)
            }
        });

        Ok(TransportSnapshot {
            state,
            position_ms: xml_text(&xml, "secs")
                .and_then(|s| s.parse::<u64>().ok())
                .map(|s| s * 1000),
            duration_ms: xml_text(&xml, "totlen")
                .and_then(|s| s.parse::<u64>().ok())
                .map(|s| s * 1000),
            track_key: format!(
                "{}|{}",
                title.clone().unwrap_or_default(),
                artist.clone().unwrap_or_default()
            ),
            title,
            artist,
            album,
            artwork_url,
        })
    }

    // =========================================================================
    // Protocol: commands
    // =========================================================================

    async fn soap(&self, service: &str, action: &str, body: &str) -> Result<String> {
        let url = format!("http://{}:1400/MediaRenderer/{}/Control", self.host, service);
        let envelope = format!(
            r#"<?xml version="1.0" encoding="utf-8"?><s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/"><s:Body>{}</s:Body></s:Envelope>"#,
            body
        );
        let soapaction = format!("\"urn:schemas-upnp-org:service:{}:1#{}\"", service, action);
        self.client
            .post_raw(
                &url,
                "text/xml; charset=\"utf-8\"",
                &[("SOAPACTION", soapaction.as_str())],
                envelope,
                COMMAND_DEADLINE,
            )
            .await
            .map_err(Into::into)
    }

    async fn sonos_command(&self, action: &PlayerAction) -> Result<()> {
        let (verb, extra) = match action {
            PlayerAction::Play => ("Play", "<Speed>1</Speed>"),
            PlayerAction::Pause => ("Pause", ""),
            PlayerAction::Stop => ("Stop", ""),
            PlayerAction::Next => ("Next", ""),
            PlayerAction::Prev => ("Previous", ""),
            PlayerAction::Toggle => {
                let current = self.fetch_sonos().await?.state;
                let boxed = if current == PlaybackState::Playing {
                    PlayerAction::Pause
                } else {
                    PlayerAction::Play
                };
                return Box::pin(self.sonos_command(&boxed)).await;
            }
            PlayerAction::VolumeSet { level } => {
                let body = format!(
                    r#"<u:SetVolume xmlns:u="urn:schemas-upnp-org:service:RenderingControl:1"><InstanceID>0</InstanceID><Channel>Master</Channel><DesiredVolume>{}</DesiredVolume></u:SetVolume>"#,
                    level
                );
                self.client
                    .post_raw(
                        &format!("http://{}:1400/MediaRenderer/RenderingControl/Control", self.host),
                        "text/xml; charset=\"utf-8\"",
                        &[(
                            "SOAPACTION",
                            "\"urn:schemas-upnp-org:service:RenderingControl:1#SetVolume\"",
                        )],
                        format!(
                            r#"<?xml version="1.0" encoding="utf-8"?><s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/"><s:Body>{}</s:Body></s:Envelope>"#,
                            body
                        ),
                        COMMAND_DEADLINE,
                    )
                    .await?;
                return Ok(());
            }
        };
        let body = format!(
            r#"<u:{verb} xmlns:u="urn:schemas-upnp-org:service:AVTransport:1"><InstanceID>0</InstanceID>{extra}</u:{verb}>"#
        );
        self.soap("AVTransport", verb, &body).await?;
        Ok(())
    }

    async fn bluesound_command(&self, action: &PlayerAction) -> Result<()> {
        let path = match action {
            PlayerAction::Play => "/Play".to_string(),
            PlayerAction::Pause => "/Pause".to_string(),
            PlayerAction::Toggle => "/Pause?toggle=1".to_string(),
            PlayerAction::Next => "/Skip".to_string(),
            PlayerAction::Prev => "/Back".to_string(),
            PlayerAction::Stop => "/Stop".to_string(),
            PlayerAction::VolumeSet { level } => format!("/Volume?level={}", level),
        };
        let url = format!("http://{}:11000{}", self.host, path);
        self.client.get_text(&url, COMMAND_DEADLINE).await?;
        Ok(())
    }
}

#[async_trait]
impl Player for SpeakerPlayer {
    fn kind(&self) -> PlayerType {
        self.kind
    }

    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let this = Arc::new(Self {
            kind: self.kind,
            host: self.host.clone(),
            poll: self.poll,
            client: self.client.clone(),
            reporter: self.reporter.clone(),
            state: self.state.clone(),
        });
        tokio::spawn(this.poll_loop(cancel));
        Ok(())
    }

    async fn command(&self, action: PlayerAction, _params: Option<serde_json::Value>) -> Result<()> {
        self.mark_commanded().await;
        match self.kind {
            PlayerType::Sonos => self.sonos_command(&action).await,
            PlayerType::Bluesound => self.bluesound_command(&action).await,
            _ => anyhow::bail!("not a networked speaker"),
        }
    }

    async fn status(&self) -> serde_json::Value {
        let state = self.state.read().await;
        serde_json::json!({
            "kind": format!("{:?}", self.kind).to_lowercase(),
            "host": self.host,
            "reachable": state.reachable,
            "idle_polls": state.idle_polls,
            "transport": state.last.as_ref().map(|t| t.state.to_string()),
        })
    }
}

/// "0:03:21" -> 201000. Sonos reports NOT_IMPLEMENTED for streams.
fn hms_to_ms(text: &str) -> Option<u64> {
    let mut parts = text.split(':').rev();
    let secs: u64 = parts.next()?.parse().ok()?;
    let mins: u64 = parts.next().map(|m| m.parse().unwrap_or(0)).unwrap_or(0);
    let hours: u64 = parts.next().map(|h| h.parse().unwrap_or(0)).unwrap_or(0);
    Some((hours * 3600 + mins * 60 + secs) * 1000)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn hms_parses_and_rejects() {
        assert_eq!(hms_to_ms("0:03:21"), Some(201_000));
        assert_eq!(hms_to_ms("1:00:00"), Some(3_600_000));
        assert_eq!(hms_to_ms("42"), Some(42_000));
        assert_eq!(hms_to_ms("NOT_IMPLEMENTED"), None);
    }

    #[test]
    fn transport_state_comes_out_of_the_soap_body() {
        let xml = "<r><CurrentTransportState>PLAYING</CurrentTransportState></r>";
        assert_eq!(
            xml_text(xml, "CurrentTransportState").as_deref(),
            Some("PLAYING")
        );
    }
}
