//! Shared wire model for the event fabric.
//!
//! Every message exchanged over localhost — input events, media snapshots,
//! source records, menu updates — is defined here so the services agree on
//! one schema. The wire envelope is `{type, data, reason?, seq, timestamp}`;
//! known payloads are typed, unknown `type` values are logged and ignored at
//! fan-in points rather than raised.

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Input events
// =============================================================================

/// Rotation direction of the nav / volume wheels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpinDirection {
    Clock,
    Counter,
}

impl SpinDirection {
    /// Signed unit delta: clockwise is positive.
    pub fn sign(self) -> i32 {
        match self {
            Self::Clock => 1,
            Self::Counter => -1,
        }
    }
}

/// Where an input event came from. Emulated events are indistinguishable to
/// subscribers apart from this marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOrigin {
    Hid,
    Emulated,
}

/// Semantic input events decoded from raw HID reports (or emulated).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum InputEvent {
    /// Laser pointer position on the arc, plus the derived angle.
    Laser { position: u16, angle: f64 },
    /// Nav wheel detent crossing; speed is detents per decode interval.
    Nav { direction: SpinDirection, speed: u32 },
    /// Volume wheel detent crossing; same shape as nav.
    Volume { direction: SpinDirection, speed: u32 },
    /// Button press edge (0 -> 1). Names are matched case-insensitively.
    Button { button: String },
    /// HID endpoint came or went; subscribers stay connected either way.
    DeviceState {
        connected: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl InputEvent {
    /// Wire `type` value for this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Laser { .. } => "laser",
            Self::Nav { .. } => "nav",
            Self::Volume { .. } => "volume",
            Self::Button { .. } => "button",
            Self::DeviceState { .. } => "device_state",
        }
    }
}

// =============================================================================
// Media snapshots
// =============================================================================

/// Playback state as reported by players and carried on media snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Playing,
    Paused,
    Stopped,
    Buffering,
    #[default]
    Idle,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Playing => write!(f, "playing"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
            Self::Buffering => write!(f, "buffering"),
            Self::Idle => write!(f, "idle"),
        }
    }
}

impl From<&str> for PlaybackState {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "playing" | "play" => Self::Playing,
            "paused" | "pause" => Self::Paused,
            "stopped" | "stop" => Self::Stopped,
            "buffering" | "loading" => Self::Buffering,
            _ => Self::Idle,
        }
    }
}

/// The last-known now-playing record. At most one snapshot is broadcast as
/// authoritative at a time; the router is its single writer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    /// Retained across stop transitions so the UI dims instead of flashing
    /// a broken-image placeholder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork_url: Option<String>,
    #[serde(default)]
    pub state: PlaybackState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Reason string a snapshot carries when a third party took over a
/// networked speaker.
pub const REASON_EXTERNAL_TAKEOVER: &str = "external_takeover";

// =============================================================================
// Source records
// =============================================================================

/// Lifecycle state a source announces for itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    #[default]
    Idle,
    Playing,
    Paused,
    Gone,
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Playing => write!(f, "playing"),
            Self::Paused => write!(f, "paused"),
            Self::Gone => write!(f, "gone"),
        }
    }
}

/// Whether a source produces audio on the device or on a networked speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerKind {
    Local,
    Remote,
}

/// Media-key actions a source may declare in its `handles` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaAction {
    Play,
    Pause,
    Toggle,
    Next,
    Prev,
    Stop,
}

impl MediaAction {
    /// Parse a wire action string. Case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "play" => Some(Self::Play),
            "pause" => Some(Self::Pause),
            "toggle" | "playpause" => Some(Self::Toggle),
            "next" => Some(Self::Next),
            "prev" | "previous" => Some(Self::Prev),
            "stop" => Some(Self::Stop),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Toggle => "toggle",
            Self::Next => "next",
            Self::Prev => "prev",
            Self::Stop => "stop",
        }
    }
}

impl fmt::Display for MediaAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The full record a source posts to `POST /router/source`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Stable short identifier, e.g. "cd", "radio", "usb".
    pub id: String,
    #[serde(default)]
    pub state: SourceState,
    pub name: String,
    /// Localhost URL where the source accepts control commands.
    pub command_url: String,
    pub player: PlayerKind,
    /// Actions the source accepts; commands outside this set are rejected,
    /// never silently dropped.
    #[serde(default)]
    pub handles: Vec<MediaAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub menu_preset: Option<String>,
}

impl SourceRecord {
    pub fn handles(&self, action: MediaAction) -> bool {
        self.handles.contains(&action)
    }
}

// =============================================================================
// Menu model
// =============================================================================

/// One entry in the device menu held by the input daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItem {
    pub label: String,
    pub route: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
}

// =============================================================================
// Wire envelope
// =============================================================================

/// The envelope every WebSocket message and telemetry broadcast travels in.
///
/// `seq` is monotonic per emitting service; `timestamp` is wall-clock
/// milliseconds. Unknown `type` values must be tolerated by receivers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub seq: u64,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<EventOrigin>,
}

impl Envelope {
    /// Build an envelope with the current wall-clock timestamp. `seq` is
    /// stamped by the emitting service.
    pub fn new(kind: impl Into<String>, data: serde_json::Value, seq: u64) -> Self {
        Self {
            kind: kind.into(),
            data,
            reason: None,
            seq,
            timestamp: chrono::Utc::now().timestamp_millis(),
            origin: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_origin(mut self, origin: EventOrigin) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Envelope for a decoded (or emulated) input event.
    pub fn input(event: &InputEvent, seq: u64, origin: EventOrigin) -> Self {
        let data = match serde_json::to_value(event) {
            Ok(serde_json::Value::Object(map)) => {
                map.get("data").cloned().unwrap_or(serde_json::Value::Null)
            }
            _ => serde_json::Value::Null,
        };
        Self::new(event.event_type(), data, seq).with_origin(origin)
    }

    /// Envelope for a media snapshot broadcast.
    pub fn media_update(snapshot: &MediaSnapshot, seq: u64) -> Self {
        let mut env = Self::new(
            "media_update",
            serde_json::to_value(snapshot).unwrap_or(serde_json::Value::Null),
            seq,
        );
        env.reason = snapshot.reason.clone();
        env
    }

    /// Envelope for a source lifecycle notification.
    pub fn source_update(record: &SourceRecord, seq: u64) -> Self {
        Self::new(
            "source_update",
            serde_json::to_value(record).unwrap_or(serde_json::Value::Null),
            seq,
        )
    }

    /// Envelope for a menu change broadcast.
    pub fn menu_update(menu: &[MenuItem], seq: u64) -> Self {
        Self::new("menu_update", serde_json::json!({ "items": menu }), seq)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn playback_state_from_str() {
        assert_eq!(PlaybackState::from("playing"), PlaybackState::Playing);
        assert_eq!(PlaybackState::from("PAUSED"), PlaybackState::Paused);
        assert_eq!(PlaybackState::from("stop"), PlaybackState::Stopped);
        assert_eq!(PlaybackState::from("whatever"), PlaybackState::Idle);
    }

    #[test]
    fn media_action_parse_is_case_insensitive() {
        assert_eq!(MediaAction::parse("Play"), Some(MediaAction::Play));
        assert_eq!(MediaAction::parse("NEXT"), Some(MediaAction::Next));
        assert_eq!(MediaAction::parse("previous"), Some(MediaAction::Prev));
        assert_eq!(MediaAction::parse("eject"), None);
    }

    #[test]
    fn input_event_envelope_shape() {
        let event = InputEvent::Nav {
            direction: SpinDirection::Clock,
            speed: 3,
        };
        let env = Envelope::input(&event, 7, EventOrigin::Hid);
        assert_eq!(env.kind, "nav");
        assert_eq!(env.seq, 7);
        assert_eq!(env.data["direction"], "clock");
        assert_eq!(env.data["speed"], 3);

        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "nav");
        assert_eq!(json["origin"], "hid");
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn source_record_tolerates_unknown_fields() {
        let json = r#"{
            "id": "cd",
            "state": "playing",
            "name": "CD",
            "command_url": "http://127.0.0.1:8769/command",
            "player": "local",
            "handles": ["play", "pause"],
            "firmware_blob": "ignored"
        }"#;
        let record: SourceRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, "cd");
        assert_eq!(record.player, PlayerKind::Local);
        assert!(record.handles(MediaAction::Pause));
        assert!(!record.handles(MediaAction::Next));
    }

    #[test]
    fn media_snapshot_reason_rides_the_envelope() {
        let snapshot = MediaSnapshot {
            title: Some("B".into()),
            artist: Some("Y".into()),
            state: PlaybackState::Playing,
            reason: Some(REASON_EXTERNAL_TAKEOVER.into()),
            ..Default::default()
        };
        let env = Envelope::media_update(&snapshot, 1);
        assert_eq!(env.kind, "media_update");
        assert_eq!(env.reason.as_deref(), Some(REASON_EXTERNAL_TAKEOVER));
    }

    #[test]
    fn spin_direction_sign() {
        assert_eq!(SpinDirection::Clock.sign(), 1);
        assert_eq!(SpinDirection::Counter.sign(), -1);
    }
}
