//! Configuration management.
//!
//! Two files under `/etc/arcdeck/` (directory overridable via
//! `ARCDECK_CONFIG_DIR`): `config.json` for general settings and
//! `secrets.env` (mode 0600) for credentials. Environment variables with
//! the `ARCDECK__` prefix override individual keys. Validation failures are
//! fatal at startup and name the offending key.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::bus::events::MenuItem;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config: {0}")]
    Load(#[from] ::config::ConfigError),
    #[error("config key `{key}`: {problem}")]
    Invalid { key: &'static str, problem: String },
    #[error("secrets file {path}: {problem}")]
    Secrets { path: String, problem: String },
}

impl ConfigError {
    fn invalid(key: &'static str, problem: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            problem: problem.into(),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Playback backend kind for the configured default player.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerType {
    Sonos,
    Bluesound,
    Local,
    #[default]
    None,
}

/// Output path driven by the volume adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    Sonos,
    Bluesound,
    Powerlink,
    Hdmi,
    Spdif,
    #[default]
    Rca,
    Beolab5,
    C4amp,
}

impl VolumeType {
    /// Whether a player of the given type is the matching reporter for this
    /// adapter. Volume reports from any other player kind are dropped.
    pub fn matches_player(self, player: PlayerType) -> bool {
        matches!(
            (self, player),
            (Self::Sonos, PlayerType::Sonos) | (Self::Bluesound, PlayerType::Bluesound)
        ) || (player == PlayerType::Local
            && matches!(
                self,
                Self::Powerlink | Self::Hdmi | Self::Spdif | Self::Rca | Self::Beolab5 | Self::C4amp
            ))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlayerConfig {
    #[serde(rename = "type", default)]
    pub kind: PlayerType,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    /// Speaker poll interval when active.
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
}

fn default_poll_ms() -> u64 {
    500
}

impl PlayerConfig {
    /// Host or IP of the speaker control endpoint, whichever is set.
    pub fn endpoint(&self) -> Option<&str> {
        self.host.as_deref().or(self.ip.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolumeConfig {
    #[serde(rename = "type", default)]
    pub kind: VolumeType,
    #[serde(default)]
    pub host: Option<String>,
    /// Serial device path for wired output adapters (powerlink, beolab5).
    #[serde(default)]
    pub device: Option<String>,
    /// Safety ceiling; `apply()` clamps to this.
    #[serde(default = "default_volume_max")]
    pub max: u8,
    #[serde(default = "default_volume_step")]
    pub step: u8,
    /// Debounce window for coalescing wheel bursts.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_volume_max() -> u8 {
    100
}

fn default_volume_step() -> u8 {
    2
}

fn default_debounce_ms() -> u64 {
    50
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            kind: VolumeType::default(),
            host: None,
            device: None,
            max: default_volume_max(),
            step: default_volume_step(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

/// Laser position calibration. Positions map linearly onto the arc,
/// anchored at the three calibration points.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Calibration {
    #[serde(default = "default_laser_min")]
    pub laser_min: u16,
    #[serde(default = "default_laser_mid")]
    pub laser_mid: u16,
    #[serde(default = "default_laser_max")]
    pub laser_max: u16,
}

fn default_laser_min() -> u16 {
    3
}

fn default_laser_mid() -> u16 {
    63
}

fn default_laser_max() -> u16 {
    123
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            laser_min: default_laser_min(),
            laser_mid: default_laser_mid(),
            laser_max: default_laser_max(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HidConfig {
    #[serde(default = "default_hid_device")]
    pub device: String,
    /// Fixed report length of the HID endpoint.
    #[serde(default = "default_report_len")]
    pub report_len: usize,
}

fn default_hid_device() -> String {
    "/dev/hidraw0".into()
}

fn default_report_len() -> usize {
    8
}

impl Default for HidConfig {
    fn default() -> Self {
        Self {
            device: default_hid_device(),
            report_len: default_report_len(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngressConfig {
    /// Serial device the IR/rotary bus sniffer reads from.
    #[serde(default)]
    pub ir_device: Option<String>,
    /// Bluetooth controller name, e.g. "hci0".
    #[serde(default = "default_bt_adapter")]
    pub bt_adapter: String,
    /// MAC address of the BT LE remote, if paired.
    #[serde(default)]
    pub bt_device: Option<String>,
}

fn default_bt_adapter() -> String {
    "hci0".into()
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            ir_device: None,
            bt_adapter: default_bt_adapter(),
            bt_device: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalPlayerConfig {
    /// Decoder binary spawned once per track.
    #[serde(default = "default_decoder")]
    pub decoder: String,
    /// Remaining-duration threshold below which the next decoder is
    /// pre-queued for gapless transition.
    #[serde(default = "default_gapless_ms")]
    pub gapless_threshold_ms: u64,
}

fn default_decoder() -> String {
    "arcdeck-decode".into()
}

fn default_gapless_ms() -> u64 {
    2000
}

impl Default for LocalPlayerConfig {
    fn default() -> Self {
        Self {
            decoder: default_decoder(),
            gapless_threshold_ms: default_gapless_ms(),
        }
    }
}

/// One peer the supervisor watches.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisedPeer {
    pub name: String,
    /// Base URL; the supervisor probes `{url}/health`.
    pub url: String,
    /// Service-manager unit restarted on failure.
    pub unit: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_supervisor_interval")]
    pub interval_secs: u64,
    #[serde(default)]
    pub peers: Vec<SupervisedPeer>,
}

fn default_supervisor_interval() -> u64 {
    300
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_supervisor_interval(),
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Ports {
    #[serde(default = "default_input_port")]
    pub input: u16,
    #[serde(default = "default_router_port")]
    pub router: u16,
    #[serde(default = "default_player_port")]
    pub player: u16,
    #[serde(default = "default_ingress_port")]
    pub ingress: u16,
}

fn default_input_port() -> u16 {
    8765
}

fn default_router_port() -> u16 {
    8766
}

fn default_player_port() -> u16 {
    8767
}

fn default_ingress_port() -> u16 {
    8768
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            input: default_input_port(),
            router: default_router_port(),
            player: default_player_port(),
            ingress: default_ingress_port(),
        }
    }
}

// =============================================================================
// Top-level config
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Which configured player receives media keys when no source is
    /// active: "sonos", "bluesound", "local" or "none".
    #[serde(default)]
    pub default_player: PlayerType,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub volume: VolumeConfig,
    #[serde(default)]
    pub menu: Vec<MenuItem>,
    #[serde(default)]
    pub calibration: Calibration,
    #[serde(default)]
    pub ports: Ports,
    #[serde(default)]
    pub hid: HidConfig,
    #[serde(default)]
    pub ingress: IngressConfig,
    #[serde(default)]
    pub local_player: LocalPlayerConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// A source still marked `playing` whose last transition is older than
    /// this is downgraded to gone.
    #[serde(default = "default_source_ttl")]
    pub source_ttl_secs: u64,
    /// Where the router persists `{active_source, last_media}`.
    #[serde(default = "default_state_file")]
    pub state_file: String,
}

fn default_device_name() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

fn default_source_ttl() -> u64 {
    120
}

fn default_state_file() -> String {
    "/var/lib/arcdeck/router-state.json".into()
}

impl Config {
    pub fn input_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.ports.input)
    }

    pub fn router_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.ports.router)
    }

    pub fn player_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.ports.player)
    }

    /// Cross-field validation. Called once at startup; failures are fatal
    /// (exit code 1) with the offending key in the message.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.player.kind {
            PlayerType::Sonos | PlayerType::Bluesound if self.player.endpoint().is_none() => {
                return Err(ConfigError::invalid(
                    "player.ip",
                    format!("required for player.type {:?}", self.player.kind),
                ));
            }
            _ => {}
        }

        if self.volume.max == 0 || self.volume.max > 100 {
            return Err(ConfigError::invalid(
                "volume.max",
                format!("must be in 1..=100, got {}", self.volume.max),
            ));
        }
        if self.volume.step == 0 {
            return Err(ConfigError::invalid("volume.step", "must be at least 1"));
        }
        if matches!(self.volume.kind, VolumeType::Powerlink | VolumeType::Beolab5)
            && self.volume.device.is_none()
        {
            return Err(ConfigError::invalid(
                "volume.device",
                format!("required for volume.type {:?}", self.volume.kind),
            ));
        }
        if matches!(
            self.volume.kind,
            VolumeType::Sonos | VolumeType::Bluesound | VolumeType::C4amp
        ) && self.volume.host.is_none()
            && self.player.endpoint().is_none()
        {
            return Err(ConfigError::invalid(
                "volume.host",
                format!("required for volume.type {:?}", self.volume.kind),
            ));
        }

        let cal = &self.calibration;
        if !(cal.laser_min < cal.laser_mid && cal.laser_mid < cal.laser_max) {
            return Err(ConfigError::invalid(
                "calibration",
                format!(
                    "laser_min < laser_mid < laser_max required, got {}/{}/{}",
                    cal.laser_min, cal.laser_mid, cal.laser_max
                ),
            ));
        }

        if self.hid.report_len == 0 || self.hid.report_len > 64 {
            return Err(ConfigError::invalid(
                "hid.report_len",
                format!("must be in 1..=64, got {}", self.hid.report_len),
            ));
        }

        Ok(())
    }
}

// =============================================================================
// Loading
// =============================================================================

/// Config directory: `ARCDECK_CONFIG_DIR` or `/etc/arcdeck`.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("ARCDECK_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    PathBuf::from("/etc/arcdeck")
}

/// Load and validate the configuration.
pub fn load_config() -> Result<Config, ConfigError> {
    let dir = config_dir();

    let raw = ::config::Config::builder()
        .add_source(
            ::config::File::with_name(&dir.join("config").to_string_lossy()).required(false),
        )
        // ARCDECK__VOLUME__MAX=70 etc.
        .add_source(
            ::config::Environment::with_prefix("ARCDECK")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config: Config = raw.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

/// Load `secrets.env` into the process environment. The file must not be
/// group- or world-readable. Missing file is fine; sources that need
/// credentials will fail their own probes.
pub fn load_secrets() -> Result<usize, ConfigError> {
    let path = config_dir().join("secrets.env");
    let display = path.to_string_lossy().into_owned();

    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(ConfigError::Secrets {
                path: display,
                problem: e.to_string(),
            })
        }
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path)
            .map_err(|e| ConfigError::Secrets {
                path: display.clone(),
                problem: e.to_string(),
            })?
            .permissions()
            .mode();
        if mode & 0o077 != 0 {
            return Err(ConfigError::Secrets {
                path: display,
                problem: format!("mode {:o} is too permissive, want 0600", mode & 0o777),
            });
        }
    }

    let mut loaded = 0;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            std::env::set_var(key.trim(), value.trim());
            loaded += 1;
        }
    }
    Ok(loaded)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }

    #[test]
    fn defaults_validate() {
        let config = base_config();
        config.validate().unwrap();
        assert_eq!(config.calibration.laser_min, 3);
        assert_eq!(config.calibration.laser_max, 123);
        assert_eq!(config.volume.debounce_ms, 50);
        assert_eq!(config.ports.router, 8766);
    }

    #[test]
    fn sonos_player_requires_endpoint() {
        let mut config = base_config();
        config.player.kind = PlayerType::Sonos;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("player.ip"));

        config.player.ip = Some("192.168.1.40".into());
        config.validate().unwrap();
    }

    #[test]
    fn volume_max_bounds() {
        let mut config = base_config();
        config.volume.max = 0;
        assert!(config.validate().is_err());
        config.volume.max = 101;
        assert!(config.validate().is_err());
        config.volume.max = 70;
        config.validate().unwrap();
    }

    #[test]
    fn calibration_must_be_ordered() {
        let mut config = base_config();
        config.calibration.laser_mid = 2;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("calibration"));
    }

    #[test]
    fn wired_volume_requires_device() {
        let mut config = base_config();
        config.volume.kind = VolumeType::Powerlink;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("volume.device"));
    }

    #[test]
    fn adapter_match_rule() {
        assert!(VolumeType::Sonos.matches_player(PlayerType::Sonos));
        assert!(!VolumeType::Sonos.matches_player(PlayerType::Bluesound));
        assert!(VolumeType::Beolab5.matches_player(PlayerType::Local));
        assert!(!VolumeType::Powerlink.matches_player(PlayerType::Sonos));
    }

    #[cfg(unix)]
    #[test]
    #[serial_test::serial]
    fn secrets_load_into_the_environment() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("ARCDECK_CONFIG_DIR", dir.path());
        let path = dir.path().join("secrets.env");
        std::fs::write(&path, "ARC_TEST_TOKEN=abc123\n# comment\n\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();

        let loaded = load_secrets().unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(std::env::var("ARC_TEST_TOKEN").unwrap(), "abc123");

        std::env::remove_var("ARCDECK_CONFIG_DIR");
        std::env::remove_var("ARC_TEST_TOKEN");
    }

    #[cfg(unix)]
    #[test]
    #[serial_test::serial]
    fn permissive_secrets_are_refused() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("ARCDECK_CONFIG_DIR", dir.path());
        let path = dir.path().join("secrets.env");
        std::fs::write(&path, "TOKEN=leaky\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let err = load_secrets().unwrap_err();
        assert!(err.to_string().contains("too permissive"));

        std::env::remove_var("ARCDECK_CONFIG_DIR");
    }

    #[test]
    #[serial_test::serial]
    fn missing_secrets_file_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("ARCDECK_CONFIG_DIR", dir.path());
        assert_eq!(load_secrets().unwrap(), 0);
        std::env::remove_var("ARCDECK_CONFIG_DIR");
    }
}
