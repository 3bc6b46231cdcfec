//! Concrete volume output backends.
//!
//! Selected by `volume.type` in configuration. Network speakers are driven
//! over their control protocols (Sonos SOAP, Bluesound HTTP); wired paths
//! write frames to a serial device; the ALSA-backed paths shell out to
//! amixer. Backends clamp to the configured ceiling themselves so `apply`
//! can honestly return the level actually set.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use crate::config::{PlayerConfig, VolumeConfig, VolumeType};
use crate::peer::xml::xml_u8;
use crate::peer::{PeerClient, COMMAND_DEADLINE};
use crate::volume::{clamp_level, VolumeAdapter};

/// Build the adapter selected by configuration.
pub fn build(
    config: &VolumeConfig,
    player: &PlayerConfig,
    client: PeerClient,
) -> Result<Arc<dyn VolumeAdapter>> {
    let host = config
        .host
        .as_deref()
        .or_else(|| player.endpoint())
        .map(str::to_string);

    let adapter: Arc<dyn VolumeAdapter> = match config.kind {
        VolumeType::Sonos => Arc::new(SonosVolume {
            host: host.context("volume.host required for sonos")?,
            max: config.max,
            client,
        }),
        VolumeType::Bluesound => Arc::new(BluesoundVolume {
            host: host.context("volume.host required for bluesound")?,
            max: config.max,
            client,
        }),
        VolumeType::Powerlink | VolumeType::Beolab5 => Arc::new(SerialVolume {
            kind: config.kind,
            device: config
                .device
                .clone()
                .context("volume.device required for wired outputs")?,
            max: config.max,
            level: AtomicU8::new(0),
        }),
        VolumeType::Hdmi | VolumeType::Spdif | VolumeType::Rca => Arc::new(MixerVolume {
            kind: config.kind,
            control: match config.kind {
                VolumeType::Hdmi => "HDMI",
                VolumeType::Spdif => "IEC958",
                _ => "Master",
            },
            max: config.max,
        }),
        VolumeType::C4amp => Arc::new(C4ampVolume {
            host: host.context("volume.host required for c4amp")?,
            max: config.max,
            level: AtomicU8::new(0),
        }),
    };
    Ok(adapter)
}

// =============================================================================
// Sonos (UPnP RenderingControl)
// =============================================================================

struct SonosVolume {
    host: String,
    max: u8,
    client: PeerClient,
}

impl SonosVolume {
    fn control_url(&self) -> String {
        format!("http://{}:1400/MediaRenderer/RenderingControl/Control", self.host)
    }

    async fn soap(&self, action: &str, body: String) -> Result<String> {
        let envelope = format!(
            r#"<?xml version="1.0" encoding="utf-8"?><s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/"><s:Body>{}</s:Body></s:Envelope>"#,
            body
        );
        let soapaction = format!(
            "\"urn:schemas-upnp-org:service:RenderingControl:1#{}\"",
            action
        );
        self.client
            .post_raw(
                &self.control_url(),
                "text/xml; charset=\"utf-8\"",
                &[("SOAPACTION", soapaction.as_str())],
                envelope,
                COMMAND_DEADLINE,
            )
            .await
            .map_err(Into::into)
    }
}

#[async_trait]
impl VolumeAdapter for SonosVolume {
    fn kind(&self) -> VolumeType {
        VolumeType::Sonos
    }

    async fn apply(&self, level: u8, _balance: Option<i8>) -> Result<u8> {
        let clamped = clamp_level(level, self.max);
        let body = format!(
            r#"<u:SetVolume xmlns:u="urn:schemas-upnp-org:service:RenderingControl:1"><InstanceID>0</InstanceID><Channel>Master</Channel><DesiredVolume>{}</DesiredVolume></u:SetVolume>"#,
            clamped
        );
        self.soap("SetVolume", body).await?;
        Ok(clamped)
    }

    async fn report(&self) -> Result<u8> {
        let body = r#"<u:GetVolume xmlns:u="urn:schemas-upnp-org:service:RenderingControl:1"><InstanceID>0</InstanceID><Channel>Master</Channel></u:GetVolume>"#.to_string();
        let response = self.soap("GetVolume", body).await?;
        xml_u8(&response, "CurrentVolume").context("no CurrentVolume in response")
    }
}

// =============================================================================
// Bluesound (BluOS HTTP)
// =============================================================================

struct BluesoundVolume {
    host: String,
    max: u8,
    client: PeerClient,
}

impl BluesoundVolume {
    fn url(&self, query: &str) -> String {
        format!("http://{}:11000/Volume{}", self.host, query)
    }
}

#[async_trait]
impl VolumeAdapter for BluesoundVolume {
    fn kind(&self) -> VolumeType {
        VolumeType::Bluesound
    }

    async fn apply(&self, level: u8, _balance: Option<i8>) -> Result<u8> {
        let clamped = clamp_level(level, self.max);
        self.client
            .post_raw(
                &self.url(&format!("?level={}", clamped)),
                "text/plain",
                &[],
                String::new(),
                COMMAND_DEADLINE,
            )
            .await?;
        Ok(clamped)
    }

    async fn report(&self) -> Result<u8> {
        let xml = self
            .client
            .post_raw(&self.url(""), "text/plain", &[], String::new(), COMMAND_DEADLINE)
            .await?;
        xml_u8(&xml, "volume").context("no volume element in response")
    }
}

// =============================================================================
// Wired serial outputs (powerlink bus, beolab5 link)
// =============================================================================

struct SerialVolume {
    kind: VolumeType,
    device: String,
    max: u8,
    /// Serial paths are write-only; report() answers from this cache.
    level: AtomicU8,
}

impl SerialVolume {
    fn frame(&self, level: u8, balance: Option<i8>) -> Vec<u8> {
        let bal = balance.unwrap_or(0).clamp(-50, 50) as i16 + 50;
        match self.kind {
            // Powerlink volume frame: sync, command, level, balance, checksum.
            VolumeType::Powerlink => {
                let payload = [0x60u8, 0x01, level, bal as u8];
                let checksum = payload.iter().fold(0u8, |a, b| a.wrapping_add(*b));
                let mut frame = payload.to_vec();
                frame.push(checksum);
                frame
            }
            // BeoLab 5 takes a plain two-byte set-level frame per channel.
            _ => vec![0x05, level],
        }
    }
}

#[async_trait]
impl VolumeAdapter for SerialVolume {
    fn kind(&self) -> VolumeType {
        self.kind
    }

    async fn apply(&self, level: u8, balance: Option<i8>) -> Result<u8> {
        let clamped = clamp_level(level, self.max);
        let mut port = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.device)
            .await
            .with_context(|| format!("open {}", self.device))?;
        port.write_all(&self.frame(clamped, balance)).await?;
        port.flush().await?;
        self.level.store(clamped, Ordering::SeqCst);
        Ok(clamped)
    }

    async fn power(&self, on: bool) -> Result<()> {
        let mut port = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.device)
            .await
            .with_context(|| format!("open {}", self.device))?;
        port.write_all(&[0x0c, u8::from(on)]).await?;
        port.flush().await?;
        Ok(())
    }

    async fn report(&self) -> Result<u8> {
        Ok(self.level.load(Ordering::SeqCst))
    }
}

// =============================================================================
// ALSA mixer outputs (hdmi, spdif, rca)
// =============================================================================

struct MixerVolume {
    kind: VolumeType,
    control: &'static str,
    max: u8,
}

#[async_trait]
impl VolumeAdapter for MixerVolume {
    fn kind(&self) -> VolumeType {
        self.kind
    }

    async fn apply(&self, level: u8, _balance: Option<i8>) -> Result<u8> {
        let clamped = clamp_level(level, self.max);
        let output = tokio::process::Command::new("amixer")
            .args(["sset", self.control, &format!("{}%", clamped)])
            .output()
            .await
            .context("spawn amixer")?;
        if !output.status.success() {
            anyhow::bail!(
                "amixer sset {} failed: {}",
                self.control,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(clamped)
    }

    async fn report(&self) -> Result<u8> {
        let output = tokio::process::Command::new("amixer")
            .args(["sget", self.control])
            .output()
            .await
            .context("spawn amixer")?;
        let text = String::from_utf8_lossy(&output.stdout);
        parse_mixer_percent(&text).context("no percentage in amixer output")
    }
}

// =============================================================================
// Control4 amplifier (TCP line protocol)
// =============================================================================

struct C4ampVolume {
    host: String,
    max: u8,
    level: AtomicU8,
}

#[async_trait]
impl VolumeAdapter for C4ampVolume {
    fn kind(&self) -> VolumeType {
        VolumeType::C4amp
    }

    async fn apply(&self, level: u8, _balance: Option<i8>) -> Result<u8> {
        let clamped = clamp_level(level, self.max);
        let mut stream = tokio::net::TcpStream::connect(format!("{}:8750", self.host))
            .await
            .with_context(|| format!("connect c4amp at {}", self.host))?;
        stream
            .write_all(format!("c4.amp.out 01 {:03}\r\n", clamped).as_bytes())
            .await?;
        self.level.store(clamped, Ordering::SeqCst);
        Ok(clamped)
    }

    async fn power(&self, on: bool) -> Result<()> {
        let mut stream = tokio::net::TcpStream::connect(format!("{}:8750", self.host))
            .await
            .with_context(|| format!("connect c4amp at {}", self.host))?;
        let state = if on { "01" } else { "00" };
        stream
            .write_all(format!("c4.amp.power {}\r\n", state).as_bytes())
            .await?;
        Ok(())
    }

    async fn report(&self) -> Result<u8> {
        Ok(self.level.load(Ordering::SeqCst))
    }
}

// =============================================================================
// Parsing helpers
// =============================================================================

/// Pull the first `[NN%]` figure out of amixer output.
fn parse_mixer_percent(text: &str) -> Option<u8> {
    let start = text.find('[')?;
    let end = text[start..].find("%]")? + start;
    text[start + 1..end].trim().parse().ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn parses_amixer_percent() {
        let out = "Simple mixer control 'Master',0\n  Front Left: Playback 52428 [80%] [on]\n";
        assert_eq!(parse_mixer_percent(out), Some(80));
        assert_eq!(parse_mixer_percent("no percents here"), None);
    }

    #[test]
    fn powerlink_frame_has_checksum() {
        let serial = SerialVolume {
            kind: VolumeType::Powerlink,
            device: "/dev/null".into(),
            max: 100,
            level: AtomicU8::new(0),
        };
        let frame = serial.frame(40, Some(-10));
        assert_eq!(frame.len(), 5);
        let expected: u8 = frame[..4].iter().fold(0u8, |a, b| a.wrapping_add(*b));
        assert_eq!(frame[4], expected);
    }
}
