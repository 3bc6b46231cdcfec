//! Router state persistence.
//!
//! `{active_source, last_media}` is written on every transition, staged to
//! a temp file then atomically renamed. On startup the router reads it back
//! and re-probes the named source before trusting the snapshot.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use tracing::{debug, warn};

use crate::bus::MediaSnapshot;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub active_source: Option<String>,
    /// Command URL of the active source, kept so the startup re-probe has
    /// a target without waiting for re-registration.
    #[serde(default)]
    pub active_command_url: Option<String>,
    #[serde(default)]
    pub last_media: Option<MediaSnapshot>,
}

/// Atomic save: write `<path>.tmp`, fsync, rename over the target.
pub fn save(path: &Path, state: &PersistedState) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("tmp");
    let json = serde_json::to_vec_pretty(state)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    {
        use std::io::Write;
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    debug!(path = %path.display(), "router state persisted");
    Ok(())
}

/// Best-effort load. A missing or corrupt file yields a fresh state.
pub fn load(path: &Path) -> PersistedState {
    match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring corrupt state file");
                PersistedState::default()
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => PersistedState::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "state file unreadable");
            PersistedState::default()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::bus::PlaybackState;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/router-state.json");

        let state = PersistedState {
            active_source: Some("cd".into()),
            active_command_url: Some("http://127.0.0.1:8769/command".into()),
            last_media: Some(MediaSnapshot {
                title: Some("A".into()),
                state: PlaybackState::Playing,
                ..Default::default()
            }),
        };
        save(&path, &state).unwrap();

        let loaded = load(&path);
        assert_eq!(loaded.active_source.as_deref(), Some("cd"));
        assert_eq!(loaded.last_media.unwrap().title.as_deref(), Some("A"));
        // No stray temp file left behind.
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn missing_file_is_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = load(&dir.path().join("nope.json"));
        assert!(state.active_source.is_none());
        assert!(state.last_media.is_none());
    }

    #[test]
    fn corrupt_file_is_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();
        let state = load(&path);
        assert!(state.active_source.is_none());
    }
}
