//! Persisted per-installation state: the machine identity and the relay
//! address remembered for each channel.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::DEFAULT_RELAY_BASE;
use crate::identity::PeerId;

const STATE_FILE: &str = "state.toml";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("no data directory available on this platform")]
    NoDataDir,
    #[error("failed to access {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid state file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to encode state: {0}")]
    Encode(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub relay: String,
}

impl ChannelConfig {
    pub fn for_channel(relay_base: &str, channel: &str) -> Self {
        Self {
            relay: format!("{}/subnet/{}", relay_base.trim_end_matches('/'), channel),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalState {
    pub machine_id: PeerId,
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,
    #[serde(skip)]
    path: PathBuf,
}

impl LocalState {
    pub fn default_dir() -> Result<PathBuf, StateError> {
        ProjectDirs::from("dev", "tidepool", "tidepool")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .ok_or(StateError::NoDataDir)
    }

    /// Reads `state.toml` under `dir`, creating it with a fresh identity on first run.
    pub fn load_or_init(dir: &Path) -> Result<Self, StateError> {
        let path = dir.join(STATE_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => {
                let mut state: LocalState =
                    toml::from_str(&text).map_err(|source| StateError::Parse {
                        path: path.clone(),
                        source,
                    })?;
                state.path = path;
                if state.machine_id.is_empty() {
                    state.machine_id = PeerId::generate();
                    state.save()?;
                }
                Ok(state)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let state = LocalState {
                    machine_id: PeerId::generate(),
                    channels: BTreeMap::new(),
                    path,
                };
                state.save()?;
                info!(machine_id = %state.machine_id, "generated machine identity");
                Ok(state)
            }
            Err(source) => Err(StateError::Io { path, source }),
        }
    }

    /// Relay settings for `channel`, remembering a default entry the first time.
    pub fn channel(
        &mut self,
        channel: &str,
        relay_base: Option<&str>,
    ) -> Result<ChannelConfig, StateError> {
        if let Some(existing) = self.channels.get(channel) {
            return Ok(existing.clone());
        }
        let config =
            ChannelConfig::for_channel(relay_base.unwrap_or(DEFAULT_RELAY_BASE), channel);
        self.channels.insert(channel.to_string(), config.clone());
        self.save()?;
        Ok(config)
    }

    pub fn set_channel(&mut self, channel: &str, config: ChannelConfig) -> Result<(), StateError> {
        self.channels.insert(channel.to_string(), config);
        self.save()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| StateError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let text = toml::to_string_pretty(self)?;
        fs::write(&self.path, text).map_err(|source| StateError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn identity_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let first = LocalState::load_or_init(dir.path()).unwrap();
        let second = LocalState::load_or_init(dir.path()).unwrap();
        assert_eq!(first.machine_id, second.machine_id);
        assert!(second.path().ends_with(STATE_FILE));
    }

    #[test_timeout::timeout]
    fn channel_defaults_are_remembered() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = LocalState::load_or_init(dir.path()).unwrap();
        let config = state.channel("taproah", Some("wss://relay.example/")).unwrap();
        assert_eq!(config.relay, "wss://relay.example/subnet/taproah");

        let mut reloaded = LocalState::load_or_init(dir.path()).unwrap();
        let again = reloaded.channel("taproah", None).unwrap();
        assert_eq!(again, config);
    }

    #[test_timeout::timeout]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(STATE_FILE), "machine_id = [").unwrap();
        let err = LocalState::load_or_init(dir.path()).unwrap_err();
        assert!(matches!(err, StateError::Parse { .. }));
    }
}
