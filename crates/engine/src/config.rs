// Engine configuration.
//
// Every timing and capacity knob lives here so tests can shrink windows
// and deployments can tune them. Loaded from TOML; missing fields fall
// back to defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding per-room local cache databases.
    pub cache_dir: PathBuf,
    /// Maximum concurrent connections per room (best-effort limit).
    pub room_capacity: usize,
    /// How long to wait after connecting before counting presence
    /// entries for the capacity check.
    pub presence_settle_ms: u64,
    /// Presence entries not refreshed within this window are inferred
    /// as departed (crashed peer, no graceful leave message).
    pub presence_stale_secs: u64,
    /// Quiet period after the last local edit before an autosave fires.
    pub save_debounce_ms: u64,
    /// Retain a version snapshot every Nth save...
    pub snapshot_every_n_saves: u32,
    /// ...or when this many seconds have passed since the last one,
    /// whichever comes first.
    pub snapshot_every_seconds: u64,
    /// Local cache entries older than this are discarded before load.
    pub cache_stale_hours: i64,
    /// Grace window after the last disconnect before the room is torn
    /// down; a connect within the window cancels the teardown.
    pub teardown_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("noteroom"),
            room_capacity: 6,
            presence_settle_ms: 300,
            presence_stale_secs: 30,
            save_debounce_ms: 2_000,
            snapshot_every_n_saves: 5,
            snapshot_every_seconds: 120,
            cache_stale_hours: 24,
            teardown_grace_ms: 500,
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file. Missing fields use defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn presence_settle(&self) -> Duration {
        Duration::from_millis(self.presence_settle_ms)
    }

    pub fn presence_stale(&self) -> Duration {
        Duration::from_secs(self.presence_stale_secs)
    }

    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_every_seconds)
    }

    pub fn cache_staleness(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cache_stale_hours)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
}
