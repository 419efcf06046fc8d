use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::sync::LockDurations;

/// Session configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub mesh: MeshConfig,
    pub timings: SyncTimings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Delay before an initiator retries a dropped link
    pub reconnect_delay_ms: u64,
    /// STUN/TURN URLs handed to real peer transports
    pub ice_servers: Vec<String>,
    /// Upper bound on simultaneous links (0 = unlimited)
    pub max_peers: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 3000,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            max_peers: 0,
        }
    }
}

impl MeshConfig {
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Lock windows, debounce delays and drift thresholds
///
/// Tuned against real network and buffering delays; adjust for the target
/// environment rather than treating them as constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncTimings {
    /// Hydration lock engaged when a snapshot is applied
    pub hydration_ms: u64,
    /// Delay between applying a snapshot and seeking to its position
    pub hydration_seek_delay_ms: u64,
    /// Echo-suppress window covering the hydration seek and its buffering
    pub hydration_settle_ms: u64,
    /// Echo-suppress window after a remote play or pause
    pub remote_playback_settle_ms: u64,
    /// Echo-suppress window after a remote seek
    pub remote_seek_settle_ms: u64,
    /// Seek lock after a local seek is broadcast
    pub local_seek_settle_ms: u64,
    /// Echo-suppress window after switching items
    pub item_load_settle_ms: u64,
    /// Echo-suppress window after a time-update correction
    pub time_update_settle_ms: u64,
    pub pause_debounce_ms: u64,
    /// Pause-debounce lock engaged on buffering
    pub buffering_ms: u64,
    pub seek_jump_threshold_secs: f64,
    pub play_drift_tolerance_secs: f64,
    pub time_update_drift_tolerance_secs: f64,
    pub chat_history: usize,
}

impl Default for SyncTimings {
    fn default() -> Self {
        Self {
            hydration_ms: 2000,
            hydration_seek_delay_ms: 1000,
            hydration_settle_ms: 3000,
            remote_playback_settle_ms: 1000,
            remote_seek_settle_ms: 1500,
            local_seek_settle_ms: 2000,
            item_load_settle_ms: 4000,
            time_update_settle_ms: 500,
            pause_debounce_ms: 1000,
            buffering_ms: 1500,
            seek_jump_threshold_secs: 2.0,
            play_drift_tolerance_secs: 2.0,
            time_update_drift_tolerance_secs: 1.0,
            chat_history: 200,
        }
    }
}

impl SyncTimings {
    #[must_use]
    pub const fn hydration_seek_delay(&self) -> Duration {
        Duration::from_millis(self.hydration_seek_delay_ms)
    }

    #[must_use]
    pub const fn hydration_settle(&self) -> Duration {
        Duration::from_millis(self.hydration_settle_ms)
    }

    #[must_use]
    pub const fn remote_seek_settle(&self) -> Duration {
        Duration::from_millis(self.remote_seek_settle_ms)
    }

    #[must_use]
    pub const fn item_load_settle(&self) -> Duration {
        Duration::from_millis(self.item_load_settle_ms)
    }

    #[must_use]
    pub const fn time_update_settle(&self) -> Duration {
        Duration::from_millis(self.time_update_settle_ms)
    }

    #[must_use]
    pub const fn pause_debounce(&self) -> Duration {
        Duration::from_millis(self.pause_debounce_ms)
    }

    /// Default windows of the named locks
    #[must_use]
    pub const fn lock_durations(&self) -> LockDurations {
        LockDurations {
            hydration: Duration::from_millis(self.hydration_ms),
            echo_suppress: Duration::from_millis(self.remote_playback_settle_ms),
            seek: Duration::from_millis(self.local_seek_settle_ms),
            pause_debounce: Duration::from_millis(self.buffering_ms),
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // SYNCTV_MESH_MESH__RECONNECT_DELAY_MS, SYNCTV_MESH_TIMINGS__PAUSE_DEBOUNCE_MS, ...
        builder = builder.add_source(
            Environment::with_prefix("SYNCTV_MESH")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("mesh.ice_servers")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Collect every configuration problem
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {:?}",
                self.logging.format
            ));
        }
        if self.mesh.reconnect_delay_ms == 0 {
            errors.push("mesh.reconnect_delay_ms must be greater than zero".to_string());
        }

        let t = &self.timings;
        let windows = [
            ("hydration_ms", t.hydration_ms),
            ("hydration_settle_ms", t.hydration_settle_ms),
            ("remote_playback_settle_ms", t.remote_playback_settle_ms),
            ("remote_seek_settle_ms", t.remote_seek_settle_ms),
            ("local_seek_settle_ms", t.local_seek_settle_ms),
            ("item_load_settle_ms", t.item_load_settle_ms),
            ("time_update_settle_ms", t.time_update_settle_ms),
            ("pause_debounce_ms", t.pause_debounce_ms),
            ("buffering_ms", t.buffering_ms),
        ];
        for (name, value) in windows {
            if value == 0 {
                errors.push(format!("timings.{name} must be greater than zero"));
            }
        }

        let thresholds = [
            ("seek_jump_threshold_secs", t.seek_jump_threshold_secs),
            ("play_drift_tolerance_secs", t.play_drift_tolerance_secs),
            ("time_update_drift_tolerance_secs", t.time_update_drift_tolerance_secs),
        ];
        for (name, value) in thresholds {
            if !value.is_finite() || value < 0.0 {
                errors.push(format!("timings.{name} must be a non-negative number"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
