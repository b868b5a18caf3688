//! Engine configuration
//!
//! Every timing constant the engine uses lives here so deployments can tune
//! them. Values are milliseconds unless the name says otherwise. A missing
//! config file means all defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Which client variant is running. The interactive variant gets the
/// post-response cooldown and native notifications; the embedded variant
/// relies on backend-reported status instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    #[default]
    Interactive,
    Embedded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationMode {
    /// Notify even while the client is visible
    Always,
    /// Notify only while the client is hidden
    #[default]
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub mode: NotificationMode,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: NotificationMode::Hidden,
        }
    }
}

impl NotificationConfig {
    pub fn allows(&self, visible: bool) -> bool {
        self.enabled && (self.mode == NotificationMode::Always || !visible)
    }
}

/// Reconnect backoff: a fast ramp for the first few attempts, then a slower
/// one with a higher ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub fast_attempts: u32,
    pub fast_base_ms: u64,
    pub fast_max_ms: u64,
    pub slow_base_ms: u64,
    pub slow_max_ms: u64,
    pub jitter_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            fast_attempts: 3,
            fast_base_ms: 1_000,
            fast_max_ms: 8_000,
            slow_base_ms: 2_000,
            slow_max_ms: 32_000,
            jitter_ms: 250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub runtime: RuntimeKind,
    pub notifications: NotificationConfig,
    pub backoff: BackoffConfig,
    /// How long the client must stay hidden before the channel is released
    pub hidden_pause_ms: u64,
    pub health_tick_ms: u64,
    /// Silence on an open channel longer than this triggers a probe
    pub stall_threshold_ms: u64,
    /// Silence longer than this forces a full reload on refocus
    pub stale_resync_ms: u64,
    pub resync_debounce_ms: u64,
    pub incremental_resync_limit: usize,
    pub cooldown_ms: u64,
    pub session_refresh_debounce_ms: u64,
    /// Characters a message may shrink by before an update counts as stale
    pub text_shrink_tolerance: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::Interactive,
            notifications: NotificationConfig::default(),
            backoff: BackoffConfig::default(),
            hidden_pause_ms: 5_000,
            health_tick_ms: 10_000,
            stall_threshold_ms: 45_000,
            stale_resync_ms: 25_000,
            resync_debounce_ms: 750,
            incremental_resync_limit: 50,
            cooldown_ms: 2_000,
            session_refresh_debounce_ms: 100,
            text_shrink_tolerance: 50,
        }
    }
}

impl SyncConfig {
    /// `~/.config/chatsync/config.toml` (platform equivalent)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("chatsync").join("config.toml"))
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let config: SyncConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("health_tick_ms", self.health_tick_ms),
            ("stall_threshold_ms", self.stall_threshold_ms),
            ("hidden_pause_ms", self.hidden_pause_ms),
            ("cooldown_ms", self.cooldown_ms),
            ("backoff.fast_base_ms", self.backoff.fast_base_ms),
            ("backoff.slow_base_ms", self.backoff.slow_base_ms),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.incremental_resync_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "incremental_resync_limit",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.backoff.fast_max_ms < self.backoff.fast_base_ms
            || self.backoff.slow_max_ms < self.backoff.slow_base_ms
        {
            return Err(ConfigError::Invalid {
                field: "backoff",
                reason: "max delay is below base delay".to_string(),
            });
        }
        Ok(())
    }

    pub fn hidden_pause(&self) -> Duration {
        Duration::from_millis(self.hidden_pause_ms)
    }

    pub fn health_tick(&self) -> Duration {
        Duration::from_millis(self.health_tick_ms)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }

    pub fn stale_resync(&self) -> Duration {
        Duration::from_millis(self.stale_resync_ms)
    }

    pub fn resync_debounce(&self) -> Duration {
        Duration::from_millis(self.resync_debounce_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn session_refresh_debounce(&self) -> Duration {
        Duration::from_millis(self.session_refresh_debounce_ms)
    }
}
