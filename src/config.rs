//! TOML configuration for jobscope.
//!
//! Every section has defaults, so an empty or partial file is valid. The file
//! is looked up through `JOBSCOPE_CONFIG`, then `./jobscope.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::observe::{ObserverOptions, PollerConfig, TailConfig};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "JOBSCOPE_CONFIG";

/// Config file picked up from the working directory.
pub const LOCAL_CONFIG_FILE: &str = "jobscope.toml";

/// Backend address used when neither flag, config nor stored preference has one.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobscopeConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl JobscopeConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded jobscope configuration");
        Ok(config)
    }

    /// Try, in order: `$JOBSCOPE_CONFIG`, `./jobscope.toml`, compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "JOBSCOPE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local_path = Path::new(LOCAL_CONFIG_FILE);
        if local_path.exists() {
            match Self::load(local_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local_path.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Observer settings derived from the `[polling]` and `[storage]` sections.
    pub fn observer_options(&self) -> ObserverOptions {
        ObserverOptions {
            poller: self.polling.poller(),
            tail: self.polling.tail(),
            spill_dir: self.storage.spill_dir.clone(),
            ..ObserverOptions::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend address; `/api/v1` is appended when missing. Unset means "use
    /// the stored preference, else the built-in default".
    pub base_url: Option<String>,
    /// Per-request timeout.
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout_secs: 30,
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

/// Poll and tail cadences, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub status_interval_ms: u64,
    /// Consecutive status failures tolerated before giving up.
    pub max_consecutive_failures: u32,
    pub stdout_interval_ms: u64,
    pub screenshot_interval_ms: u64,
    pub chat_log_interval_ms: u64,
    /// Retry period for `script` and `task_results` until they exist.
    pub document_retry_ms: u64,
    /// Default time per frame during playback.
    pub frame_interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            status_interval_ms: 1500,
            max_consecutive_failures: 5,
            stdout_interval_ms: 2000,
            screenshot_interval_ms: 1500,
            chat_log_interval_ms: 2000,
            document_retry_ms: 5000,
            frame_interval_ms: 1000,
        }
    }
}

impl PollingConfig {
    pub fn poller(&self) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(self.status_interval_ms),
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }

    pub fn tail(&self) -> TailConfig {
        TailConfig {
            stdout_interval: Duration::from_millis(self.stdout_interval_ms),
            screenshot_interval: Duration::from_millis(self.screenshot_interval_ms),
            chat_log_interval: Duration::from_millis(self.chat_log_interval_ms),
            document_retry: Duration::from_millis(self.document_retry_ms),
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding history and preferences.
    pub db_path: PathBuf,
    /// Directory for transient screenshot files.
    pub spill_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/jobscope.db"),
            spill_dir: std::env::temp_dir().join("jobscope"),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
