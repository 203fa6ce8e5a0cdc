use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

// ── Store ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Location of the redb mirror file.  Overridden at runtime by the
    /// `MARKMIRROR_STORE_PATH` environment variable when set.
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: ".markmirror/mirror.redb".to_string(),
        }
    }
}

// ── Provider ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// JSON bookmark tree read by the file provider.  Accepts either a plain
    /// node tree or a Chromium `Bookmarks` file.
    pub tree_path: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            tree_path: ".markmirror/bookmarks.json".to_string(),
        }
    }
}

// ── Sync engine ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Mutations per bootstrap transaction.  Each batch commits its own
    /// progress marker so an interrupted bootstrap can restart cleanly.
    pub batch_size: usize,
    /// How long incoming provider events are collected before being
    /// normalized and applied as one transaction.  Identical events seen
    /// inside this window are applied once.
    pub coalesce_window_ms: u64,
    /// Upper bound on events folded into one incremental batch.
    pub max_batch_events: usize,
    /// First retry delay after the store or provider becomes unavailable.
    pub retry_base_ms: u64,
    /// Ceiling for the exponential retry delay.
    pub retry_max_ms: u64,
    /// Run a full structural verification of the store on cold start and
    /// bootstrap if it reports any violation.
    pub verify_on_start: bool,
    /// Default result cap for `search`.
    pub search_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            coalesce_window_ms: 50,
            max_batch_events: 1000,
            retry_base_ms: 1000,
            retry_max_ms: 60_000,
            verify_on_start: false,
            search_limit: 50,
        }
    }
}

impl SyncConfig {
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    /// Exponential backoff delay for the given (zero-based) attempt.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
        let millis = self.retry_base_ms.saturating_mul(factor).min(self.retry_max_ms);
        Duration::from_millis(millis)
    }
}

// ── Daemon / telemetry ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/markmirror.sock".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub provider: ProviderConfig,
    pub sync: SyncConfig,
    pub daemon: DaemonConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        config.apply_overrides(|key| env::var(key).ok());
        Ok(config)
    }

    /// Apply `MARKMIRROR_STORE_PATH` and `MARKMIRROR_SOCKET` as looked up by
    /// `lookup`.  Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("MARKMIRROR_STORE_PATH").filter(|v| !v.is_empty()) {
            self.store.path = value;
        }
        if let Some(value) = lookup("MARKMIRROR_SOCKET").filter(|v| !v.is_empty()) {
            self.daemon.socket_path = value;
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
