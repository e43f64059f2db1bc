//! Configuration loading and persistence.
//!
//! Reads `config.json` from the stormhub config directory and layers
//! `STORMHUB_*` environment overrides on top.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::client::Dialect;
use crate::constants::{
    DEFAULT_KILL_JOIN_TIMEOUT, DEFAULT_MAILBOX_CAPACITY, DEFAULT_MOVE_TIMEOUT,
    DEFAULT_POLL_INTERVAL,
};
use crate::sanitizer::SanitizerConfig;

/// Configuration for the stormhub middleware.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Game server host.
    pub game_host: String,
    /// Game server port.
    pub game_port: u16,
    /// Address the primary front-end client connects to.
    pub listen: String,
    /// Optional address for a secondary (detachable) client.
    pub secondary_listen: Option<String>,
    /// Encoding used for the primary client.
    pub dialect: Dialect,
    /// Encoding used for the secondary client.
    pub secondary_dialect: Dialect,
    /// Directory scripts are loaded from.
    pub script_dir: PathBuf,
    /// Capacity of each per-script mailbox, in lines.
    pub mailbox_capacity: usize,
    /// Suspension-point poll interval, in milliseconds.
    pub poll_ms: u64,
    /// How long a kill waits for worker threads, in milliseconds.
    pub kill_join_timeout_ms: u64,
    /// Deadline for `move` to observe a room change, in milliseconds.
    pub move_timeout_ms: u64,
    /// Character-specific bonus used in mana pulse inference.
    pub mana_stat_bonus: i32,
    /// Stream repair rules.
    pub sanitizer: SanitizerConfig,
    /// File holding trusted script names. Defaults to `trust.json` in the
    /// config directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let script_dir = if crate::env::is_test_mode() {
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/stormhub-scripts")
        } else {
            dirs::home_dir()
                .map(|h| h.join("stormhub-scripts"))
                .unwrap_or_else(|| PathBuf::from("stormhub-scripts"))
        };

        Self {
            game_host: "storm.play.net".to_string(),
            game_port: 10024,
            listen: "127.0.0.1:8000".to_string(),
            secondary_listen: None,
            dialect: Dialect::Stormfront,
            secondary_dialect: Dialect::Plain,
            script_dir,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            poll_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            kill_join_timeout_ms: DEFAULT_KILL_JOIN_TIMEOUT.as_millis() as u64,
            move_timeout_ms: DEFAULT_MOVE_TIMEOUT.as_millis() as u64,
            mana_stat_bonus: 0,
            sanitizer: SanitizerConfig::default(),
            trust_file: None,
        }
    }
}

/// Expand a leading `~` in a configured path.
fn expand_home(path: &std::path::Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `STORMHUB_CONFIG_DIR` env var: explicit override
    /// 2. `STORMHUB_ENV=test`: `tmp/stormhub-test` under the crate
    /// 3. Default: platform config dir + `stormhub`
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("STORMHUB_CONFIG_DIR") {
            PathBuf::from(dir)
        } else if crate::env::is_test_mode() {
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/stormhub-test")
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("stormhub")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing file yields defaults; a malformed one is an error.
    pub fn load() -> Result<Self> {
        let path = Self::config_dir()?.join("config.json");
        let mut config = Self::load_from(&path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from an explicit path without env overrides.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("[Config] No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        config.script_dir = expand_home(&config.script_dir);
        config.trust_file = config.trust_file.as_deref().map(expand_home);
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("STORMHUB_GAME_HOST") {
            self.game_host = host;
        }

        if let Ok(port) = std::env::var("STORMHUB_GAME_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.game_port = port;
            }
        }

        if let Ok(listen) = std::env::var("STORMHUB_LISTEN") {
            self.listen = listen;
        }

        if let Ok(dir) = std::env::var("STORMHUB_SCRIPT_DIR") {
            self.script_dir = expand_home(std::path::Path::new(&dir));
        }

        if let Ok(capacity) = std::env::var("STORMHUB_MAILBOX_CAPACITY") {
            match capacity.parse::<usize>() {
                Ok(n) if n > 0 => self.mailbox_capacity = n,
                _ => log::warn!("[Config] Ignoring invalid STORMHUB_MAILBOX_CAPACITY={}", capacity),
            }
        }

        if let Ok(poll) = std::env::var("STORMHUB_POLL_MS") {
            if let Ok(ms) = poll.parse::<u64>() {
                self.poll_ms = ms.max(1);
            }
        }
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Path of the trust file.
    pub fn trust_path(&self) -> Result<PathBuf> {
        match &self.trust_file {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join("trust.json")),
        }
    }

    /// Poll interval as a duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }

    /// Kill join timeout as a duration.
    #[must_use]
    pub fn kill_join_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_join_timeout_ms)
    }

    /// Move deadline as a duration.
    #[must_use]
    pub fn move_timeout(&self) -> Duration {
        Duration::from_millis(self.move_timeout_ms)
    }

    /// `host:port` of the game server.
    #[must_use]
    pub fn game_addr(&self) -> String {
        format!("{}:{}", self.game_host, self.game_port)
    }
}
