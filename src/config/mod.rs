use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/global.toml";

/// Daemon settings read from `config/global.toml`.
/// Every field is optional in the file; missing keys fall back to defaults.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GlobalConfig {
    /// Directory holding one checkout per provisioned repository
    pub base_dir: PathBuf,
    /// Directory holding one `<key>.log` per bot
    pub logs_dir: PathBuf,
    /// Interpreter used both to run bots and to drive `pip`
    pub interpreter: String,
    pub git: String,
    /// Wait between the graceful and the forced termination request
    pub grace_period_ms: u64,
    /// Size of the window returned by a log tail
    pub log_tail_chars: usize,
    pub listen_addr: String,
    /// Seeds the active repository when no saved state exists yet
    pub repo_url: Option<String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("git_bots"),
            logs_dir: PathBuf::from("bot_logs"),
            interpreter: "python3".to_string(),
            git: "git".to_string(),
            grace_period_ms: 1000,
            log_tail_chars: 4000,
            listen_addr: "127.0.0.1:57480".to_string(),
            repo_url: None,
        }
    }
}

impl GlobalConfig {
    /// Load from `GITBOT_CONFIG` or `config/global.toml`.
    /// A missing file yields the defaults, a malformed one is an error.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("GITBOT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&s)
            .map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))?;
        Ok(cfg)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}
