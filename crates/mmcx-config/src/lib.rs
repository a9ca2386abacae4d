//! mmcx Configuration
//!
//! TOML configuration loading with validation

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_allowed_updates")]
    pub allowed_updates: Vec<String>,
    /// Window for inbound update_id dedup. 0 means "use `dedup_window`".
    #[serde(default)]
    pub update_dedup_window: usize,
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
    #[serde(default = "default_message_index_limit")]
    pub message_index_limit: usize,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProxyConfig {
    pub url: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    /// Honor HTTP_PROXY / HTTPS_PROXY from the environment.
    #[serde(default)]
    pub trust_env: bool,
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_poll_timeout() -> u64 {
    20
}

fn default_allowed_updates() -> Vec<String> {
    vec!["message".to_string()]
}

fn default_dedup_window() -> usize {
    512
}

fn default_message_index_limit() -> usize {
    20_000
}

impl TelegramConfig {
    /// Dedup window used for inbound updates: the dedicated size when set,
    /// the generic default otherwise.
    pub fn effective_dedup_window(&self) -> usize {
        if self.update_dedup_window > 0 {
            self.update_dedup_window
        } else {
            self.dedup_window
        }
    }
}

impl ProxyConfig {
    /// The proxy URL to use, or None when proxying is disabled or unset.
    pub fn active_url(&self) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("mmcx").join("config.toml"))
    }

    pub fn data_dir(&self) -> PathBuf {
        match self.core.data_dir.as_deref().map(str::trim) {
            Some(dir) if !dir.is_empty() => expand_home(dir),
            _ => dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("mmcx"),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            anyhow::bail!("telegram.bot_token cannot be empty");
        }
        if self.telegram.poll_timeout_secs == 0 {
            anyhow::bail!("telegram.poll_timeout_secs must be at least 1");
        }
        if self.telegram.effective_dedup_window() == 0 {
            anyhow::bail!("telegram.dedup_window and telegram.update_dedup_window cannot both be 0");
        }
        if self.telegram.message_index_limit == 0 {
            anyhow::bail!("telegram.message_index_limit must be at least 1");
        }
        if self.telegram.proxy.enabled && self.telegram.proxy.active_url().is_none() {
            anyhow::bail!("telegram.proxy.enabled is set but telegram.proxy.url is empty");
        }
        Ok(())
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
