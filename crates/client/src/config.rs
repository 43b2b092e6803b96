use anyhow::Context;
use folkhart_engine::{DriverConfig, ReconcilePolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_API_URL: &str = "FOLKHART_API_URL";
pub const ENV_TOKEN: &str = "FOLKHART_TOKEN";
pub const ENV_DB: &str = "FOLKHART_DB";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub db_path: PathBuf,
    pub poll_interval_secs: u64,
    pub tick_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub version_check_timeout_ms: u64,
    /// How long a fresh run is kept when the server does not report it yet.
    pub server_loss_grace_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000/api".to_string(),
            auth_token: None,
            db_path: home_dir().join("client.db"),
            poll_interval_secs: 15,
            tick_interval_ms: 1000,
            request_timeout_ms: 10_000,
            version_check_timeout_ms: 3_000,
            server_loss_grace_secs: 0,
        }
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".folkhart")
}

pub fn default_config_path() -> PathBuf {
    home_dir().join("config.yaml")
}

impl ClientConfig {
    /// Reads `path`, or the default location when it exists, then applies
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = default_config_path();
                if default.exists() {
                    Self::from_file(&default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("parse config: {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            self.base_url = url;
        }
        if let Some(token) = lookup(ENV_TOKEN).filter(|v| !v.trim().is_empty()) {
            self.auth_token = Some(token);
        }
        if let Some(db) = lookup(ENV_DB).filter(|v| !v.trim().is_empty()) {
            self.db_path = PathBuf::from(db);
        }
    }

    pub fn driver(&self) -> DriverConfig {
        DriverConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms.max(100)),
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
        }
    }

    pub fn policy(&self) -> ReconcilePolicy {
        ReconcilePolicy {
            server_loss_grace_ms: i64::try_from(self.server_loss_grace_secs.saturating_mul(1000))
                .unwrap_or(i64::MAX),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn version_check_timeout(&self) -> Duration {
        Duration::from_millis(self.version_check_timeout_ms)
    }
}
