use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use url::Url;

const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server_url: String,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig::stun(DEFAULT_STUN)]
}

fn default_health_interval_secs() -> u64 {
    10
}

fn default_open_timeout_secs() -> u64 {
    15
}

impl Config {
    /// Loads JSON, or YAML when the file extension says so.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let mut cfg: Config = if is_yaml {
            serde_yaml::from_str(&data).context("parse config yaml")?
        } else {
            serde_json::from_str(&data).context("parse config json")?
        };
        cfg.config_path = Some(path.to_path_buf());
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    /// CLI `--room` wins over the file.
    pub fn with_room(mut self, room: Option<String>) -> Result<Self> {
        if let Some(room) = room {
            self.room_id = Some(room);
            self.normalize();
            self.validate()?;
        }
        Ok(self)
    }

    fn normalize(&mut self) {
        self.server_url = self.server_url.trim().to_string();
        self.room_id = self
            .room_id
            .take()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        if let Some(level) = &self.log_level {
            let level = level.trim();
            self.log_level = (!level.is_empty()).then(|| level.to_string());
        }
        for server in &mut self.ice_servers {
            for url in &mut server.urls {
                *url = url.trim().to_string();
            }
        }
    }

    fn validate(&self) -> Result<()> {
        validate_ws_url(&self.server_url).context("server_url")?;
        if let Some(room) = &self.room_id {
            validate_room_id(room)?;
        }
        for server in &self.ice_servers {
            if server.urls.is_empty() {
                anyhow::bail!("ice server without urls");
            }
            for url in &server.urls {
                validate_ice_url(url)?;
            }
        }
        if self.health_interval_secs == 0 {
            anyhow::bail!("health_interval_secs must be > 0");
        }
        if self.open_timeout_secs == 0 {
            anyhow::bail!("open_timeout_secs must be > 0");
        }
        Ok(())
    }

    pub fn signaling_url(&self) -> Result<Url> {
        Ok(Url::parse(&self.server_url)?)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn log_path(&self) -> PathBuf {
        let dir = self
            .config_path
            .as_ref()
            .and_then(|p| p.parent())
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        dir.join("logs").join("voicecall.log")
    }
}

fn validate_ws_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        anyhow::bail!("url must be ws or wss");
    }
    Ok(())
}

fn validate_room_id(room: &str) -> Result<()> {
    static PATTERN: once_cell::sync::Lazy<Regex> =
        once_cell::sync::Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap());
    if PATTERN.is_match(room) {
        Ok(())
    } else {
        anyhow::bail!("invalid room id: {room}")
    }
}

fn validate_ice_url(url: &str) -> Result<()> {
    const SCHEMES: [&str; 4] = ["stun:", "stuns:", "turn:", "turns:"];
    if SCHEMES.iter().any(|s| url.starts_with(s)) {
        Ok(())
    } else {
        anyhow::bail!("invalid ice server url: {url}")
    }
}
