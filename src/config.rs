use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::api::client::ApiClient;
use crate::notify::NotificationSettings;
use crate::stomp::transport::{StompConfig, TopicScheme};
use crate::utils::websocket_url;
use crate::{Error, Result};

const CONFIG_FILE: &str = "market-chat.toml";
const STOMP_PATH: &str = "ws-chat";

fn default_backend_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_heartbeat_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    /// Signed-in user; usually an email address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Deployments differ in their STOMP destinations, so this has to be
    /// chosen explicitly before live chat works.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_scheme: Option<TopicScheme>,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<NotificationSettings>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            user_id: None,
            topic_scheme: None,
            reconnect_delay_ms: default_reconnect_delay_ms(),
            heartbeat_ms: default_heartbeat_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            notifications: None,
        }
    }
}

impl AppConfig {
    pub fn default_path() -> Option<PathBuf> {
        let base = BaseDirs::new()?;
        Some(base.config_dir().join(CONFIG_FILE))
    }

    /// Load from the default location, falling back to defaults when no
    /// file exists yet.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn api_client(&self) -> Result<ApiClient> {
        ApiClient::with_timeout(&self.backend_url, self.request_timeout())
    }

    pub fn stomp_config(&self, user_id: &str) -> Result<StompConfig> {
        let scheme = self.topic_scheme.ok_or_else(|| {
            Error::Config("topic_scheme must be set to \"broadcast\" or \"targeted\" to match the backend".into())
        })?;
        let api = self.api_client()?;
        let endpoint = websocket_url(api.base_url(), STOMP_PATH)?;
        let mut config = StompConfig::new(endpoint, scheme, user_id);
        config.reconnect_delay = Duration::from_millis(self.reconnect_delay_ms);
        config.heartbeat = Duration::from_millis(self.heartbeat_ms);
        config.connect_timeout = self.request_timeout();
        Ok(config)
    }
}
