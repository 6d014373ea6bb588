use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::Client as HttpClient;
use serde_json::Value;
use url::Url;

use crate::api::models::Message;
use crate::utils::normalize_url;
use crate::{Error, Result};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// The two backend calls the chat state depends on.
#[async_trait]
pub trait MessageApi: Send + Sync {
    /// Full history between two users, oldest first.
    async fn history(&self, current_user: &str, recipient: &str) -> Result<Vec<Message>>;

    /// Hand a message to the backend. Any 2xx counts as accepted.
    async fn send(&self, message: &Message) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: HttpClient,
    base: Url,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = HttpClient::builder().timeout(timeout).build()?;
        let base = Url::parse(&normalize_url(base_url))?;
        Ok(Self { http, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("{} cannot be used as a base URL", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Ask the backend to sign a private channel subscription for the
    /// notification service. Returns the `auth` token to pass on subscribe.
    pub async fn authorize_channel(&self, socket_id: &str, channel: &str, email: &str) -> Result<String> {
        let endpoint = self.endpoint(&["api", "chat", "auth"])?;
        let params = [("socket_id", socket_id), ("channel_name", channel), ("email", email)];
        let resp = self.http.post(endpoint).form(&params).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Auth(format!("HTTP {} for {}", resp.status(), channel)));
        }
        let json: Value = resp.json().await?;
        json.get("auth")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::Auth("auth signature not found in response".into()))
    }
}

#[async_trait]
impl MessageApi for ApiClient {
    async fn history(&self, current_user: &str, recipient: &str) -> Result<Vec<Message>> {
        let endpoint = self.endpoint(&["messages", current_user, recipient])?;
        debug!("fetching history from {}", endpoint);
        let resp = self.http.get(endpoint).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Status(resp.status()));
        }
        // Some deployments wrap the list in an envelope. Any other shape is
        // rejected by the decode below.
        let json: Value = resp.json().await?;
        let items = match json {
            Value::Object(mut map) => match map.remove("data").or_else(|| map.remove("messages")) {
                Some(items) => items,
                None => Value::Object(map),
            },
            other => other,
        };
        Ok(serde_json::from_value(items)?)
    }

    async fn send(&self, message: &Message) -> Result<()> {
        let endpoint = self.endpoint(&["chat"])?;
        let resp = self.http.post(endpoint).json(message).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Status(resp.status()));
        }
        Ok(())
    }
}
