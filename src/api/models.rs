use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Backend-assigned message id. Numeric on the current backend, but older
/// deployments hand out opaque strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(i64),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Received,
    Delivered,
    Read,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
}

impl Message {
    /// A message composed locally: no id yet, client-side timestamp.
    pub fn outgoing(sender_id: &str, recipient_id: &str, content: &str) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            recipient_id: recipient_id.to_string(),
            content: content.to_string(),
            id: None,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            status: None,
        }
    }
}

/// The unordered pair of participants a chat is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub current_user: String,
    pub recipient: String,
}

impl Conversation {
    pub fn new(current_user: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self { current_user: current_user.into(), recipient: recipient.into() }
    }

    pub fn includes(&self, message: &Message) -> bool {
        (message.sender_id == self.current_user && message.recipient_id == self.recipient)
            || (message.sender_id == self.recipient && message.recipient_id == self.current_user)
    }

    pub fn channel_name(&self) -> String {
        crate::channel::channel_name(&self.current_user, &self.recipient)
    }
}
