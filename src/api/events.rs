use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::models::Message;

/// Receiving half of a background connection. Once the connection has been
/// told to stop, `recv` yields `None`, even for events already queued.
pub struct EventStream<T> {
    rx: mpsc::Receiver<T>,
    cancel: CancellationToken,
}

impl<T> EventStream<T> {
    pub(crate) fn new(rx: mpsc::Receiver<T>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    pub async fn recv(&mut self) -> Option<T> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }
}

/// What the STOMP transport hands to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(Message),
    /// Reason string, prefixed `transport error:` or `broker error:`.
    Error(String),
}

/// Pusher protocol envelope. `data` is usually a JSON document encoded as a
/// string on the server side, but subscribe requests carry an object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingEvent {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl IncomingEvent {
    /// Decode `data`, unwrapping the string-encoded form.
    pub fn payload(&self) -> serde_json::Value {
        match &self.data {
            serde_json::Value::String(raw) => {
                serde_json::from_str(raw).unwrap_or_else(|_| self.data.clone())
            }
            other => other.clone(),
        }
    }
}

/// What the notification client hands to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    Notification { channel: String, event: String, data: serde_json::Value },
    Error(String),
}
