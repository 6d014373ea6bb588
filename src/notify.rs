//! Out-of-band notifications over a hosted Pusher-protocol service.
//!
//! The client is bound to the signed-in user. Private channels are signed by
//! the marketplace backend before subscribing.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::api::client::ApiClient;
use crate::api::events::{EventStream, IncomingEvent, NotificationEvent};
use crate::channel::{channel_name, user_channel_name};
use crate::{Error, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PROTOCOL_VERSION: u8 = 7;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const EVENT_QUEUE: usize = 256;

pub type NotificationEvents = EventStream<NotificationEvent>;

/// Resolves who is signed in. Session handling itself lives elsewhere.
pub trait SessionProvider: Send + Sync {
    fn current_email(&self) -> Option<String>;
}

/// A session fixed at startup, e.g. from the command line.
pub struct StaticSession(pub Option<String>);

impl SessionProvider for StaticSession {
    fn current_email(&self) -> Option<String> {
        self.0.clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationSettings {
    pub app_key: Option<String>,
    pub cluster: Option<String>,
    /// Socket host override for self-hosted Pusher-compatible servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

pub struct NotificationClient {
    email: String,
    socket_url: Url,
    api: ApiClient,
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Config(format!("notifications.{} is not set", name)))
}

impl NotificationClient {
    /// Fails unless a user is signed in and the service is configured.
    pub fn new(
        session: &dyn SessionProvider,
        settings: Option<&NotificationSettings>,
        api: ApiClient,
    ) -> Result<Self> {
        let email = session
            .current_email()
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| Error::Auth("no signed-in user for notifications".into()))?;
        let settings = settings.ok_or_else(|| Error::Config("notification settings missing".into()))?;
        let key = required(&settings.app_key, "app_key")?;
        let cluster = required(&settings.cluster, "cluster")?;

        let mut socket_url = match &settings.endpoint {
            Some(endpoint) => Url::parse(endpoint)?,
            None => Url::parse(&format!("wss://ws-{}.pusher.com", cluster))?,
        };
        socket_url
            .path_segments_mut()
            .map_err(|_| Error::Config("notification endpoint cannot be a base URL".into()))?
            .pop_if_empty()
            .extend(["app", key]);
        socket_url
            .query_pairs_mut()
            .append_pair("protocol", &PROTOCOL_VERSION.to_string())
            .append_pair("client", env!("CARGO_PKG_NAME"))
            .append_pair("version", env!("CARGO_PKG_VERSION"));

        Ok(Self { email, socket_url, api })
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn socket_url(&self) -> &Url {
        &self.socket_url
    }

    /// Open the socket and wait for the service to assign a socket id.
    pub async fn connect(self) -> Result<(NotificationHandle, NotificationEvents)> {
        let (ws, socket_id) = tokio::time::timeout(CONNECT_TIMEOUT, handshake(&self.socket_url))
            .await
            .map_err(|_| Error::Timeout("notification handshake"))??;
        info!("notification socket {} established for {}", socket_id, self.email);

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let (command_tx, command_rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let worker = Worker { ws, commands: command_rx, events: event_tx, cancel: cancel.clone() };
        let task = tokio::spawn(worker.run());

        let handle = NotificationHandle {
            socket_id,
            email: self.email,
            api: self.api,
            commands: command_tx,
            cancel: cancel.clone(),
            task: Some(task),
        };
        Ok((handle, EventStream::new(event_rx, cancel)))
    }
}

async fn handshake(url: &Url) -> Result<(Socket, String)> {
    let (mut ws, _) = connect_async(url.as_str()).await?;
    loop {
        let text = match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(Error::Closed("notification")),
        };
        let event: IncomingEvent = serde_json::from_str(&text)?;
        match event.event.as_str() {
            "pusher:connection_established" => {
                let socket_id = event.payload()["socket_id"]
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::Auth("connection established without socket id".into()))?;
                return Ok((ws, socket_id));
            }
            "pusher:error" => {
                return Err(Error::Auth(format!("service refused connection: {}", event.payload())));
            }
            other => debug!("ignoring {} before connection was established", other),
        }
    }
}

pub struct NotificationHandle {
    socket_id: String,
    email: String,
    api: ApiClient,
    commands: mpsc::Sender<String>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl NotificationHandle {
    pub fn socket_id(&self) -> &str {
        &self.socket_id
    }

    pub async fn subscribe(&self, channel: &str) -> Result<()> {
        let mut data = json!({ "channel": channel });
        if channel.starts_with("private-") {
            let auth = self.api.authorize_channel(&self.socket_id, channel, &self.email).await?;
            data["auth"] = Value::String(auth);
        }
        self.send_event("pusher:subscribe", None, data).await
    }

    /// Subscribe to the signed-in user's own channel.
    pub async fn subscribe_user(&self) -> Result<String> {
        let channel = user_channel_name(&self.email);
        self.subscribe(&channel).await?;
        Ok(channel)
    }

    pub async fn subscribe_conversation(&self, other: &str) -> Result<String> {
        let channel = channel_name(&self.email, other);
        self.subscribe(&channel).await?;
        Ok(channel)
    }

    /// Trigger a client event. Pusher only relays events named `client-*`.
    pub async fn publish(&self, channel: &str, event: &str, data: Value) -> Result<()> {
        if !event.starts_with("client-") {
            return Err(Error::Config(format!("client event {:?} must start with \"client-\"", event)));
        }
        self.send_event(event, Some(channel), data).await
    }

    async fn send_event(&self, event: &str, channel: Option<&str>, data: Value) -> Result<()> {
        let frame = IncomingEvent { event: event.to_string(), channel: channel.map(str::to_string), data };
        let text = serde_json::to_string(&frame)?;
        self.commands.send(text).await.map_err(|_| Error::Closed("notification"))
    }

    /// Close the socket; no event is delivered after this returns.
    pub async fn disconnect(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("notification task failed: {}", e);
            }
        }
    }
}

impl Drop for NotificationHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, PartialEq)]
enum Reaction {
    Reply(String),
    Deliver(NotificationEvent),
    Ignore,
}

fn interpret(text: &str) -> Reaction {
    let event: IncomingEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            warn!("ignoring malformed notification frame: {}", e);
            return Reaction::Ignore;
        }
    };
    match event.event.as_str() {
        "pusher:ping" => Reaction::Reply(json!({ "event": "pusher:pong", "data": {} }).to_string()),
        "pusher:error" => {
            let payload = event.payload();
            let reason = payload["message"].as_str().map(str::to_string).unwrap_or_else(|| payload.to_string());
            Reaction::Deliver(NotificationEvent::Error(format!("broker error: {}", reason)))
        }
        "pusher_internal:subscription_succeeded" => {
            debug!("subscribed to {}", event.channel.as_deref().unwrap_or("?"));
            Reaction::Ignore
        }
        name if name.starts_with("pusher:") || name.starts_with("pusher_internal:") => Reaction::Ignore,
        _ => Reaction::Deliver(NotificationEvent::Notification {
            data: event.payload(),
            channel: event.channel.unwrap_or_default(),
            event: event.event,
        }),
    }
}

struct Worker {
    ws: Socket,
    commands: mpsc::Receiver<String>,
    events: mpsc::Sender<NotificationEvent>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = self.ws.close(None).await;
                    break;
                }
                command = self.commands.recv() => {
                    let Some(text) = command else { break };
                    if let Err(e) = self.ws.send(WsMessage::Text(text)).await {
                        self.emit(NotificationEvent::Error(format!("transport error: {}", e))).await;
                        break;
                    }
                }
                incoming = self.ws.next() => {
                    let text = match incoming {
                        Some(Ok(WsMessage::Text(text))) => text,
                        Some(Ok(WsMessage::Close(_))) | None => {
                            self.emit(NotificationEvent::Error("transport error: connection closed".into())).await;
                            break;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            self.emit(NotificationEvent::Error(format!("transport error: {}", e))).await;
                            break;
                        }
                    };
                    match interpret(&text) {
                        Reaction::Reply(reply) => {
                            if let Err(e) = self.ws.send(WsMessage::Text(reply)).await {
                                self.emit(NotificationEvent::Error(format!("transport error: {}", e))).await;
                                break;
                            }
                        }
                        Reaction::Deliver(event) => {
                            if !self.emit(event).await {
                                break;
                            }
                        }
                        Reaction::Ignore => {}
                    }
                }
            }
        }
        debug!("notification task stopped");
    }

    async fn emit(&self, event: NotificationEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }
}
