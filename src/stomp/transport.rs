//! STOMP-over-WebSocket connection to the backend broker.
//!
//! [`StompTransport::connect`] spawns a task that owns the socket. It keeps
//! reconnecting after a fixed delay until [`StompTransport::disconnect`] is
//! called. Inbound chat messages arrive on the [`TransportEvents`] queue.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::api::events::{EventStream, TransportEvent};
use crate::api::models::Message;
use crate::stomp::frame::{self, Command, Frame, HeartBeat};
use crate::{Error, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_QUEUE: usize = 256;
const OUTBOUND_QUEUE: usize = 64;
const SUBSCRIPTION_ID: &str = "sub-0";

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(10);

/// Which pair of destinations the deployed backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicScheme {
    /// Everyone subscribes to `/topic/public`, sends go to `/app/chat.sendMessage`.
    Broadcast,
    /// Each user subscribes to `/topic/messages.{userId}`, sends go to `/app/chat.send`.
    Targeted,
}

impl TopicScheme {
    pub fn subscribe_destination(&self, user_id: &str) -> String {
        match self {
            TopicScheme::Broadcast => "/topic/public".to_string(),
            TopicScheme::Targeted => format!("/topic/messages.{}", user_id),
        }
    }

    pub fn send_destination(&self) -> &'static str {
        match self {
            TopicScheme::Broadcast => "/app/chat.sendMessage",
            TopicScheme::Targeted => "/app/chat.send",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StompConfig {
    pub endpoint: Url,
    pub scheme: TopicScheme,
    pub user_id: String,
    pub reconnect_delay: Duration,
    pub heartbeat: Duration,
    /// Bound on the WebSocket handshake plus the STOMP CONNECT exchange.
    pub connect_timeout: Duration,
}

impl StompConfig {
    pub fn new(endpoint: Url, scheme: TopicScheme, user_id: impl Into<String>) -> Self {
        Self {
            endpoint,
            scheme,
            user_id: user_id.into(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            heartbeat: DEFAULT_HEARTBEAT,
            connect_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Erroring,
}

pub type TransportEvents = EventStream<TransportEvent>;

pub struct StompTransport {
    scheme: TopicScheme,
    outbound: mpsc::Sender<String>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl StompTransport {
    /// Start connecting in the background. Must be called inside a Tokio runtime.
    pub fn connect(config: StompConfig) -> (Self, TransportEvents) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();

        let scheme = config.scheme;
        let worker = Worker { config, events: event_tx, outbound: outbound_rx, state: state_tx, cancel: cancel.clone() };
        let task = tokio::spawn(worker.run());

        let transport = Self { scheme, outbound: outbound_tx, state: state_rx, cancel: cancel.clone(), task: Some(task) };
        (transport, EventStream::new(event_rx, cancel))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the connection reaches `target`. Fails if the transport task
    /// has gone away first.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| Error::Closed("transport"))
    }

    /// Publish to the backend. Returns `false` without sending when the
    /// connection is not up; nothing is retried.
    pub fn send_message(&self, message: &Message) -> bool {
        let state = self.state();
        if state != ConnectionState::Connected {
            warn!("dropping outgoing message: transport is {:?}", state);
            return false;
        }
        let body = match serde_json::to_string(message) {
            Ok(body) => body,
            Err(e) => {
                error!("cannot encode outgoing message: {}", e);
                return false;
            }
        };
        let frame = Frame::new(Command::Send)
            .header("destination", self.scheme.send_destination())
            .header("content-type", "application/json")
            .body(body);
        match self.outbound.try_send(frame.encode()) {
            Ok(()) => true,
            Err(e) => {
                warn!("dropping outgoing message: {}", e);
                false
            }
        }
    }

    /// Stop the connection and wait for the socket task to finish. Safe to
    /// call more than once.
    pub async fn disconnect(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("transport task failed: {}", e);
            }
        }
    }
}

impl Drop for StompTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// How one connection attempt ended.
enum Outcome {
    /// Asked to stop; do not reconnect.
    Shutdown,
    Lost(String),
}

struct Worker {
    config: StompConfig,
    events: mpsc::Sender<TransportEvent>,
    outbound: mpsc::Receiver<String>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        loop {
            self.state.send_replace(ConnectionState::Connecting);
            match self.session().await {
                Outcome::Shutdown => break,
                Outcome::Lost(reason) => {
                    warn!("{}; reconnecting in {:?}", reason, self.config.reconnect_delay);
                    self.state.send_replace(ConnectionState::Erroring);
                    self.discard_outbound();
                    if !self.emit(TransportEvent::Error(reason)).await {
                        break;
                    }
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
        self.state.send_replace(ConnectionState::Disconnected);
        debug!("transport task for {} stopped", self.config.endpoint);
    }

    /// Drop frames accepted for a connection that is gone. They are never
    /// replayed on the next one.
    fn discard_outbound(&mut self) {
        let mut dropped = 0;
        while self.outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!("dropped {} unsent frame(s) with the lost connection", dropped);
        }
    }

    /// Queue an event for the consumer. `false` once shut down.
    async fn emit(&self, event: TransportEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }

    async fn open(&self) -> std::result::Result<(Socket, Option<Duration>, Option<Duration>), String> {
        let (mut ws, _) = connect_async(self.config.endpoint.as_str())
            .await
            .map_err(|e| format!("transport error: {}", e))?;

        let offered = HeartBeat::symmetric(self.config.heartbeat);
        let host = self.config.endpoint.host_str().unwrap_or("localhost").to_string();
        let connect = Frame::new(Command::Connect)
            .header("accept-version", "1.2,1.1")
            .header("host", host)
            .header("heart-beat", offered.header_value());
        ws.send(WsMessage::Text(connect.encode()))
            .await
            .map_err(|e| format!("transport error: {}", e))?;

        let connected = loop {
            let msg = match ws.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(format!("transport error: {}", e)),
                None => return Err("transport error: closed during handshake".into()),
            };
            let Some(text) = text_payload(msg) else { continue };
            let frames = frame::decode(&text).map_err(|e| format!("transport error: {}", e))?;
            if let Some(f) = frames.into_iter().next() {
                match f.command {
                    Command::Connected => break f,
                    Command::Error => return Err(broker_error(&f)),
                    other => return Err(format!("transport error: unexpected {} before CONNECTED", other)),
                }
            }
        };

        let server = match connected.get("heart-beat") {
            Some(v) => HeartBeat::parse(v).map_err(|e| format!("transport error: {}", e))?,
            None => HeartBeat::default(),
        };
        let (send_every, expect_every) = frame::negotiate(offered, server);

        let subscribe = Frame::new(Command::Subscribe)
            .header("id", SUBSCRIPTION_ID)
            .header("destination", self.config.scheme.subscribe_destination(&self.config.user_id))
            .header("ack", "auto");
        ws.send(WsMessage::Text(subscribe.encode()))
            .await
            .map_err(|e| format!("transport error: {}", e))?;

        Ok((ws, send_every, expect_every))
    }

    async fn session(&mut self) -> Outcome {
        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return Outcome::Shutdown,
            opened = tokio::time::timeout(self.config.connect_timeout, self.open()) => opened,
        };
        let (mut ws, send_every, expect_every) = match opened {
            Ok(Ok(parts)) => parts,
            Ok(Err(reason)) => return Outcome::Lost(reason),
            Err(_) => return Outcome::Lost("transport error: connect timed out".into()),
        };

        info!("connected to {}", self.config.endpoint);
        // Anything queued while not connected belongs to an earlier session.
        self.discard_outbound();
        self.state.send_replace(ConnectionState::Connected);

        let mut beat = send_every.map(|every| {
            let mut interval = tokio::time::interval_at(Instant::now() + every, every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        // Allow the broker half an interval of slack before declaring it gone.
        let silence_limit = expect_every.map(|every| every + every / 2);
        let mut last_inbound = Instant::now();

        loop {
            let deadline = silence_limit.map(|limit| last_inbound + limit);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let bye = Frame::new(Command::Disconnect).encode();
                    let _ = ws.send(WsMessage::Text(bye)).await;
                    let _ = ws.close(None).await;
                    return Outcome::Shutdown;
                }
                outgoing = self.outbound.recv() => {
                    let Some(text) = outgoing else {
                        let _ = ws.close(None).await;
                        return Outcome::Shutdown;
                    };
                    if let Err(e) = ws.send(WsMessage::Text(text)).await {
                        return Outcome::Lost(format!("transport error: {}", e));
                    }
                }
                _ = tick(&mut beat) => {
                    if let Err(e) = ws.send(WsMessage::Text("\n".into())).await {
                        return Outcome::Lost(format!("transport error: {}", e));
                    }
                }
                _ = expire(deadline) => {
                    let _ = ws.close(None).await;
                    return Outcome::Lost("transport error: heart-beat timeout".into());
                }
                incoming = ws.next() => {
                    let msg = match incoming {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => return Outcome::Lost(format!("transport error: {}", e)),
                        None => return Outcome::Lost("transport error: connection closed".into()),
                    };
                    last_inbound = Instant::now();
                    if let WsMessage::Close(_) = msg {
                        return Outcome::Lost("transport error: connection closed by broker".into());
                    }
                    let Some(text) = text_payload(msg) else { continue };
                    if let Some(outcome) = self.dispatch(&text).await {
                        return outcome;
                    }
                }
            }
        }
    }

    /// Route decoded frames. Returns an outcome when the session must end.
    async fn dispatch(&self, text: &str) -> Option<Outcome> {
        let frames = match frame::decode(text) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("ignoring undecodable payload: {}", e);
                return None;
            }
        };
        for f in frames {
            match f.command {
                Command::Message => match serde_json::from_str::<Message>(&f.body) {
                    Ok(message) => {
                        if !self.emit(TransportEvent::Message(message)).await {
                            return Some(Outcome::Shutdown);
                        }
                    }
                    Err(e) => warn!("skipping MESSAGE with unexpected body: {}", e),
                },
                Command::Error => return Some(Outcome::Lost(broker_error(&f))),
                other => debug!("ignoring {} frame", other),
            }
        }
        None
    }
}

fn text_payload(msg: WsMessage) -> Option<String> {
    match msg {
        WsMessage::Text(text) => Some(text),
        WsMessage::Binary(bytes) => String::from_utf8(bytes).ok(),
        _ => None,
    }
}

fn broker_error(f: &Frame) -> String {
    let summary = f.get("message").unwrap_or("unspecified");
    if f.body.is_empty() {
        format!("broker error: {}", summary)
    } else {
        format!("broker error: {} ({})", summary, f.body.trim())
    }
}

async fn tick(beat: &mut Option<Interval>) {
    match beat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
