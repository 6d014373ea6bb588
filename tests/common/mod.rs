#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{WebSocketStream, accept_async};
use url::Url;

use market_chat::api::{Conversation, Message, MessageApi};
use market_chat::stomp::frame::{self, Command, Frame};

pub async fn within<F: Future>(what: &str, fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

/// A WebSocket server that hands each accepted connection to the test.
pub struct MockServer {
    pub url: Url,
    connections: mpsc::UnboundedReceiver<ServerConn>,
}

impl MockServer {
    pub async fn start(path: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = accept_async(stream).await {
                    if tx.send(ServerConn { ws }).is_err() {
                        break;
                    }
                }
            }
        });
        let url = Url::parse(&format!("ws://{addr}{path}")).unwrap();
        Self { url, connections: rx }
    }

    pub async fn accept(&mut self) -> ServerConn {
        within("a client connection", self.connections.recv()).await.expect("server stopped")
    }
}

pub struct ServerConn {
    ws: WebSocketStream<TcpStream>,
}

impl ServerConn {
    /// Next text payload, heart-beats included. `None` once the client is gone.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.ws.next().await {
                Some(Ok(WsMessage::Text(text))) => return Some(text),
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    /// Next STOMP frame, skipping heart-beats.
    pub async fn recv_frame(&mut self) -> Frame {
        loop {
            let text = within("a frame", self.recv_text()).await.expect("client disconnected");
            if let Some(frame) = frame::decode(&text).unwrap().into_iter().next() {
                return frame;
            }
        }
    }

    pub async fn send_text(&mut self, text: String) -> bool {
        self.ws.send(WsMessage::Text(text)).await.is_ok()
    }

    pub async fn send_frame(&mut self, frame: Frame) -> bool {
        self.send_text(frame.encode()).await
    }

    /// Answer CONNECT with CONNECTED and return the CONNECT and SUBSCRIBE frames.
    pub async fn stomp_handshake(&mut self, heart_beat: &str) -> (Frame, Frame) {
        let connect = self.recv_frame().await;
        assert_eq!(connect.command, Command::Connect);
        let connected = Frame::new(Command::Connected).header("version", "1.2").header("heart-beat", heart_beat);
        self.send_frame(connected).await;
        let subscribe = self.recv_frame().await;
        assert_eq!(subscribe.command, Command::Subscribe);
        (connect, subscribe)
    }

    pub async fn deliver(&mut self, message: &Message) -> bool {
        let frame = Frame::new(Command::Message)
            .header("destination", "/topic/public")
            .header("subscription", "sub-0")
            .header("message-id", "1")
            .header("content-type", "application/json")
            .body(serde_json::to_string(message).unwrap());
        self.send_frame(frame).await
    }
}

/// Backend stand-in that serves stored history and accepts every send.
#[derive(Default)]
pub struct MemoryApi {
    pub history: Mutex<Vec<Message>>,
    pub sent: Mutex<Vec<Message>>,
}

impl MemoryApi {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl MessageApi for MemoryApi {
    async fn history(&self, current_user: &str, recipient: &str) -> market_chat::Result<Vec<Message>> {
        let conv = Conversation::new(current_user, recipient);
        Ok(self.history.lock().unwrap().iter().filter(|m| conv.includes(m)).cloned().collect())
    }

    async fn send(&self, message: &Message) -> market_chat::Result<()> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}
