//! Per-conversation chat state.
//!
//! [`ChatState`] holds the ordered messages of one conversation, loads
//! history, and applies sends optimistically. Each optimistic entry carries
//! a local token, so a failed send removes exactly its own entry no matter
//! what was appended after it. [`ChatSession`] ties a state to a live STOMP
//! transport.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::api::client::{DEFAULT_REQUEST_TIMEOUT, MessageApi};
use crate::api::events::TransportEvent;
use crate::api::models::{Conversation, Message};
use crate::stomp::transport::{ConnectionState, StompConfig, StompTransport, TransportEvents};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Loading,
    Ready,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LocalToken(u64);

struct Entry {
    token: Option<LocalToken>,
    /// Still waiting on the backend; survives a history reload.
    pending: bool,
    message: Message,
}

impl Entry {
    fn confirmed(message: Message) -> Self {
        Self { token: None, pending: false, message }
    }
}

struct Inner {
    conversation: Option<Conversation>,
    phase: Phase,
    generation: u64,
    entries: Vec<Entry>,
    error: Option<String>,
    next_token: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatSnapshot {
    pub messages: Vec<Message>,
    pub loading: bool,
    pub error: Option<String>,
    pub phase: Phase,
}

#[derive(Clone)]
pub struct ChatState {
    inner: Arc<Mutex<Inner>>,
    api: Arc<dyn MessageApi>,
    request_timeout: Duration,
}

impl ChatState {
    pub fn new(api: Arc<dyn MessageApi>) -> Self {
        Self::with_timeout(api, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(api: Arc<dyn MessageApi>, request_timeout: Duration) -> Self {
        let inner = Inner {
            conversation: None,
            phase: Phase::Idle,
            generation: 0,
            entries: Vec::new(),
            error: None,
            next_token: 0,
        };
        Self { inner: Arc::new(Mutex::new(inner)), api, request_timeout }
    }

    pub async fn snapshot(&self) -> ChatSnapshot {
        let inner = self.inner.lock().await;
        ChatSnapshot {
            messages: inner.entries.iter().map(|e| e.message.clone()).collect(),
            loading: inner.phase == Phase::Loading,
            error: inner.error.clone(),
            phase: inner.phase,
        }
    }

    pub async fn conversation(&self) -> Option<Conversation> {
        self.inner.lock().await.conversation.clone()
    }

    /// Point the state at a conversation and load its history. Without a
    /// recipient the state goes idle and nothing is fetched.
    pub async fn activate(&self, current_user: &str, recipient: Option<&str>) -> Phase {
        match self.begin(current_user, recipient).await {
            Some((generation, conversation)) => self.load(generation, conversation).await,
            None => Phase::Idle,
        }
    }

    async fn begin(&self, current_user: &str, recipient: Option<&str>) -> Option<(u64, Conversation)> {
        let mut inner = self.inner.lock().await;
        inner.generation += 1;
        inner.error = None;

        let Some(recipient) = recipient.filter(|r| !r.is_empty()) else {
            inner.conversation = None;
            inner.entries.clear();
            inner.phase = Phase::Idle;
            return None;
        };

        let conversation = Conversation::new(current_user, recipient);
        if inner.conversation.as_ref() != Some(&conversation) {
            inner.entries.clear();
        }
        inner.conversation = Some(conversation.clone());
        inner.phase = Phase::Loading;
        Some((inner.generation, conversation))
    }

    async fn load(&self, generation: u64, conversation: Conversation) -> Phase {
        let fetched = self
            .bounded("message history", self.api.history(&conversation.current_user, &conversation.recipient))
            .await;

        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            debug!("discarding stale history for {}", conversation.channel_name());
            return inner.phase;
        }
        match fetched {
            Ok(history) => {
                let pending = std::mem::take(&mut inner.entries).into_iter().filter(|e| e.pending);
                let mut entries: Vec<Entry> = history.into_iter().map(Entry::confirmed).collect();
                entries.extend(pending);
                inner.entries = entries;
                inner.phase = Phase::Ready;
            }
            Err(e) => {
                warn!("history fetch for {} failed: {}", conversation.channel_name(), e);
                inner.error = Some(format!("Failed to load messages: {}", e));
                inner.phase = Phase::Errored;
            }
        }
        inner.phase
    }

    /// Append `content` right away, then hand it to the backend. On failure
    /// the entry appended by this call is removed and the error recorded.
    pub async fn send_message(&self, content: &str) -> Result<()> {
        let (token, generation, message) = {
            let mut inner = self.inner.lock().await;
            let Some(conversation) = inner.conversation.clone() else {
                inner.error = Some("Cannot send: no conversation selected".into());
                return Err(Error::NotActive);
            };
            let message = Message::outgoing(&conversation.current_user, &conversation.recipient, content);
            let token = LocalToken(inner.next_token);
            inner.next_token += 1;
            inner.entries.push(Entry { token: Some(token), pending: true, message: message.clone() });
            (token, inner.generation, message)
        };

        let sent = self.bounded("message send", self.api.send(&message)).await;

        let mut inner = self.inner.lock().await;
        let position = inner.entries.iter().position(|e| e.token == Some(token));
        match sent {
            Ok(()) => {
                if let Some(i) = position {
                    inner.entries[i].pending = false;
                }
                Ok(())
            }
            Err(e) => {
                if let Some(i) = position {
                    inner.entries.remove(i);
                }
                if inner.generation == generation {
                    inner.error = Some(format!("Failed to send message: {}", e));
                }
                warn!("send to {} failed: {}", message.recipient_id, e);
                Err(e)
            }
        }
    }

    /// Append a message pushed by the broker. Messages for other
    /// conversations, and echoes of our own sends, are ignored.
    pub async fn apply_inbound(&self, message: Message) -> bool {
        let mut inner = self.inner.lock().await;
        let accept = match &inner.conversation {
            Some(conversation) => {
                conversation.includes(&message) && message.sender_id != conversation.current_user
            }
            None => false,
        };
        if accept {
            inner.entries.push(Entry::confirmed(message));
        }
        accept
    }

    async fn bounded<T>(&self, what: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.request_timeout, fut).await.map_err(|_| Error::Timeout(what))?
    }
}

struct Live {
    transport: StompTransport,
    pump: JoinHandle<()>,
}

/// A chat state plus the live connection feeding it.
pub struct ChatSession {
    state: ChatState,
    stomp: Option<StompConfig>,
    live: Option<Live>,
}

impl ChatSession {
    /// `stomp` is a template; its `user_id` is replaced on each activation.
    /// Without it the session only works over HTTP.
    pub fn new(state: ChatState, stomp: Option<StompConfig>) -> Self {
        Self { state, stomp, live: None }
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.live.as_ref().map_or(ConnectionState::Disconnected, |l| l.transport.state())
    }

    pub async fn wait_for_connection(&self) -> Result<()> {
        match &self.live {
            Some(live) => live.transport.wait_for_state(ConnectionState::Connected).await,
            None => Err(Error::NotActive),
        }
    }

    /// Tear down the previous conversation, then open the new one.
    pub async fn activate(&mut self, current_user: &str, recipient: Option<&str>) -> Phase {
        self.deactivate().await;
        let Some((generation, conversation)) = self.state.begin(current_user, recipient).await else {
            return Phase::Idle;
        };
        if let Some(template) = &self.stomp {
            let mut config = template.clone();
            config.user_id = current_user.to_string();
            let (transport, events) = StompTransport::connect(config);
            let pump = tokio::spawn(pump(self.state.clone(), events));
            self.live = Some(Live { transport, pump });
        }
        self.state.load(generation, conversation).await
    }

    pub async fn send_message(&self, content: &str) -> Result<()> {
        self.state.send_message(content).await
    }

    /// Disconnect and wait for the pump; nothing is applied after this returns.
    pub async fn deactivate(&mut self) {
        if let Some(mut live) = self.live.take() {
            live.transport.disconnect().await;
            if let Err(e) = live.pump.await {
                warn!("chat pump ended abnormally: {}", e);
            }
            info!("chat connection closed");
        }
    }
}

async fn pump(state: ChatState, mut events: TransportEvents) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(message) => {
                if !state.apply_inbound(message).await {
                    debug!("inbound message not for this conversation");
                }
            }
            TransportEvent::Error(reason) => warn!("chat transport: {}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use reqwest::StatusCode;

    use super::*;

    /// Recipient `down` fails history, `slow` delays it. Content containing
    /// `fail` fails the send, content starting with `slow` delays it.
    #[derive(Default)]
    struct FakeApi {
        history: StdMutex<Vec<Message>>,
        sent: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageApi for FakeApi {
        async fn history(&self, current_user: &str, recipient: &str) -> Result<Vec<Message>> {
            match recipient {
                "down" => return Err(Error::Status(StatusCode::BAD_GATEWAY)),
                "slow" => tokio::time::sleep(Duration::from_millis(200)).await,
                _ => {}
            }
            let conv = Conversation::new(current_user, recipient);
            let all = self.history.lock().unwrap();
            Ok(all.iter().filter(|m| conv.includes(m)).cloned().collect())
        }

        async fn send(&self, message: &Message) -> Result<()> {
            if message.content.starts_with("slow") {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            if message.content.contains("fail") {
                return Err(Error::Status(StatusCode::INTERNAL_SERVER_ERROR));
            }
            self.sent.lock().unwrap().push(message.content.clone());
            Ok(())
        }
    }

    fn state_with(history: Vec<Message>) -> (ChatState, Arc<FakeApi>) {
        let api = Arc::new(FakeApi { history: StdMutex::new(history), ..Default::default() });
        (ChatState::new(api.clone()), api)
    }

    fn contents(snapshot: &ChatSnapshot) -> Vec<&str> {
        snapshot.messages.iter().map(|m| m.content.as_str()).collect()
    }

    #[tokio::test]
    async fn stays_idle_without_recipient() {
        let (state, _) = state_with(vec![]);
        assert_eq!(state.activate("a", None).await, Phase::Idle);
        assert_eq!(state.activate("a", Some("")).await, Phase::Idle);
        let snap = state.snapshot().await;
        assert!(!snap.loading);
        assert!(snap.messages.is_empty());
    }

    #[tokio::test]
    async fn loads_history_for_pair() {
        let (state, _) = state_with(vec![
            Message::outgoing("a", "b", "one"),
            Message::outgoing("c", "a", "elsewhere"),
            Message::outgoing("b", "a", "two"),
        ]);
        assert_eq!(state.activate("a", Some("b")).await, Phase::Ready);
        assert_eq!(contents(&state.snapshot().await), ["one", "two"]);
    }

    #[tokio::test]
    async fn empty_history_moves_from_loading_to_ready() {
        let (state, _) = state_with(vec![]);
        let loader = state.clone();
        let task = tokio::spawn(async move { loader.activate("a", Some("slow")).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(state.snapshot().await.loading);

        assert_eq!(task.await.unwrap(), Phase::Ready);
        let snap = state.snapshot().await;
        assert!(!snap.loading);
        assert!(snap.error.is_none());
        assert!(snap.messages.is_empty());
    }

    #[tokio::test]
    async fn failed_history_records_error() {
        let (state, _) = state_with(vec![]);
        assert_eq!(state.activate("a", Some("down")).await, Phase::Errored);
        let snap = state.snapshot().await;
        assert!(!snap.loading);
        assert!(snap.error.unwrap().contains("502"));
    }

    #[tokio::test]
    async fn retrying_same_pair_keeps_messages_on_error() {
        let (state, api) = state_with(vec![]);
        // Seed the conversation by hand, then retry a fetch that fails.
        state.begin("a", Some("down")).await;
        state.inner.lock().await.entries.push(Entry::confirmed(Message::outgoing("a", "down", "kept")));
        assert_eq!(state.activate("a", Some("down")).await, Phase::Errored);
        assert_eq!(contents(&state.snapshot().await), ["kept"]);
        assert!(api.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_history_is_discarded() {
        let (state, _) = state_with(vec![Message::outgoing("b", "a", "from b")]);
        let loader = state.clone();
        let slow = tokio::spawn(async move { loader.activate("a", Some("slow")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(state.activate("a", Some("b")).await, Phase::Ready);
        slow.await.unwrap();

        assert_eq!(state.conversation().await, Some(Conversation::new("a", "b")));
        assert_eq!(contents(&state.snapshot().await), ["from b"]);
    }

    #[tokio::test]
    async fn successful_send_keeps_optimistic_entry() {
        let (state, api) = state_with(vec![Message::outgoing("b", "a", "earlier")]);
        state.activate("a", Some("b")).await;

        state.send_message("hello").await.unwrap();
        let snap = state.snapshot().await;
        assert_eq!(contents(&snap), ["earlier", "hello"]);
        assert_eq!(snap.messages[1].sender_id, "a");
        assert!(snap.messages[1].id.is_none());
        assert_eq!(*api.sent.lock().unwrap(), ["hello"]);
    }

    #[tokio::test]
    async fn optimistic_entry_visible_before_send_resolves() {
        let (state, _) = state_with(vec![]);
        state.activate("a", Some("b")).await;
        let sender = state.clone();
        let task = tokio::spawn(async move { sender.send_message("slow hello").await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(contents(&state.snapshot().await), ["slow hello"]);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failed_send_rolls_back_and_records_error() {
        let (state, _) = state_with(vec![]);
        state.activate("a", Some("b")).await;
        assert!(state.send_message("please fail").await.is_err());
        let snap = state.snapshot().await;
        assert!(snap.messages.is_empty());
        assert!(snap.error.unwrap().starts_with("Failed to send message"));
    }

    #[tokio::test]
    async fn rapid_sends_first_ok_second_fails() {
        let (state, _) = state_with(vec![]);
        state.activate("a", Some("b")).await;

        let (first, second) = tokio::join!(state.send_message("slow first"), state.send_message("second fail"));
        assert!(first.is_ok());
        assert!(second.is_err());
        assert_eq!(contents(&state.snapshot().await), ["slow first"]);
    }

    #[tokio::test]
    async fn rollback_removes_failed_entry_not_latest() {
        let (state, _) = state_with(vec![]);
        state.activate("a", Some("b")).await;

        // The failing send resolves last, after a newer entry was appended.
        let (first, second) = tokio::join!(state.send_message("slow fail"), state.send_message("quick"));
        assert!(first.is_err());
        assert!(second.is_ok());
        assert_eq!(contents(&state.snapshot().await), ["quick"]);
    }

    #[tokio::test]
    async fn send_without_conversation_is_rejected() {
        let (state, api) = state_with(vec![]);
        assert!(matches!(state.send_message("x").await, Err(Error::NotActive)));
        assert!(state.snapshot().await.error.is_some());
        assert!(api.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn inbound_filters_foreign_and_own_messages() {
        let (state, _) = state_with(vec![]);
        assert!(!state.apply_inbound(Message::outgoing("b", "a", "before activation")).await);

        state.activate("a", Some("b")).await;
        assert!(state.apply_inbound(Message::outgoing("b", "a", "hi")).await);
        assert!(!state.apply_inbound(Message::outgoing("a", "b", "echo")).await);
        assert!(!state.apply_inbound(Message::outgoing("c", "a", "other chat")).await);
        assert!(state.apply_inbound(Message::outgoing("b", "a", "again")).await);
        assert_eq!(contents(&state.snapshot().await), ["hi", "again"]);
    }

    #[tokio::test]
    async fn switching_conversation_clears_messages() {
        let (state, _) = state_with(vec![Message::outgoing("b", "a", "for b")]);
        state.activate("a", Some("b")).await;
        state.apply_inbound(Message::outgoing("b", "a", "live")).await;
        state.activate("a", Some("c")).await;
        assert!(state.snapshot().await.messages.is_empty());
    }

    #[tokio::test]
    async fn send_timeout_rolls_back() {
        let api = Arc::new(FakeApi::default());
        let state = ChatState::with_timeout(api, Duration::from_millis(10));
        state.activate("a", Some("b")).await;
        let err = state.send_message("slow but fine").await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(state.snapshot().await.messages.is_empty());
    }

    #[tokio::test]
    async fn session_without_transport_is_http_only() {
        let (state, _) = state_with(vec![]);
        let mut session = ChatSession::new(state, None);
        assert_eq!(session.activate("a", Some("b")).await, Phase::Ready);
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        session.send_message("hi").await.unwrap();
        assert_eq!(contents(&session.state().snapshot().await), ["hi"]);
        session.deactivate().await;
    }
}
