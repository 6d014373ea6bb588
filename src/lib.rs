//! Marketplace chat client.
//!
//! Talks to the marketplace backend over HTTP for history and sends, over
//! STOMP-on-WebSocket for live delivery, and to a Pusher-compatible service
//! for out-of-band notifications.

pub mod api;
pub mod channel;
pub mod chat;
pub mod config;
pub mod error;
pub mod notify;
pub mod stomp;
pub mod storage;
pub mod utils;

pub use error::{Error, Result};
