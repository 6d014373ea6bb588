pub mod client;
pub mod events;
pub mod models;

pub use client::{ApiClient, MessageApi};
pub use events::{EventStream, IncomingEvent, NotificationEvent, TransportEvent};
pub use models::{Conversation, Message, MessageId, MessageStatus};
