//! Channel names shared with the backend.
//!
//! The backend derives the same names on its side; any divergence here means
//! messages are published to a channel nobody listens on.

const CHAT_PREFIX: &str = "private-chat-";
const USER_PREFIX: &str = "private-user-";

/// Replace every character outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// Identifiers are emails on the backend, which calls this `sanitizeEmail`.
pub fn sanitize_email(email: &str) -> String {
    sanitize(email)
}

/// Conversation channel for two participants, independent of argument order.
pub fn channel_name(a: &str, b: &str) -> String {
    let mut ids = [sanitize(a), sanitize(b)];
    ids.sort();
    format!("{}{}", CHAT_PREFIX, ids.join("-"))
}

/// Per-user notification channel.
pub fn user_channel_name(id: &str) -> String {
    format!("{}{}", USER_PREFIX, sanitize(id))
}
