use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("malformed STOMP frame: {0}")]
    Frame(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("authorization failed: {0}")]
    Auth(String),

    #[error("no active conversation")]
    NotActive,

    #[error("{0} connection closed")]
    Closed(&'static str),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("config write error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}
