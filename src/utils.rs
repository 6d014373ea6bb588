use url::Url;

use crate::{Error, Result};

pub fn normalize_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

/// Map the backend's HTTP base to its WebSocket endpoint at `path`.
pub fn websocket_url(base: &Url, path: &str) -> Result<Url> {
    let mut url = base.clone();
    let scheme = match base.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => base.scheme(),
        other => return Err(Error::Config(format!("unsupported backend scheme: {}", other))),
    }
    .to_string();
    url.set_scheme(&scheme)
        .map_err(|_| Error::Config(format!("cannot derive WebSocket URL from {}", base)))?;
    url.path_segments_mut()
        .map_err(|_| Error::Config(format!("{} cannot be used as a base URL", base)))?
        .pop_if_empty()
        .push(path);
    Ok(url)
}
