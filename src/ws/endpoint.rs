use url::Url;

use super::error::WsError;
use crate::Result;

/// Parse an endpoint into a `ws://` or `wss://` URL.
///
/// `http://` and `https://` addresses are rewritten to their WebSocket
/// equivalents. Empty input and any other scheme are rejected.
pub fn normalize_endpoint(endpoint: &str) -> Result<Url> {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return Err(WsError::InvalidEndpoint("endpoint is empty".to_owned()).into());
    }

    let mut url = Url::parse(trimmed)?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(WsError::InvalidEndpoint(format!(
                "unsupported scheme `{other}` in {trimmed}"
            ))
            .into());
        }
    };

    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(WsError::InvalidEndpoint(format!("cannot use {trimmed} as {scheme}")).into());
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(WsError::InvalidEndpoint(format!("missing host in {trimmed}")).into());
    }

    Ok(url)
}
