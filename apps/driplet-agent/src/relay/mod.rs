//! Outbound relay connections. A session only ever sees the two traits
//! below; the WebSocket implementation is what production dials.

use async_trait::async_trait;
use url::Url;

use crate::error::RelayError;

pub mod memory;
pub mod websocket;

pub use memory::MemoryRelay;
pub use websocket::WebSocketDialer;

pub const RELAY_PATH: &str = "/ws/server";

/// One established connection. Sends complete before returning, so a
/// single owner issuing sends in sequence never has two writes in flight.
#[async_trait]
pub trait RelayTransport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), RelayError>;

    /// Releases the connection. Calling it again is a no-op.
    async fn close(&mut self);
}

#[async_trait]
pub trait RelayDialer: Send + Sync {
    async fn dial(&self, url: &Url) -> Result<Box<dyn RelayTransport>, RelayError>;
}

/// Builds the relay endpoint from a bare host (`wss://` assumed) or from an
/// explicit `ws://`/`wss://` base.
pub fn relay_url(host: &str) -> Result<Url, RelayError> {
    let trimmed = host.trim().trim_end_matches('/');
    let raw = if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        format!("{trimmed}{RELAY_PATH}")
    } else {
        format!("wss://{trimmed}{RELAY_PATH}")
    };
    Url::parse(&raw).map_err(|source| RelayError::InvalidUrl { url: raw, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn bare_host_uses_secure_scheme() {
        let url = relay_url("ws.driplet.tk").expect("url");
        assert_eq!(url.as_str(), "wss://ws.driplet.tk/ws/server");
    }

    #[test_timeout::timeout]
    fn explicit_plain_scheme_is_kept() {
        let url = relay_url("ws://127.0.0.1:4100/").expect("url");
        assert_eq!(url.as_str(), "ws://127.0.0.1:4100/ws/server");
    }

    #[test_timeout::timeout]
    fn garbage_host_is_rejected() {
        let err = relay_url("ws://exa mple:99999").unwrap_err();
        assert!(err.is_dial());
    }
}
