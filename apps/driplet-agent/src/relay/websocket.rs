use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};
use url::Url;

use super::{RelayDialer, RelayTransport};
use crate::error::RelayError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketDialer;

#[async_trait]
impl RelayDialer for WebSocketDialer {
    async fn dial(&self, url: &Url) -> Result<Box<dyn RelayTransport>, RelayError> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| RelayError::Dial(format!("websocket connect failed: {err}")))?;
        debug!(%url, "relay websocket connected");
        Ok(Box::new(WebSocketRelay::new(ws_stream)))
    }
}

/// Write half owned by the session; the read half is drained on a background
/// task so control frames keep flowing and a peer close is noticed.
pub struct WebSocketRelay {
    sink: SplitSink<WsStream, Message>,
    peer_closed: Arc<AtomicBool>,
    drain: Option<JoinHandle<()>>,
    closed: bool,
}

impl WebSocketRelay {
    fn new(ws_stream: WsStream) -> Self {
        let (sink, stream) = ws_stream.split();
        let peer_closed = Arc::new(AtomicBool::new(false));
        let drain = tokio::spawn(drain_inbound(stream, Arc::clone(&peer_closed)));
        Self {
            sink,
            peer_closed,
            drain: Some(drain),
            closed: false,
        }
    }
}

#[async_trait]
impl RelayTransport for WebSocketRelay {
    async fn send_text(&mut self, text: String) -> Result<(), RelayError> {
        if self.closed || self.peer_closed.load(Ordering::SeqCst) {
            return Err(RelayError::Closed);
        }
        trace!(len = text.len(), "ws_out");
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|err| RelayError::Write(err.to_string()))
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let send_close = !self.peer_closed.load(Ordering::SeqCst);
        let sink = &mut self.sink;
        let handshake = async move {
            if send_close {
                if let Err(err) = sink.send(Message::Close(None)).await {
                    debug!(error = %err, "relay close frame not delivered");
                }
            }
            let _ = sink.close().await;
        };
        if tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, handshake)
            .await
            .is_err()
        {
            debug!("relay stopped reading; abandoning close handshake");
        }
        if let Some(drain) = self.drain.take() {
            drain.abort();
        }
    }
}

impl Drop for WebSocketRelay {
    fn drop(&mut self) {
        if let Some(drain) = self.drain.take() {
            drain.abort();
        }
    }
}

async fn drain_inbound(mut stream: SplitStream<WsStream>, peer_closed: Arc<AtomicBool>) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                debug!(len = text.len(), "relay sent text frame");
            }
            Ok(Message::Close(frame)) => {
                debug!(?frame, "relay closed the connection");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                match &err {
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                        debug!("relay websocket closed: {err}");
                    }
                    _ => {
                        warn!("relay websocket error: {err}");
                    }
                }
                break;
            }
        }
    }
    peer_closed.store(true, Ordering::SeqCst);
}
