//! In-process relay that records every frame. Used by tests to observe a
//! session's wire traffic and to inject dial failures, write failures and
//! stalled writes.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use driplet_proto::AgentFrame;
use url::Url;

use super::{RelayDialer, RelayTransport};
use crate::error::RelayError;

#[derive(Debug, Clone, Default)]
pub struct RecordedConnection {
    pub url: String,
    pub frames: Vec<String>,
    /// Every call to `send_text`, including ones that failed.
    pub write_attempts: usize,
    pub closed: bool,
}

impl RecordedConnection {
    pub fn parsed(&self) -> Vec<AgentFrame> {
        self.frames
            .iter()
            .filter_map(|frame| AgentFrame::parse(frame).ok())
            .collect()
    }

    pub fn service_id(&self) -> Option<String> {
        match self.parsed().first() {
            Some(AgentFrame::Auth(auth)) => Some(auth.service_id.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct RelayState {
    connections: Vec<RecordedConnection>,
    dial_attempts: usize,
    refuse_dials: bool,
    fail_writes_after: Option<usize>,
    stall_writes_after: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent dial fails.
    pub fn refuse_dials(self) -> Self {
        self.lock().refuse_dials = true;
        self
    }

    /// Each connection accepts `frames` writes and fails every write after.
    pub fn fail_writes_after(self, frames: usize) -> Self {
        self.lock().fail_writes_after = Some(frames);
        self
    }

    /// Each connection accepts `frames` writes; every later write, and the
    /// close handshake, never complete. Models a peer that stopped reading.
    pub fn stall_writes_after(self, frames: usize) -> Self {
        self.lock().stall_writes_after = Some(frames);
        self
    }

    pub fn dial_attempts(&self) -> usize {
        self.lock().dial_attempts
    }

    pub fn connections(&self) -> Vec<RecordedConnection> {
        self.lock().connections.clone()
    }

    pub fn connection_for(&self, service_id: &str) -> Option<RecordedConnection> {
        self.connections()
            .into_iter()
            .find(|conn| conn.service_id().as_deref() == Some(service_id))
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RelayDialer for MemoryRelay {
    async fn dial(&self, url: &Url) -> Result<Box<dyn RelayTransport>, RelayError> {
        let mut state = self.lock();
        state.dial_attempts += 1;
        if state.refuse_dials {
            return Err(RelayError::Dial(format!("connection refused: {url}")));
        }
        state.connections.push(RecordedConnection {
            url: url.to_string(),
            ..RecordedConnection::default()
        });
        let index = state.connections.len() - 1;
        Ok(Box::new(MemoryConnection {
            relay: self.clone(),
            index,
        }))
    }
}

struct MemoryConnection {
    relay: MemoryRelay,
    index: usize,
}

#[async_trait]
impl RelayTransport for MemoryConnection {
    async fn send_text(&mut self, text: String) -> Result<(), RelayError> {
        {
            let mut state = self.relay.lock();
            let fail_after = state.fail_writes_after;
            let stall_after = state.stall_writes_after;
            let conn = &mut state.connections[self.index];
            conn.write_attempts += 1;
            if conn.closed {
                return Err(RelayError::Closed);
            }
            if fail_after.is_some_and(|limit| conn.frames.len() >= limit) {
                return Err(RelayError::Write("broken pipe".into()));
            }
            if !stall_after.is_some_and(|limit| conn.frames.len() >= limit) {
                conn.frames.push(text);
                return Ok(());
            }
        }
        std::future::pending().await
    }

    async fn close(&mut self) {
        if self.is_stalled() {
            std::future::pending::<()>().await;
        }
        self.relay.lock().connections[self.index].closed = true;
    }
}

impl MemoryConnection {
    fn is_stalled(&self) -> bool {
        let state = self.relay.lock();
        let sent = state.connections[self.index].frames.len();
        state.stall_writes_after.is_some_and(|limit| sent >= limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::relay_url;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test_timeout::tokio_timeout_test(5)]
    async fn records_frames_per_connection() {
        let relay = MemoryRelay::new();
        let url = relay_url("relay.test").expect("url");
        let mut conn = relay.dial(&url).await.expect("dial");
        conn.send_text(r#"{"authToken":"t","userID":"u","serviceID":"svc"}"#.into())
            .await
            .expect("send");
        conn.close().await;

        let recorded = relay.connection_for("svc").expect("connection");
        assert_eq!(recorded.frames.len(), 1);
        assert!(recorded.closed);
        assert_eq!(recorded.url, "wss://relay.test/ws/server");
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn injected_write_failure_is_sticky() {
        let relay = MemoryRelay::new().fail_writes_after(1);
        let url = relay_url("relay.test").expect("url");
        let mut conn = relay.dial(&url).await.expect("dial");
        conn.send_text("one".into()).await.expect("first write");
        assert!(conn.send_text("two".into()).await.is_err());
        assert!(conn.send_text("three".into()).await.is_err());
        assert_eq!(relay.connections()[0].frames, vec!["one".to_string()]);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn stalled_connection_never_completes_writes_or_close() {
        let relay = MemoryRelay::new().stall_writes_after(1);
        let url = relay_url("relay.test").expect("url");
        let mut conn = relay.dial(&url).await.expect("dial");
        conn.send_text("one".into()).await.expect("first write");

        let pending = Duration::from_millis(100);
        assert!(timeout(pending, conn.send_text("two".into())).await.is_err());
        assert!(timeout(pending, conn.close()).await.is_err());

        let recorded = &relay.connections()[0];
        assert_eq!(recorded.frames, vec!["one".to_string()]);
        assert_eq!(recorded.write_attempts, 2);
        assert!(!recorded.closed);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn refused_dials_are_counted() {
        let relay = MemoryRelay::new().refuse_dials();
        let url = relay_url("relay.test").expect("url");
        assert!(relay.dial(&url).await.is_err());
        assert_eq!(relay.dial_attempts(), 1);
        assert!(relay.connections().is_empty());
    }
}
