//! Per-service relay session.
//!
//! Lifecycle: `Disconnected → Connecting → Authenticated → Streaming →
//! Closing → Closed`. A failed dial goes straight from `Connecting` to
//! `Closing`; nothing is written on a connection that was never established.
//! Once streaming, the session multiplexes log lines and heartbeats onto the
//! relay from a single loop, so writes are strictly sequential and keep the
//! order of the events that produced them.

use std::sync::Arc;
use std::time::Duration;

use driplet_proto::{MessageKind, ServiceDescriptor, SessionAuthRequest, StreamMessage};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{AgentConfig, Credentials};
use crate::error::RelayError;
use crate::heartbeat::HeartbeatEmitter;
use crate::log_source::ProcessLogSource;
use crate::metrics;
use crate::relay::{RelayDialer, RelayTransport};

/// Upper bound on the relay close handshake during teardown.
const TRANSPORT_CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticated,
    Streaming,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Cancelled,
    WriteFailed,
    DialFailed,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Cancelled => "cancelled",
            CloseReason::WriteFailed => "write_failed",
            CloseReason::DialFailed => "dial_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub heartbeat_interval: Duration,
    pub dial_timeout: Duration,
    pub log_buffer: usize,
}

impl From<&AgentConfig> for SessionSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            dial_timeout: config.dial_timeout,
            log_buffer: config.log_buffer,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub service_id: String,
    pub reason: CloseReason,
    pub final_state: SessionState,
    pub transitions: Vec<SessionState>,
    pub process_launched: bool,
    pub log_lines_sent: u64,
    pub heartbeats_sent: u64,
}

/// Why a frame did not reach the relay.
enum SendError {
    Cancelled,
    Relay(RelayError),
}

impl From<RelayError> for SendError {
    fn from(err: RelayError) -> Self {
        SendError::Relay(err)
    }
}

enum StreamEvent {
    Cancelled,
    Line(Option<String>),
    Heartbeat(StreamMessage),
}

pub struct ConnectionSession {
    descriptor: ServiceDescriptor,
    credentials: Arc<Credentials>,
    relay_url: Url,
    dialer: Arc<dyn RelayDialer>,
    settings: SessionSettings,
    cancel: CancellationToken,
    state: SessionState,
    transitions: Vec<SessionState>,
    transport: Option<Box<dyn RelayTransport>>,
    log_source: Option<ProcessLogSource>,
    log_lines_sent: u64,
    heartbeats_sent: u64,
}

impl ConnectionSession {
    pub fn new(
        descriptor: ServiceDescriptor,
        credentials: Arc<Credentials>,
        relay_url: Url,
        dialer: Arc<dyn RelayDialer>,
        settings: SessionSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            descriptor,
            credentials,
            relay_url,
            dialer,
            settings,
            cancel,
            state: SessionState::Disconnected,
            transitions: vec![SessionState::Disconnected],
            transport: None,
            log_source: None,
            log_lines_sent: 0,
            heartbeats_sent: 0,
        }
    }

    pub fn service_id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drives the session until it is `Closed`.
    pub async fn run(mut self) -> SessionReport {
        metrics::SESSIONS_ACTIVE.inc();
        let reason = self.drive().await;
        self.close().await;
        metrics::SESSIONS_ACTIVE.dec();
        metrics::SESSIONS_CLOSED
            .with_label_values(&[reason.as_str()])
            .inc();
        info!(
            service_id = %self.descriptor.id,
            reason = reason.as_str(),
            log_lines = self.log_lines_sent,
            heartbeats = self.heartbeats_sent,
            "session closed"
        );
        SessionReport {
            service_id: self.descriptor.id.clone(),
            reason,
            final_state: self.state,
            transitions: self.transitions.clone(),
            process_launched: self.log_source.is_some(),
            log_lines_sent: self.log_lines_sent,
            heartbeats_sent: self.heartbeats_sent,
        }
    }

    async fn drive(&mut self) -> CloseReason {
        let cancel = self.cancel.clone();

        self.transition(SessionState::Connecting);
        match self.connect(&cancel).await {
            Ok(transport) => self.transport = Some(transport),
            Err(reason) => return reason,
        }

        self.transition(SessionState::Authenticated);
        let auth = SessionAuthRequest {
            auth_token: self.credentials.auth_token.clone(),
            user_id: self.credentials.user_id.clone(),
            service_id: self.descriptor.id.clone(),
        };
        match self.write(&auth).await {
            Ok(()) => {}
            Err(SendError::Cancelled) => return CloseReason::Cancelled,
            Err(SendError::Relay(err)) => {
                warn!(service_id = %self.descriptor.id, error = %err, "failed to send auth request");
                return CloseReason::WriteFailed;
            }
        }
        if cancel.is_cancelled() {
            return CloseReason::Cancelled;
        }

        let mut log_rx = self.start_log_source();
        let mut heartbeat = HeartbeatEmitter::new(
            self.settings.heartbeat_interval,
            self.descriptor.id.as_str(),
            self.credentials.user_id.as_str(),
        );
        self.transition(SessionState::Streaming);

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => StreamEvent::Cancelled,
                beat = heartbeat.tick() => StreamEvent::Heartbeat(beat),
                line = next_line(&mut log_rx) => StreamEvent::Line(line),
            };

            let message = match event {
                StreamEvent::Cancelled => return CloseReason::Cancelled,
                StreamEvent::Line(Some(text)) => StreamMessage::log_line(
                    self.descriptor.id.as_str(),
                    self.credentials.user_id.as_str(),
                    text,
                ),
                StreamEvent::Line(None) => {
                    debug!(
                        service_id = %self.descriptor.id,
                        "log stream ended; continuing with heartbeats only"
                    );
                    log_rx = None;
                    continue;
                }
                StreamEvent::Heartbeat(beat) => beat,
            };

            match self.send(message).await {
                Ok(()) => {}
                Err(SendError::Cancelled) => return CloseReason::Cancelled,
                Err(SendError::Relay(err)) => {
                    warn!(
                        service_id = %self.descriptor.id,
                        error = %err,
                        "relay write failed; closing session"
                    );
                    return CloseReason::WriteFailed;
                }
            }
        }
    }

    async fn connect(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn RelayTransport>, CloseReason> {
        let dialer = Arc::clone(&self.dialer);
        let url = self.relay_url.clone();
        let dial_timeout = self.settings.dial_timeout;
        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(dial_timeout, dialer.dial(&url)) => Some(result),
        };

        let err = match attempt {
            None => return Err(CloseReason::Cancelled),
            Some(Ok(Ok(transport))) => {
                debug!(service_id = %self.descriptor.id, %url, "relay connected");
                return Ok(transport);
            }
            Some(Ok(Err(err))) => err,
            Some(Err(_elapsed)) => RelayError::DialTimeout(dial_timeout),
        };
        warn!(
            service_id = %self.descriptor.id,
            %url,
            error = %err,
            "relay dial failed; session will not stream"
        );
        Err(CloseReason::DialFailed)
    }

    fn start_log_source(&mut self) -> Option<mpsc::Receiver<String>> {
        match ProcessLogSource::spawn(&self.descriptor.log_command, self.settings.log_buffer) {
            Ok((source, rx)) => {
                info!(
                    service_id = %self.descriptor.id,
                    program = source.program(),
                    "streaming logs"
                );
                self.log_source = Some(source);
                Some(rx)
            }
            Err(err) => {
                metrics::LAUNCH_FAILURES.inc();
                warn!(
                    service_id = %self.descriptor.id,
                    log_command = %self.descriptor.log_command,
                    error = %err,
                    "could not start log command; sending heartbeats only"
                );
                None
            }
        }
    }

    async fn send(&mut self, message: StreamMessage) -> Result<(), SendError> {
        let kind = message.kind();
        self.write(&message).await?;
        match kind {
            MessageKind::Log => self.log_lines_sent += 1,
            MessageKind::Heartbeat => self.heartbeats_sent += 1,
        }
        metrics::MESSAGES_SENT
            .with_label_values(&[kind.as_str()])
            .inc();
        Ok(())
    }

    /// A write the relay never completes is abandoned as soon as the session
    /// is cancelled.
    async fn write<T: Serialize>(&mut self, frame: &T) -> Result<(), SendError> {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return Err(RelayError::Closed.into());
        }
        let text = serde_json::to_string(frame).map_err(RelayError::from)?;
        let cancel = self.cancel.clone();
        let transport = self.transport.as_mut().ok_or(RelayError::Closed)?;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(service_id = %self.descriptor.id, "write abandoned on shutdown");
                return Err(SendError::Cancelled);
            }
            result = transport.send_text(text) => result,
        };
        if let Err(err) = result {
            metrics::WRITE_FAILURES.inc();
            self.transition(SessionState::Closing);
            return Err(err.into());
        }
        Ok(())
    }

    /// Tears down the process and the connection. Idempotent.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.transition(SessionState::Closing);
        if let Some(source) = self.log_source.as_mut() {
            source.terminate().await;
        }
        if let Some(transport) = self.transport.as_mut() {
            if tokio::time::timeout(TRANSPORT_CLOSE_TIMEOUT, transport.close())
                .await
                .is_err()
            {
                debug!(
                    service_id = %self.descriptor.id,
                    "relay close did not finish; dropping connection"
                );
            }
        }
        self.transport = None;
        self.transition(SessionState::Closed);
    }

    fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        debug!(
            service_id = %self.descriptor.id,
            from = ?self.state,
            to = ?next,
            "session state"
        );
        self.state = next;
        self.transitions.push(next);
    }
}

/// Pending forever once the log stream is gone, so the select keeps serving
/// heartbeats and cancellation.
async fn next_line(rx: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{relay_url, MemoryRelay};
    use driplet_proto::AgentFrame;
    use std::time::Instant;

    const HEARTBEAT: Duration = Duration::from_millis(40);

    fn settings(heartbeat_interval: Duration) -> SessionSettings {
        SessionSettings {
            heartbeat_interval,
            dial_timeout: Duration::from_secs(2),
            log_buffer: 16,
        }
    }

    fn session(
        relay: &MemoryRelay,
        id: &str,
        log_command: &str,
        cancel: CancellationToken,
    ) -> ConnectionSession {
        session_with(relay, id, log_command, cancel, settings(HEARTBEAT))
    }

    fn session_with(
        relay: &MemoryRelay,
        id: &str,
        log_command: &str,
        cancel: CancellationToken,
        settings: SessionSettings,
    ) -> ConnectionSession {
        ConnectionSession::new(
            ServiceDescriptor {
                id: id.into(),
                log_command: log_command.into(),
            },
            Arc::new(Credentials::new("tok", "user-1")),
            relay_url("relay.test").expect("url"),
            Arc::new(relay.clone()),
            settings,
            cancel,
        )
    }

    fn stream_messages(frames: &[AgentFrame]) -> Vec<StreamMessage> {
        frames
            .iter()
            .filter_map(|frame| match frame {
                AgentFrame::Stream(message) => Some(message.clone()),
                AgentFrame::Auth(_) => None,
            })
            .collect()
    }

    async fn wait_for<F>(relay: &MemoryRelay, service: &str, mut done: F)
    where
        F: FnMut(&[AgentFrame]) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(conn) = relay.connection_for(service) {
                if done(conn.parsed().as_slice()) {
                    return;
                }
            }
            assert!(Instant::now() < deadline, "relay never saw expected frames");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test_timeout::tokio_timeout_test(15)]
    async fn echo_scenario_sends_one_log_line_then_heartbeats() {
        let relay = MemoryRelay::new();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(session(&relay, "svc1", "echo hello", cancel.clone()).run());

        wait_for(&relay, "svc1", |frames| {
            stream_messages(frames)
                .iter()
                .filter(|m| m.kind() == MessageKind::Heartbeat)
                .count()
                >= 3
        })
        .await;
        cancel.cancel();
        let report = task.await.expect("session task");

        let conn = relay.connection_for("svc1").expect("connection");
        let frames = conn.parsed();
        assert!(matches!(&frames[0], AgentFrame::Auth(auth) if auth.service_id == "svc1" && auth.auth_token == "tok"));
        let logs: Vec<_> = stream_messages(&frames)
            .into_iter()
            .filter(|m| m.kind() == MessageKind::Log)
            .collect();
        assert_eq!(logs, vec![StreamMessage::log_line("svc1", "user-1", "hello")]);
        assert_eq!(report.reason, CloseReason::Cancelled);
        assert_eq!(report.final_state, SessionState::Closed);
        assert_eq!(report.log_lines_sent, 1);
        assert!(report.heartbeats_sent >= 3);
        assert!(conn.closed);
    }

    #[test_timeout::tokio_timeout_test(15)]
    async fn auth_is_sent_exactly_once_and_first() {
        let relay = MemoryRelay::new();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(session(&relay, "svc1", "printf a\\nb\\n", cancel.clone()).run());

        wait_for(&relay, "svc1", |frames| frames.len() >= 4).await;
        cancel.cancel();
        task.await.expect("session task");

        let frames = relay.connection_for("svc1").expect("connection").parsed();
        let auth_positions: Vec<usize> = frames
            .iter()
            .enumerate()
            .filter(|(_, f)| matches!(f, AgentFrame::Auth(_)))
            .map(|(idx, _)| idx)
            .collect();
        assert_eq!(auth_positions, vec![0]);
    }

    #[test_timeout::tokio_timeout_test(15)]
    async fn log_lines_keep_process_order() {
        let relay = MemoryRelay::new();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(session(&relay, "svc1", "printf a\\nb\\nc\\n", cancel.clone()).run());

        wait_for(&relay, "svc1", |frames| {
            stream_messages(frames)
                .iter()
                .filter(|m| m.kind() == MessageKind::Log)
                .count()
                == 3
        })
        .await;
        cancel.cancel();
        task.await.expect("session task");

        let frames = relay.connection_for("svc1").expect("connection").parsed();
        let texts: Vec<String> = stream_messages(&frames)
            .into_iter()
            .filter_map(|m| match m {
                StreamMessage::LogLine { text, .. } => Some(text),
                StreamMessage::Heartbeat { .. } => None,
            })
            .collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[test_timeout::tokio_timeout_test(15)]
    async fn cancellation_closes_within_one_heartbeat_and_kills_process() {
        let relay = MemoryRelay::new();
        let cancel = CancellationToken::new();
        let interval = Duration::from_millis(300);
        let mut session = session_with(&relay, "svc1", "sleep 30", cancel.clone(), settings(interval));
        let probe = cancel.clone();

        let task = tokio::spawn(async move {
            let reason = session.drive().await;
            session.close().await;
            (reason, session)
        });
        wait_for(&relay, "svc1", |frames| frames.len() >= 2).await;

        let cancelled_at = Instant::now();
        probe.cancel();
        let (reason, session) = task.await.expect("session task");
        assert!(cancelled_at.elapsed() < interval);
        assert_eq!(reason, CloseReason::Cancelled);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session
            .log_source
            .as_ref()
            .expect("process was launched")
            .is_terminated());
    }

    async fn wait_for_write_attempts(relay: &MemoryRelay, attempts: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while relay
            .connections()
            .first()
            .map_or(0, |conn| conn.write_attempts)
            < attempts
        {
            assert!(Instant::now() < deadline, "relay never saw {attempts} writes");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test_timeout::tokio_timeout_test(15)]
    async fn cancellation_interrupts_a_stalled_stream_write() {
        let relay = MemoryRelay::new().stall_writes_after(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(session(&relay, "svc1", "sleep 30", cancel.clone()).run());

        // auth went through; the first heartbeat is stuck in the relay
        wait_for_write_attempts(&relay, 2).await;
        cancel.cancel();
        let report = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("session closes while the relay is stalled")
            .expect("session task");

        assert_eq!(report.reason, CloseReason::Cancelled);
        assert_eq!(report.final_state, SessionState::Closed);
        assert!(report.process_launched);
        assert_eq!(report.heartbeats_sent, 0);
        assert_eq!(relay.connections()[0].frames.len(), 1);
    }

    #[test_timeout::tokio_timeout_test(15)]
    async fn cancellation_interrupts_a_stalled_auth_write() {
        let relay = MemoryRelay::new().stall_writes_after(0);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(session(&relay, "svc1", "echo hello", cancel.clone()).run());

        wait_for_write_attempts(&relay, 1).await;
        cancel.cancel();
        let report = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("session closes while the relay is stalled")
            .expect("session task");

        assert_eq!(report.reason, CloseReason::Cancelled);
        assert_eq!(report.final_state, SessionState::Closed);
        assert!(!report.process_launched);
        assert!(!report.transitions.contains(&SessionState::Streaming));
    }

    #[test_timeout::tokio_timeout_test(15)]
    async fn write_failure_closes_session_without_further_writes() {
        let relay = MemoryRelay::new().fail_writes_after(2);
        let report = session(&relay, "svc1", "sleep 30", CancellationToken::new())
            .run()
            .await;

        assert_eq!(report.reason, CloseReason::WriteFailed);
        assert_eq!(report.final_state, SessionState::Closed);
        let conn = &relay.connections()[0];
        assert_eq!(conn.frames.len(), 2);
        assert_eq!(conn.write_attempts, 3);
        assert!(conn.closed);
    }

    #[test_timeout::tokio_timeout_test(15)]
    async fn failed_auth_write_never_streams() {
        let relay = MemoryRelay::new().fail_writes_after(0);
        let report = session(&relay, "svc1", "echo hello", CancellationToken::new())
            .run()
            .await;

        assert_eq!(report.reason, CloseReason::WriteFailed);
        assert!(!report.transitions.contains(&SessionState::Streaming));
        assert!(!report.process_launched);
        assert_eq!(relay.connections()[0].write_attempts, 1);
    }

    #[test_timeout::tokio_timeout_test(15)]
    async fn dial_failure_skips_authentication() {
        let relay = MemoryRelay::new().refuse_dials();
        let report = session(&relay, "svc1", "echo hello", CancellationToken::new())
            .run()
            .await;

        assert_eq!(report.reason, CloseReason::DialFailed);
        assert_eq!(
            report.transitions,
            vec![
                SessionState::Disconnected,
                SessionState::Connecting,
                SessionState::Closing,
                SessionState::Closed,
            ]
        );
        assert!(relay.connections().is_empty());
        assert!(!report.process_launched);
    }

    #[test_timeout::tokio_timeout_test(15)]
    async fn unlaunchable_command_degrades_to_heartbeats() {
        let relay = MemoryRelay::new();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            session(&relay, "svc1", "definitely-not-a-real-binary-xyz", cancel.clone()).run(),
        );

        wait_for(&relay, "svc1", |frames| frames.len() >= 3).await;
        cancel.cancel();
        let report = task.await.expect("session task");

        assert!(!report.process_launched);
        assert!(report.transitions.contains(&SessionState::Streaming));
        assert_eq!(report.log_lines_sent, 0);
        assert!(report.heartbeats_sent >= 2);
    }

    #[test_timeout::tokio_timeout_test(15)]
    async fn close_is_idempotent() {
        let relay = MemoryRelay::new();
        let mut session = session(&relay, "svc1", "echo hello", CancellationToken::new());
        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            session.transitions,
            vec![
                SessionState::Disconnected,
                SessionState::Closing,
                SessionState::Closed
            ]
        );
    }
}
