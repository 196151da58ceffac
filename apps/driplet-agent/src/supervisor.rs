use std::num::NonZeroUsize;
use std::sync::Arc;

use driplet_proto::ServiceDescriptor;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::Credentials;
use crate::metrics;
use crate::relay::RelayDialer;
use crate::session::{CloseReason, ConnectionSession, SessionReport, SessionSettings};
use crate::shutdown::ShutdownCoordinator;

/// Outcome of one supervisor run: one entry per session that returned, plus
/// the count of session tasks that panicked instead.
#[derive(Debug, Default)]
pub struct SupervisorReport {
    pub started: usize,
    pub sessions: Vec<SessionReport>,
    pub panicked: usize,
}

impl SupervisorReport {
    pub fn finished(&self) -> usize {
        self.sessions.len() + self.panicked
    }

    pub fn count(&self, reason: CloseReason) -> usize {
        self.sessions.iter().filter(|s| s.reason == reason).count()
    }
}

/// Fans out one session per descriptor and waits for every one of them.
pub struct AgentSupervisor {
    credentials: Arc<Credentials>,
    relay_url: Url,
    dialer: Arc<dyn RelayDialer>,
    settings: SessionSettings,
    shutdown: ShutdownCoordinator,
    max_concurrent: Option<NonZeroUsize>,
}

impl AgentSupervisor {
    pub fn new(
        credentials: Arc<Credentials>,
        relay_url: Url,
        dialer: Arc<dyn RelayDialer>,
        settings: SessionSettings,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            credentials,
            relay_url,
            dialer,
            settings,
            shutdown,
            max_concurrent: None,
        }
    }

    /// Caps how many sessions run at once; the rest wait for a slot.
    pub fn with_max_concurrent(mut self, limit: Option<NonZeroUsize>) -> Self {
        self.max_concurrent = limit;
        self
    }

    pub async fn run(&self, descriptors: Vec<ServiceDescriptor>) -> SupervisorReport {
        let mut report = SupervisorReport {
            started: descriptors.len(),
            ..SupervisorReport::default()
        };
        if descriptors.is_empty() {
            warn!("no services to stream; nothing to supervise");
            return report;
        }

        let slots = self
            .max_concurrent
            .map(|limit| Arc::new(Semaphore::new(limit.get())));
        info!(
            sessions = descriptors.len(),
            max_concurrent = ?self.max_concurrent,
            relay = %self.relay_url,
            "starting sessions"
        );

        let mut tasks = JoinSet::new();
        for descriptor in descriptors {
            let session = ConnectionSession::new(
                descriptor,
                Arc::clone(&self.credentials),
                self.relay_url.clone(),
                Arc::clone(&self.dialer),
                self.settings.clone(),
                self.shutdown.subscribe(),
            );
            let slots = slots.clone();
            metrics::SESSIONS_STARTED.inc();
            tasks.spawn(async move {
                let _permit = match slots {
                    Some(slots) => slots.acquire_owned().await.ok(),
                    None => None,
                };
                session.run().await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(session) => {
                    debug!(
                        service_id = %session.service_id,
                        reason = session.reason.as_str(),
                        "session finished"
                    );
                    report.sessions.push(session);
                }
                Err(err) => {
                    error!(error = %err, "session task panicked");
                    report.panicked += 1;
                }
            }
        }

        info!(
            started = report.started,
            cancelled = report.count(CloseReason::Cancelled),
            write_failed = report.count(CloseReason::WriteFailed),
            dial_failed = report.count(CloseReason::DialFailed),
            panicked = report.panicked,
            "all sessions closed"
        );
        report
    }
}
