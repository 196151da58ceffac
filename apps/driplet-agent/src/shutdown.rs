//! Process-wide shutdown: one interrupt listener, one cancellation token,
//! cloned into every session.

use std::future::Future;
use std::io;

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for one session. Cancelled exactly when the coordinator is.
    pub fn subscribe(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Registers for ctrl-c once. The listener exits when the signal arrives
    /// or when shutdown is triggered some other way.
    pub fn listen_for_interrupt(&self) -> JoinHandle<()> {
        tokio::spawn(cancel_on_interrupt(self.token.clone(), signal::ctrl_c()))
    }
}

/// If the handler cannot be installed the sessions keep running and only a
/// programmatic trigger stops them.
async fn cancel_on_interrupt<F>(token: CancellationToken, interrupt: F)
where
    F: Future<Output = io::Result<()>>,
{
    tokio::select! {
        result = interrupt => match result {
            Ok(()) => {
                info!("interrupt received; closing all sessions");
                token.cancel();
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for interrupt; ctrl-c will not stop the agent");
                token.cancelled().await;
            }
        },
        _ = token.cancelled() => {}
    }
}
