//! Wraps the external process whose stdout lines are a service's logs.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::ProcessLaunchError;

/// A running log command. Lines arrive on the receiver returned by
/// [`ProcessLogSource::spawn`]; the receiver yields `None` once stdout closes.
pub struct ProcessLogSource {
    program: String,
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
}

impl ProcessLogSource {
    pub fn spawn(
        log_command: &str,
        buffer: usize,
    ) -> Result<(Self, mpsc::Receiver<String>), ProcessLaunchError> {
        let (program, args) = split_command(log_command)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| ProcessLaunchError::Spawn {
            program: program.to_string(),
            source,
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProcessLaunchError::MissingStdout(program.to_string()))?;

        debug!(program, pid = ?child.id(), "log command started");

        let (tx, rx) = mpsc::channel(buffer.max(1));
        let reader = tokio::spawn(forward_lines(program.to_string(), stdout, tx));

        Ok((
            Self {
                program: program.to_string(),
                child: Some(child),
                reader: Some(reader),
            },
            rx,
        ))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn is_terminated(&self) -> bool {
        self.child.is_none()
    }

    /// Kills the process if it is still running and reaps it. Idempotent.
    pub async fn terminate(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        let Some(mut child) = self.child.take() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(program = %self.program, %status, "log command already exited");
            }
            Ok(None) | Err(_) => {
                if let Err(err) = child.kill().await {
                    warn!(program = %self.program, error = %err, "failed to kill log command");
                } else {
                    debug!(program = %self.program, "log command terminated");
                }
            }
        }
    }
}

/// Invalid UTF-8 is replaced rather than ending the stream.
async fn forward_lines(program: String, stdout: ChildStdout, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                debug!(program = %program, "log command closed stdout");
                break;
            }
            Ok(_) => {
                let decoded = String::from_utf8_lossy(&buf);
                let line = decoded.trim_end_matches(|c: char| c == '\n' || c == '\r');
                if line.is_empty() {
                    continue;
                }
                trace!(program = %program, len = line.len(), "log line");
                if tx.send(line.to_string()).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(program = %program, error = %err, "failed reading log command output");
                break;
            }
        }
    }
}

/// Splits a shell-style command line on whitespace. No quoting rules apply.
pub fn split_command(log_command: &str) -> Result<(&str, Vec<&str>), ProcessLaunchError> {
    let mut parts = log_command.split_whitespace();
    let program = parts.next().ok_or(ProcessLaunchError::EmptyCommand)?;
    Ok((program, parts.collect()))
}
