use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Missing or unreadable startup configuration. Fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    MissingVar(&'static str),
    #[error("failed to load env file {path:?}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
}

/// Service discovery failed. Fatal, never retried.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid discovery url {url}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("service list request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("service list is not valid json: {0}")]
    InvalidBody(#[from] serde_json::Error),
}

/// Relay transport failures. Dial-side variants keep a session out of
/// `Streaming`; write-side variants move it to `Closing`.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid relay url {url}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("relay dial failed: {0}")]
    Dial(String),
    #[error("relay dial timed out after {0:?}")]
    DialTimeout(Duration),
    #[error("relay write failed: {0}")]
    Write(String),
    #[error("failed to encode relay frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("relay connection closed")]
    Closed,
}

impl RelayError {
    pub fn is_dial(&self) -> bool {
        matches!(
            self,
            RelayError::InvalidUrl { .. } | RelayError::Dial(_) | RelayError::DialTimeout(_)
        )
    }
}

/// The log-producing process could not be started.
#[derive(Debug, Error)]
pub enum ProcessLaunchError {
    #[error("log command is empty")]
    EmptyCommand,
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("spawned {0} without a stdout pipe")]
    MissingStdout(String),
}

/// Anything that aborts the agent before sessions start.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("relay endpoint is misconfigured: {0}")]
    Relay(#[from] RelayError),
    #[error("failed to initialise logging: {0}")]
    Logging(#[from] crate::telemetry::logging::InitError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn dial_variants_are_classified() {
        assert!(RelayError::Dial("refused".into()).is_dial());
        assert!(RelayError::DialTimeout(Duration::from_secs(1)).is_dial());
        assert!(!RelayError::Write("broken pipe".into()).is_dial());
        assert!(!RelayError::Closed.is_dial());
    }

    #[test_timeout::timeout]
    fn missing_var_names_the_variable() {
        let err = ConfigError::MissingVar("ACCESS_TOKEN");
        assert_eq!(
            err.to_string(),
            "required environment variable ACCESS_TOKEN is not set"
        );
    }
}
