use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::ConfigError;

pub const ACCESS_TOKEN_VAR: &str = "ACCESS_TOKEN";
pub const CLIENT_ID_VAR: &str = "CLIENT_ID";

pub const DEFAULT_API_HOST: &str = "api.driplet.tk";
pub const DEFAULT_RELAY_HOST: &str = "ws.driplet.tk";
pub const DEFAULT_HEARTBEAT_MS: u64 = 1_000;
pub const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_LOG_BUFFER: usize = 256;

/// Identity presented to discovery and to the relay. Read once at startup.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub auth_token: String,
    pub user_id: String,
}

impl Credentials {
    pub fn new(auth_token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            auth_token: auth_token.into(),
            user_id: user_id.into(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Blank values count as missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &'static str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or(ConfigError::MissingVar(key))
        };
        Ok(Self {
            auth_token: read(ACCESS_TOKEN_VAR)?,
            user_id: read(CLIENT_ID_VAR)?,
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("auth_token", &"<redacted>")
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Runtime knobs shared by every session.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub api_host: String,
    pub relay_host: String,
    pub heartbeat_interval: Duration,
    pub dial_timeout: Duration,
    pub max_concurrent_sessions: Option<NonZeroUsize>,
    pub log_buffer: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_host: DEFAULT_API_HOST.to_string(),
            relay_host: DEFAULT_RELAY_HOST.to_string(),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_MS),
            dial_timeout: Duration::from_secs(DEFAULT_DIAL_TIMEOUT_SECS),
            max_concurrent_sessions: None,
            log_buffer: DEFAULT_LOG_BUFFER,
        }
    }
}

/// Loads `path` into the process environment, or `./.env` when no path is
/// given. Only an explicitly requested file is required to exist.
pub fn load_env_file(path: Option<&Path>) -> Result<Option<PathBuf>, ConfigError> {
    match path {
        Some(path) => {
            dotenvy::from_path(path).map_err(|source| ConfigError::EnvFile {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(Some(path.to_path_buf()))
        }
        None => match dotenvy::dotenv() {
            Ok(found) => Ok(Some(found)),
            Err(err) if err.not_found() => {
                debug!("no .env file found; using process environment only");
                Ok(None)
            }
            Err(source) => Err(ConfigError::EnvFile {
                path: PathBuf::from(".env"),
                source,
            }),
        },
    }
}
