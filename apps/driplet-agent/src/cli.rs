use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};

use crate::config::{
    AgentConfig, DEFAULT_API_HOST, DEFAULT_DIAL_TIMEOUT_SECS, DEFAULT_HEARTBEAT_MS,
    DEFAULT_LOG_BUFFER, DEFAULT_RELAY_HOST,
};
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "driplet-agent",
    about = "Stream service logs and heartbeats to the driplet relay",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "DRIPLET_API_HOST",
        default_value = DEFAULT_API_HOST,
        help = "Discovery API host or base URL"
    )]
    pub api_host: String,

    #[arg(
        long = "addr",
        visible_alias = "relay-host",
        env = "DRIPLET_RELAY_HOST",
        default_value = DEFAULT_RELAY_HOST,
        help = "Relay host (wss:// assumed) or ws:// / wss:// base URL"
    )]
    pub relay_host: String,

    #[arg(
        long = "heartbeat-ms",
        env = "DRIPLET_HEARTBEAT_MS",
        default_value_t = DEFAULT_HEARTBEAT_MS,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Interval between heartbeats in milliseconds"
    )]
    pub heartbeat_ms: u64,

    #[arg(
        long = "dial-timeout-secs",
        env = "DRIPLET_DIAL_TIMEOUT_SECS",
        default_value_t = DEFAULT_DIAL_TIMEOUT_SECS,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Give up on a relay connection attempt after this many seconds"
    )]
    pub dial_timeout_secs: u64,

    #[arg(
        long = "max-sessions",
        env = "DRIPLET_MAX_SESSIONS",
        help = "Run at most this many sessions at once (default: no limit)"
    )]
    pub max_sessions: Option<NonZeroUsize>,

    #[arg(
        long = "env-file",
        value_name = "PATH",
        env = "DRIPLET_ENV_FILE",
        help = "Load credentials from this file instead of ./.env"
    )]
    pub env_file: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "DRIPLET_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "DRIPLET_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

impl Cli {
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            api_host: self.api_host.clone(),
            relay_host: self.relay_host.clone(),
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
            max_concurrent_sessions: self.max_sessions,
            log_buffer: DEFAULT_LOG_BUFFER,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn defaults_match_reference_deployment() {
        let cli = Cli::try_parse_from(["driplet-agent"]).expect("parse");
        let config = cli.agent_config();
        assert_eq!(config.api_host, "api.driplet.tk");
        assert_eq!(config.relay_host, "ws.driplet.tk");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.max_concurrent_sessions, None);
        assert_eq!(cli.logging.level, LogLevel::Info);
    }

    #[test_timeout::timeout]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "driplet-agent",
            "--addr",
            "ws://127.0.0.1:9000",
            "--heartbeat-ms",
            "250",
            "--max-sessions",
            "4",
            "--log-level",
            "debug",
        ])
        .expect("parse");
        let config = cli.agent_config();
        assert_eq!(config.relay_host, "ws://127.0.0.1:9000");
        assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.max_concurrent_sessions, NonZeroUsize::new(4));
        assert_eq!(cli.logging.level, LogLevel::Debug);
    }

    #[test_timeout::timeout]
    fn zero_heartbeat_is_rejected() {
        assert!(Cli::try_parse_from(["driplet-agent", "--heartbeat-ms", "0"]).is_err());
        assert!(Cli::try_parse_from(["driplet-agent", "--max-sessions", "0"]).is_err());
    }
}
