fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .ok()
}

pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    pub const FILTER_VAR: &str = "DRIPLET_LOG_FILTER";
    pub const TRACE_DEPS_VAR: &str = "DRIPLET_TRACE_DEPS";

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        Warn,
        #[default]
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }

        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static INIT: OnceLock<()> = OnceLock::new();
    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if INIT.get().is_some() {
            return Ok(());
        }

        let env_filter = EnvFilter::new(filter_directives(config.level));

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_level(true)
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_ids(config.level >= LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = GUARD.set(guard);
        INIT.set(()).ok();
        Ok(())
    }

    /// `DRIPLET_LOG_FILTER` wins over the level-derived defaults.
    pub fn filter_directives(level: LogLevel) -> String {
        if let Ok(filter) = std::env::var(FILTER_VAR) {
            return filter;
        }
        default_filter_for(level, allow_dependency_traces())
    }

    const NOISY_DEP_TARGETS: &[&str] = &[
        "hyper",
        "hyper_util",
        "tokio_tungstenite",
        "tungstenite",
        "reqwest",
        "rustls",
        "mio",
        "h2",
    ];

    fn default_filter_for(level: LogLevel, allow_deps: bool) -> String {
        let mut filter = match level {
            LogLevel::Trace => "info,driplet_agent=trace,driplet_proto=trace".to_owned(),
            LogLevel::Debug => "info,driplet_agent=debug,driplet_proto=debug".to_owned(),
            other => other.as_str().to_owned(),
        };
        if level == LogLevel::Trace && !allow_deps {
            for target in NOISY_DEP_TARGETS {
                filter.push(',');
                filter.push_str(target);
                filter.push_str("=info");
            }
        }
        filter
    }

    fn allow_dependency_traces() -> bool {
        super::env_truthy(TRACE_DEPS_VAR).unwrap_or(false)
    }

}
