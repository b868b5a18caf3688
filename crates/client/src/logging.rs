//! File logging for the `chatsync` binary.
//!
//! Everything is driven by environment variables so a misbehaving sync can
//! be re-run with a different filter or format without touching config.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,reqwest=warn,hyper=warn";
const LOG_FILE: &str = "client.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        }
    }
}

/// Logging options resolved from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub dir: PathBuf,
    pub filter: String,
    pub format: LogFormat,
    pub truncate: bool,
    pub run_id: String,
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::resolve(|key| std::env::var(key).ok())
    }

    /// `CHATSYNC_LOG_FILTER` wins over `RUST_LOG`. Empty values count as unset.
    fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let dir = get("CHATSYNC_LOG_DIR").map(PathBuf::from).unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(".chatsync")
                .join("logs")
        });
        let filter = get("CHATSYNC_LOG_FILTER")
            .or_else(|| get("RUST_LOG"))
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        let run_id = get("CHATSYNC_RUN_ID").unwrap_or_else(|| {
            let millis = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0);
            format!("pid-{}-{}", std::process::id(), millis)
        });

        Self {
            dir,
            filter,
            format: LogFormat::parse(get("CHATSYNC_LOG_FORMAT").as_deref()),
            truncate: get("CHATSYNC_TRUNCATE_LOG_ON_START").as_deref() == Some("1"),
            run_id,
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }
}

pub struct LoggingHandle {
    pub run_id: String,
    pub log_path: PathBuf,
    pub guard: WorkerGuard,
}

pub fn init_logging() -> anyhow::Result<LoggingHandle> {
    let settings = LogSettings::from_env();
    std::fs::create_dir_all(&settings.dir)?;
    let log_path = settings.log_path();

    if settings.truncate {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&log_path)?;
    }

    // A bad directive should not cost us the log
    let filter = EnvFilter::try_new(&settings.filter)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&settings.dir, LOG_FILE));

    let registry = tracing_subscriber::registry().with(filter);
    match settings.format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .pretty()
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_current_span(true),
            )
            .try_init()?,
    }

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        run_id = %settings.run_id,
        log_path = %log_path.display(),
        format = settings.format.as_str(),
        filter = %settings.filter,
    );

    Ok(LoggingHandle {
        run_id: settings.run_id,
        log_path,
        guard,
    })
}
