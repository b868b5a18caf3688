//! chatsync binary
//!
//! Mirrors one backend session and logs what the engine reports.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use chatsync::config::NotificationMode;
use chatsync::logging::init_logging;
use chatsync::{SyncConfig, SyncEngine, SyncUpdate};

#[derive(Parser)]
#[command(name = "chatsync")]
#[command(about = "Keep a local view of an assistant chat session in sync", long_about = None)]
struct Cli {
    /// Backend base URL
    #[arg(long, env = "CHATSYNC_URL", default_value = "http://127.0.0.1:4096")]
    url: String,

    /// Session to mirror
    #[arg(long)]
    session: Option<String>,

    /// Only accept events for this project directory
    #[arg(long)]
    directory: Option<String>,

    /// Config file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Only notify while hidden
    #[arg(long)]
    hidden_notifications: bool,
}

fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let path = cli.config.clone().or_else(SyncConfig::default_path);
    let mut config = match path {
        Some(path) => SyncConfig::load(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => SyncConfig::default(),
    };
    if cli.hidden_notifications {
        config.notifications.mode = NotificationMode::Hidden;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let logging = init_logging()?;
    let config = load_config(&cli)?;

    info!(
        component = "main",
        event = "main.starting",
        run_id = %logging.run_id,
        url = %cli.url,
        session_id = cli.session.as_deref(),
        "Starting chatsync"
    );
    eprintln!("chatsync: logging to {}", logging.log_path.display());

    let handle = SyncEngine::connect(config, &cli.url, cli.directory.clone())?;
    let mut updates = handle.subscribe();
    handle
        .switch_session(cli.session.clone(), cli.directory.clone())
        .await?;
    handle.start(true).await?;

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => report(&update),
                Err(RecvError::Lagged(skipped)) => warn!(
                    component = "main",
                    event = "main.updates.lagged",
                    skipped,
                    "Update stream lagged"
                ),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!(component = "main", event = "main.shutdown", "Ctrl-C received");
                break;
            }
        }
    }

    handle.shutdown().await?;
    Ok(())
}

fn report(update: &SyncUpdate) {
    match update {
        SyncUpdate::StatusChanged { status, hint } => {
            eprintln!(
                "status: {}{}",
                status.as_str(),
                hint.as_deref().map(|h| format!(" ({h})")).unwrap_or_default()
            );
        }
        SyncUpdate::PhaseChanged { phase } => eprintln!("activity: {phase:?}"),
        SyncUpdate::Notification { notification } => {
            eprintln!("notify: {}: {}", notification.title, notification.body)
        }
        SyncUpdate::Toast { toast } => eprintln!("toast: {}", toast.text),
        SyncUpdate::Todos { .. } | SyncUpdate::SessionChanged { .. } => {}
    }
    if let Ok(line) = serde_json::to_string(update) {
        info!(
            component = "main",
            event = "main.update",
            update = %line,
            "Engine update"
        );
    }
}
