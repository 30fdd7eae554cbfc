//! # Valet — personal assistant backend
//!
//! Routes chat messages to specialized handlers, keeps scheduled work
//! durable across restarts, and pushes notifications to connected clients.
//!
//! Usage:
//!   valet                          # Start with ~/.valet/config.toml (or defaults)
//!   valet --config ./valet.toml    # Explicit config file
//!   valet --port 9000              # Override the gateway port
//!   valet --polling                # Use the polling timer strategy

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use valet_bots::{CentralController, ChatHandler, ProactiveHandler, ReminderHandler};
use valet_core::config::TimerStrategy;
use valet_core::{HandlerRegistry, ValetConfig};
use valet_gateway::AppState;
use valet_notify::{NotificationPipeline, SessionManager};
use valet_scheduler::SchedulerEngine;
use valet_store::{MessageStore, NotificationStore, TaskStore, ValetDb};

#[derive(Parser)]
#[command(name = "valet", version, about = "🛎️ Valet — personal assistant backend")]
struct Cli {
    /// Config file path (default: ~/.valet/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the gateway port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the database path
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Use the polling timer strategy instead of per-task timers
    #[arg(long)]
    polling: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "valet=debug,tower_http=debug"
    } else {
        "valet=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => ValetConfig::load_from(path)?,
        None => ValetConfig::load()?,
    };
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }
    if let Some(db_path) = &cli.db_path {
        config.database.path = db_path.to_string_lossy().into_owned();
    }
    if cli.polling {
        config.scheduler.strategy = TimerStrategy::Polling;
    }

    let db = ValetDb::open(std::path::Path::new(&config.database.path))?;
    let sessions = Arc::new(SessionManager::new());
    let pipeline = Arc::new(NotificationPipeline::new(
        NotificationStore::new(db.clone()),
        sessions.clone(),
    ));

    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(ReminderHandler::new()));
    registry.register(Arc::new(ProactiveHandler::new()));
    registry.register(Arc::new(ChatHandler::new()));
    let registry = Arc::new(registry);

    let engine = Arc::new(SchedulerEngine::new(
        TaskStore::new(db.clone()),
        registry.clone(),
        pipeline.clone(),
        config.scheduler.clone(),
    ));
    pipeline.set_scheduler(engine.clone());
    engine.start().await?;

    let messages = MessageStore::new(db);
    let controller = Arc::new(CentralController::new(
        registry,
        messages.clone(),
        pipeline.clone(),
        engine.clone(),
    ));

    let state = AppState {
        controller,
        engine: engine.clone(),
        pipeline,
        sessions,
        messages,
        start_time: std::time::Instant::now(),
    };

    valet_gateway::run(&config.gateway, state).await?;

    engine.shutdown();
    Ok(())
}
