mod cache;
mod commands;
mod config;
mod context;
mod errors;
mod forward;
mod message;
mod pipeline;
mod platform;
mod responder;
mod scheduler;
mod session;
mod store;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::builtin::register_builtins;
use crate::commands::CommandRegistry;
use crate::config::Config;
use crate::context::BotContext;
use crate::pipeline::Pipeline;
use crate::platform::console::ConsoleTransport;
use crate::responder::CannedReply;
use crate::scheduler::Scheduler;
use crate::session::Session;
use crate::store::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,wabot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Prefix: {}", config.bot.prefix);
    info!("  Sudo users: {}", config.bot.sudo.len());
    info!("  Concurrency limit: {}", config.bot.concurrency_limit);
    info!(
        "  Status auto-view/react: {}/{}",
        config.status.auto_view, config.status.auto_react
    );

    let store = SqliteStore::open(&config.store.database_path)
        .context("Failed to initialize record store")?;

    let transport = Arc::new(ConsoleTransport::new(
        config.session.console_identity.clone(),
        config.session.console_sender.clone(),
    ));
    let reply_source = Arc::new(CannedReply::new(config.auto_responder.reply.clone()));
    let cleanup_cron = config.cache.cleanup_cron.clone();
    let ctx = Arc::new(BotContext::new(config, transport, Arc::new(store)));

    let mut registry = CommandRegistry::new();
    register_builtins(&mut registry);
    if registry.is_empty() {
        warn!("No commands registered");
    }
    info!("Registered {} command(s)", registry.len());

    let (session, events) = Session::new(ctx.clone());
    let mut states = session.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow();
            info!("Session {:?}", state);
        }
    });
    let pipeline = Arc::new(Pipeline::new(ctx, Arc::new(registry), reply_source));

    let mut scheduler = Scheduler::new().await?;
    scheduler::tasks::register_maintenance_tasks(&mut scheduler, pipeline.clone(), &cleanup_cron)
        .await?;
    scheduler.start().await?;

    info!("Bot is starting...");
    let worker = tokio::spawn(pipeline.run(events));

    tokio::select! {
        result = session.run() => {
            if let Err(e) = result {
                error!("Session ended with error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
        }
    }

    session.shutdown().await;
    // Dropping the session closes the event channel; the pipeline drains and exits.
    drop(session);
    if let Err(e) = worker.await {
        error!("Pipeline task failed: {}", e);
    }
    scheduler.shutdown().await?;

    info!("Bot stopped");
    Ok(())
}
