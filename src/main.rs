mod commands;
mod config;
mod poller;
mod scheduler;
mod server;
mod store;
mod tasks;
mod telegram;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::poller::Poller;
use crate::scheduler::Scheduler;
use crate::server::AppState;
use crate::store::UserStore;
use crate::tasks::TaskQueue;
use crate::telegram::Notifier;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relaybot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    info!("Configuration loaded successfully");
    info!("  Authorized chat: {}", config.authorized_chat_id);
    info!("  Port: {}", config.port);
    info!("  Store credentials: {}", if config.store.is_some() { "present" } else { "absent" });

    // A missing or invalid store leaves commands degraded, never stops startup.
    let store = Arc::new(UserStore::new(config.store));
    let notifier = Arc::new(Notifier::new(
        config.bot_token,
        config.authorized_chat_id.clone(),
    ));

    // Start the new-user poller
    let scheduler = Scheduler::new().await?;
    let poller = Arc::new(Poller::new(Arc::clone(&store), Arc::clone(&notifier)));
    poller.register(&scheduler).await?;
    scheduler.start().await?;

    // Serve the webhook endpoints
    let state = AppState {
        store,
        notifier,
        authorized_chat: config.authorized_chat_id,
        tasks: TaskQueue::detached(),
    };
    let app = server::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    info!("Server running on port {}", config.port);
    info!("  Webhook endpoint:  POST /telegram");
    info!("  Health check:      GET /health");
    info!("  Webhook setup:     GET /setup-webhook?url=<public-url>");

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
