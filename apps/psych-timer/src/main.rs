//! Psych Timer server.
//!
//! Run with: cargo run -p psych-timer -- [config.toml] [--debug]
//!
//! The operator page connects to ws://<bind>/ws. Every run writes a
//! MindWare-compatible event log to the configured log directory.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use psych_timer_core::ServerConfig;
use psych_timer_engine::{RunSettings, TimerEngineFactory};
use psych_timer_session::{Dispatcher, SessionRegistry};
use psych_timer_transport::websocket::{GatewayState, create_ws_router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "psych-timer")]
#[command(about = "Drive timed stimulus-presentation runs from a browser")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML). Defaults are used when omitted.
    config: Option<PathBuf>,

    /// Turn on debug messages.
    #[arg(long)]
    debug: bool,

    /// Override the listen address.
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ServerConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => {
            let mut config = ServerConfig::default();
            config.apply_overrides(|key| std::env::var(key).ok());
            config.validate()?;
            config
        }
    };
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }

    // Initialize tracing
    let default_level = if cli.debug { "debug" } else { config.log_level.as_str() };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .init();
    tracing::debug!(?config, "Loaded configuration");

    std::fs::create_dir_all(&config.run.log_dir).with_context(|| {
        format!("Failed to create log directory {}", config.run.log_dir.display())
    })?;

    let registry = Arc::new(SessionRegistry::new(config.session.conflict_policy));
    let (commands, dispatcher) = Dispatcher::channel(Arc::clone(&registry));
    let dispatcher = dispatcher.spawn();

    let factory = TimerEngineFactory::new(RunSettings::from(&config.run));
    let state = GatewayState::new(registry, commands, Arc::new(factory), config.instructions.clone())
        .with_cancel_on_disconnect(config.session.cancel_on_disconnect);

    let app = create_ws_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    tracing::info!("Server listening on ws://{}/ws", config.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Upgraded connections outlive the listener and still hold command senders.
    dispatcher.abort();
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
