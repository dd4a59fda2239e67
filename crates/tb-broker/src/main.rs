//! Target broker daemon
//!
//! Serves the REST API for allocation, power and console control of the
//! configured test targets.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tb_broker::allocation::{run_expiry_reaper, AllocationEvent};
use tb_broker::supervisor::{run_liveness, SupervisorNotifier};
use tb_broker::{rest, BrokerState};
use tb_core::config::{self, BrokerConfig};

#[derive(Parser)]
#[command(name = "tb-broker")]
#[command(about = "Test-target broker daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "TB_BROKER_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Target broker starting...");

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        config::load_broker_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_broker_config(&default_path)
                .with_context(|| format!("Failed to load config from {:?}", default_path))?
        } else {
            tracing::info!("Using default configuration");
            BrokerConfig::default()
        }
    };

    let bind_addr = args.bind.unwrap_or_else(|| config.bind_address.clone());
    if config.principals.is_empty() {
        tracing::warn!("No principals configured - all requests will be rejected");
    }
    tracing::info!("Loaded {} targets", config.targets.len());

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        cancel_clone.cancel();
    });

    let state = Arc::new(BrokerState::new(config, cancel.clone()));
    state.consoles.start().await;

    // Log allocation lifecycle events
    let mut events = state.allocations.subscribe();
    let events_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => log_allocation_event(&event),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::debug!("Allocation event log lagged by {} events", missed);
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = events_cancel.cancelled() => break,
            }
        }
    });

    // Background tasks
    let reaper = tokio::spawn(run_expiry_reaper(
        Arc::clone(&state.allocations),
        state.config.reaper_interval,
        cancel.clone(),
    ));

    let notifier = Arc::new(SupervisorNotifier::from_env());
    let liveness = tokio::spawn(run_liveness(
        Arc::clone(&notifier),
        state.config.liveness_interval,
        cancel.clone(),
    ));

    let server = {
        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        let bind_addr = bind_addr.clone();
        tokio::spawn(async move { rest::serve(state, &bind_addr, cancel).await })
    };

    notifier.ready();
    tracing::info!("Target broker ready on {}", bind_addr);

    let served = server.await.context("REST server task panicked")?;
    // Stop background tasks even if the server failed on its own
    cancel.cancel();
    notifier.stopping();

    let _ = tokio::join!(reaper, liveness);
    served.with_context(|| format!("REST server on {} failed", bind_addr))?;

    tracing::info!("Target broker shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}

fn log_allocation_event(event: &AllocationEvent) {
    match event {
        AllocationEvent::Granted { id, owner } => {
            tracing::debug!(allocation = %id, owner = %owner, "Event: granted");
        }
        AllocationEvent::Queued { id, position } => {
            tracing::debug!(allocation = %id, position, "Event: queued");
        }
        AllocationEvent::Promoted { id } => {
            tracing::debug!(allocation = %id, "Event: promoted");
        }
        AllocationEvent::Released { id, forced } => {
            tracing::debug!(allocation = %id, forced, "Event: released");
        }
        AllocationEvent::Expired { id } => {
            tracing::debug!(allocation = %id, "Event: expired");
        }
    }
}
