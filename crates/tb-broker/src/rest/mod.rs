//! REST boundary
//!
//! Thin adapter from HTTP verbs to broker operations. Handlers
//! authenticate the caller, check access for target-scoped calls and map
//! `BrokerError` kinds to status codes; they hold no state of their own.

pub mod allocation;
pub mod auth;
pub mod console;
pub mod error;
pub mod power;
pub mod targets;

use std::sync::Arc;

use axum::routing::{get, patch, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::state::BrokerState;

pub use error::{ApiError, ApiResult, ErrorBody};

/// Build the broker's HTTP router
pub fn router(state: Arc<BrokerState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/allocation",
            put(allocation::acquire).get(allocation::list),
        )
        .route(
            "/allocation/:id",
            get(allocation::get).delete(allocation::release),
        )
        .route("/allocation/:id/keepalive", put(allocation::keepalive))
        .route("/allocation/:id/guests", get(allocation::guests))
        .route(
            "/allocation/:id/:user",
            patch(allocation::guest_add).delete(allocation::guest_remove),
        )
        .route("/targets", get(targets::list_targets))
        .route("/targets/:id", get(targets::get_target))
        .route("/targets/:id/enable", put(targets::enable_target))
        .route("/targets/:id/disable", put(targets::disable_target))
        .route(
            "/targets/:id/properties",
            get(targets::get_properties).patch(targets::patch_properties),
        )
        .route("/targets/:id/power/list", get(power::list))
        .route("/targets/:id/power/sequence", put(power::sequence))
        .route("/targets/:id/power/:action", put(power::apply))
        .route("/targets/:id/console/read", get(console::read))
        .route("/targets/:id/console/write", put(console::write))
        .route("/targets/:id/console/enable", put(console::enable))
        .route("/targets/:id/console/disable", put(console::disable))
        .route("/targets/:id/console/list", get(console::list))
        .route("/targets/:id/console/size", get(console::size))
        .with_state(state)
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Serve the REST API on `bind` until `cancel` fires
pub async fn serve(
    state: Arc<BrokerState>,
    bind: &str,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    tracing::info!("REST API listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
