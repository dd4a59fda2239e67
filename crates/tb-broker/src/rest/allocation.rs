//! Allocation routes

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use tb_core::{AllocationId, BrokerError};

use super::auth::Caller;
use super::error::ApiResult;
use crate::allocation::{AcquireOutcome, AllocationInfo, ExpiryPolicy, TargetGroup};
use crate::state::BrokerState;

/// Expiry as clients spell it
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Endtime {
    /// `"never"`/`"static"` or `"idle"`
    Keyword(String),
    /// Absolute Unix time in milliseconds
    At(u64),
}

#[derive(Debug, Deserialize)]
pub struct AcquireRequest {
    pub groups: TargetGroup,
    #[serde(default)]
    pub queue: bool,
    #[serde(default)]
    pub endtime: Option<Endtime>,
    /// Idle timeout in seconds; the broker default when absent
    #[serde(default)]
    pub idle_timeout: Option<u64>,
}

impl AcquireRequest {
    fn expiry(&self, default_idle: Duration) -> Result<ExpiryPolicy, BrokerError> {
        let idle = ExpiryPolicy::Idle {
            timeout: self
                .idle_timeout
                .map(Duration::from_secs)
                .unwrap_or(default_idle),
        };
        match &self.endtime {
            None => Ok(idle),
            Some(Endtime::At(at)) => Ok(ExpiryPolicy::Endtime { at: *at }),
            Some(Endtime::Keyword(word)) => match word.as_str() {
                "never" | "static" => Ok(ExpiryPolicy::Never),
                "idle" => Ok(idle),
                other => Err(BrokerError::InvalidInput(format!(
                    "unknown endtime '{}'",
                    other
                ))),
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ReleaseQuery {
    #[serde(default)]
    pub force: bool,
}

fn parse_id(id: &str) -> Result<AllocationId, BrokerError> {
    id.parse()
}

pub async fn acquire(
    State(state): State<Arc<BrokerState>>,
    Caller(principal): Caller,
    Json(request): Json<AcquireRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let expiry = request.expiry(state.config.default_idle_timeout)?;
    let outcome = state
        .allocations
        .acquire(&principal, request.groups, request.queue, expiry)?;

    Ok(match outcome {
        AcquireOutcome::Granted(id) => (
            StatusCode::OK,
            Json(json!({ "allocid": id.to_string(), "state": "active" })),
        ),
        AcquireOutcome::Queued { id, position } => (
            StatusCode::ACCEPTED,
            Json(json!({
                "allocid": id.to_string(),
                "state": "queued",
                "position": position,
            })),
        ),
    })
}

pub async fn list(
    State(state): State<Arc<BrokerState>>,
    Caller(_): Caller,
) -> Json<Vec<AllocationInfo>> {
    Json(state.allocations.list())
}

pub async fn get(
    State(state): State<Arc<BrokerState>>,
    Caller(_): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<AllocationInfo>> {
    Ok(Json(state.allocations.get(parse_id(&id)?)?))
}

pub async fn release(
    State(state): State<Arc<BrokerState>>,
    Caller(principal): Caller,
    Path(id): Path<String>,
    Query(query): Query<ReleaseQuery>,
) -> ApiResult<Json<Value>> {
    state
        .allocations
        .release(parse_id(&id)?, &principal, query.force)?;
    Ok(Json(json!({})))
}

pub async fn keepalive(
    State(state): State<Arc<BrokerState>>,
    Caller(principal): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.allocations.keepalive(parse_id(&id)?, &principal)?;
    Ok(Json(json!({})))
}

pub async fn guests(
    State(state): State<Arc<BrokerState>>,
    Caller(principal): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<BTreeSet<String>>> {
    Ok(Json(state.allocations.guests(parse_id(&id)?, &principal)?))
}

pub async fn guest_add(
    State(state): State<Arc<BrokerState>>,
    Caller(principal): Caller,
    Path((id, user)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    state
        .allocations
        .guest_add(parse_id(&id)?, &principal, &user)?;
    Ok(Json(json!({})))
}

pub async fn guest_remove(
    State(state): State<Arc<BrokerState>>,
    Caller(principal): Caller,
    Path((id, user)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    state
        .allocations
        .guest_remove(parse_id(&id)?, &principal, &user)?;
    Ok(Json(json!({})))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(body: &str) -> AcquireRequest {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn test_expiry_defaults_to_idle() {
        let req = request(r#"{"groups":{"g":["a"]}}"#);
        assert!(!req.queue);
        assert_eq!(
            req.expiry(Duration::from_secs(300)).unwrap(),
            ExpiryPolicy::Idle {
                timeout: Duration::from_secs(300)
            }
        );
    }

    #[test]
    fn test_expiry_keywords_and_time() {
        let never = request(r#"{"groups":{"g":["a"]},"endtime":"static"}"#);
        assert_eq!(
            never.expiry(Duration::from_secs(1)).unwrap(),
            ExpiryPolicy::Never
        );

        let idle = request(r#"{"groups":{"g":["a"]},"endtime":"idle","idle_timeout":20}"#);
        assert_eq!(
            idle.expiry(Duration::from_secs(1)).unwrap(),
            ExpiryPolicy::Idle {
                timeout: Duration::from_secs(20)
            }
        );

        let at = request(r#"{"groups":{"g":["a"]},"endtime":1700000000000}"#);
        assert_eq!(
            at.expiry(Duration::from_secs(1)).unwrap(),
            ExpiryPolicy::Endtime { at: 1_700_000_000_000 }
        );
    }

    #[test]
    fn test_unknown_endtime_rejected() {
        let req = request(r#"{"groups":{"g":["a"]},"endtime":"tomorrow"}"#);
        assert!(matches!(
            req.expiry(Duration::from_secs(1)),
            Err(BrokerError::InvalidInput(_))
        ));
    }
}
