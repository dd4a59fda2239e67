//! Target catalog routes

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use tb_core::{BrokerError, TargetId};

use super::auth::Caller;
use super::error::ApiResult;
use crate::registry::TargetInfo;
use crate::state::BrokerState;

/// Target description plus who owns it right now
fn describe(state: &BrokerState, id: &TargetId) -> ApiResult<Value> {
    let info: TargetInfo = state.registry.get(id)?.info();
    let owner = state.allocations.owner_of(id)?;
    let mut value = serde_json::to_value(info)
        .map_err(|e| BrokerError::InvariantViolation(format!("unserializable target: {}", e)))?;
    if let Value::Object(map) = &mut value {
        map.insert(
            "allocation".into(),
            owner.map_or(Value::Null, |id| Value::String(id.to_string())),
        );
    }
    Ok(value)
}

pub async fn list_targets(
    State(state): State<Arc<BrokerState>>,
    Caller(_): Caller,
) -> ApiResult<Json<Vec<Value>>> {
    let targets = state
        .registry
        .ids()
        .map(|id| describe(&state, id))
        .collect::<ApiResult<Vec<_>>>()?;
    Ok(Json(targets))
}

pub async fn get_target(
    State(state): State<Arc<BrokerState>>,
    Caller(_): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(describe(&state, &TargetId::new(id))?))
}

pub async fn enable_target(
    State(state): State<Arc<BrokerState>>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    caller.require_admin()?;
    state.registry.set_enabled(&TargetId::new(id), true)?;
    Ok(Json(json!({})))
}

pub async fn disable_target(
    State(state): State<Arc<BrokerState>>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    caller.require_admin()?;
    state.registry.set_enabled(&TargetId::new(id), false)?;
    Ok(Json(json!({})))
}

pub async fn get_properties(
    State(state): State<Arc<BrokerState>>,
    Caller(_): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<BTreeMap<String, Value>>> {
    Ok(Json(state.registry.properties(&TargetId::new(id))?))
}

/// Only principals holding the target may change its properties
pub async fn patch_properties(
    State(state): State<Arc<BrokerState>>,
    Caller(principal): Caller,
    Path(id): Path<String>,
    Json(updates): Json<BTreeMap<String, Value>>,
) -> ApiResult<Json<BTreeMap<String, Value>>> {
    let target = TargetId::new(id);
    state.allocations.check_access(&target, &principal)?;
    Ok(Json(state.registry.set_properties(&target, updates)?))
}
