//! Console routes

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::{HeaderName, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use tb_core::{BrokerError, TargetId};

use super::auth::Caller;
use super::error::ApiResult;
use crate::console::ConsoleInfo;
use crate::state::BrokerState;

/// Header carrying `"<generation> <size>"` of the stream
pub const GEN_OFFSET_HEADER: HeaderName = HeaderName::from_static("x-stream-gen-offset");
/// Header carrying the stream's byte count
pub const SIZE_HEADER: HeaderName = HeaderName::from_static("x-stream-size");
/// Header carrying the offset the payload starts at
pub const OFFSET_HEADER: HeaderName = HeaderName::from_static("x-stream-offset");

#[derive(Debug, Default, Deserialize)]
pub struct ConsoleQuery {
    pub component: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReadQuery {
    pub component: Option<String>,
    /// Kept as text so negative or malformed offsets are reported as
    /// invalid input rather than a generic query rejection
    pub offset: Option<String>,
    /// Generation the offset belongs to
    pub generation: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WriteQuery {
    pub component: Option<String>,
    /// Input given inline instead of in the body
    pub data: Option<String>,
}

fn parse_offset(offset: Option<&str>) -> Result<u64, BrokerError> {
    match offset {
        None => Ok(0),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| BrokerError::InvalidInput(format!("invalid console offset '{}'", raw))),
    }
}

fn console_name(
    state: &BrokerState,
    target: &TargetId,
    component: Option<String>,
) -> Result<String, BrokerError> {
    match component {
        Some(name) if !name.is_empty() => Ok(name),
        _ => state.consoles.default_console(target),
    }
}

pub async fn read(
    State(state): State<Arc<BrokerState>>,
    Caller(principal): Caller,
    Path(id): Path<String>,
    Query(query): Query<ReadQuery>,
) -> ApiResult<Response> {
    let target = TargetId::new(id);
    let offset = parse_offset(query.offset.as_deref())?;
    let console = console_name(&state, &target, query.component)?;
    state.allocations.check_access(&target, &principal)?;

    let chunk = state
        .consoles
        .read(&target, &console, offset, query.generation)?;
    Ok((
        [
            (CONTENT_TYPE, "application/octet-stream".to_string()),
            (GEN_OFFSET_HEADER, chunk.position()),
            (SIZE_HEADER, chunk.size.to_string()),
            (OFFSET_HEADER, chunk.offset.to_string()),
        ],
        chunk.data,
    )
        .into_response())
}

pub async fn write(
    State(state): State<Arc<BrokerState>>,
    Caller(principal): Caller,
    Path(id): Path<String>,
    Query(query): Query<WriteQuery>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let target = TargetId::new(id);
    let console = console_name(&state, &target, query.component)?;
    state.allocations.check_access(&target, &principal)?;

    let data = match query.data {
        Some(inline) => Bytes::from(inline),
        None => body,
    };
    state.consoles.write(&target, &console, &data).await?;
    Ok(Json(json!({ "written": data.len() })))
}

pub async fn enable(
    State(state): State<Arc<BrokerState>>,
    Caller(principal): Caller,
    Path(id): Path<String>,
    Query(query): Query<ConsoleQuery>,
) -> ApiResult<Json<Value>> {
    let target = TargetId::new(id);
    let console = console_name(&state, &target, query.component)?;
    state.allocations.check_access(&target, &principal)?;

    let generation = state.consoles.enable(&target, &console).await?;
    Ok(Json(json!({ "console": console, "generation": generation })))
}

pub async fn disable(
    State(state): State<Arc<BrokerState>>,
    Caller(principal): Caller,
    Path(id): Path<String>,
    Query(query): Query<ConsoleQuery>,
) -> ApiResult<Json<Value>> {
    let target = TargetId::new(id);
    let console = console_name(&state, &target, query.component)?;
    state.allocations.check_access(&target, &principal)?;

    state.consoles.disable(&target, &console).await?;
    Ok(Json(json!({ "console": console })))
}

pub async fn list(
    State(state): State<Arc<BrokerState>>,
    Caller(_): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<ConsoleInfo>>> {
    Ok(Json(state.consoles.list(&TargetId::new(id))?))
}

pub async fn size(
    State(state): State<Arc<BrokerState>>,
    Caller(_): Caller,
    Path(id): Path<String>,
    Query(query): Query<ConsoleQuery>,
) -> ApiResult<Json<Value>> {
    let target = TargetId::new(id);
    let console = console_name(&state, &target, query.component)?;
    let body = match state.consoles.size(&target, &console)? {
        Some((generation, size)) => json!({
            "console": console,
            "enabled": true,
            "generation": generation,
            "size": size,
        }),
        None => json!({ "console": console, "enabled": false }),
    };
    Ok(Json(body))
}
