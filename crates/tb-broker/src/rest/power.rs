//! Power rail routes

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use tb_core::types::{ComponentSelector, PowerAction};
use tb_core::{ErrorKind, TargetId};

use super::auth::Caller;
use super::error::ApiResult;
use crate::power::{OutcomeStatus, PowerList, PowerReport, SequenceStep};
use crate::state::BrokerState;

#[derive(Debug, Default, Deserialize)]
pub struct ComponentQuery {
    pub component: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SequenceRequest {
    /// Steps such as `"off:all"`, `"wait:2"`, `"on:full"`
    pub steps: Vec<String>,
}

/// Message describing why a report failed
fn failure_message(report: &PowerReport) -> Option<String> {
    let component = report.failed.as_deref()?;
    let reason = report
        .outcomes
        .iter()
        .find_map(|o| match &o.status {
            OutcomeStatus::Failed { reason } if o.component == component => Some(reason.as_str()),
            _ => None,
        })
        .unwrap_or("unknown error");
    Some(format!(
        "power {} failed on {}/{}: {}",
        report.action, report.target, component, reason
    ))
}

/// Successful reports are 200; a failed driver turns the whole response
/// into a 502 that still carries the per-component report
fn report_response<T: serde::Serialize>(body: T, failure: Option<String>) -> Response {
    match failure {
        None => Json(body).into_response(),
        Some(message) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({
                "kind": ErrorKind::DriverFailure,
                "message": message,
                "report": body,
            })),
        )
            .into_response(),
    }
}

pub async fn apply(
    State(state): State<Arc<BrokerState>>,
    Caller(principal): Caller,
    Path((id, action)): Path<(String, String)>,
    Query(query): Query<ComponentQuery>,
) -> ApiResult<Response> {
    let target = TargetId::new(id);
    let action: PowerAction = action.parse()?;
    state.allocations.check_access(&target, &principal)?;

    let selector = ComponentSelector::parse(query.component.as_deref());
    let report = state.power.apply(&target, action, selector).await?;
    let failure = failure_message(&report);
    Ok(report_response(report, failure))
}

pub async fn sequence(
    State(state): State<Arc<BrokerState>>,
    Caller(principal): Caller,
    Path(id): Path<String>,
    Json(request): Json<SequenceRequest>,
) -> ApiResult<Response> {
    let target = TargetId::new(id);
    let steps = request
        .steps
        .iter()
        .map(|step| step.parse::<SequenceStep>())
        .collect::<Result<Vec<_>, _>>()?;
    state.allocations.check_access(&target, &principal)?;

    let report = state.power.sequence(&target, steps).await?;
    let failure = report.reports.last().and_then(failure_message);
    Ok(report_response(report, failure))
}

pub async fn list(
    State(state): State<Arc<BrokerState>>,
    Caller(_): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<PowerList>> {
    Ok(Json(state.power.list(&TargetId::new(id)).await?))
}
