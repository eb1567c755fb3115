//! Read-only aggregate reporting.
//!
//! These views surface the in-process rollups the telemetry layer keeps;
//! durable, historical analytics live downstream of the telemetry sink and
//! are out of the proxy's hands.

use axum::{
    Extension, Json,
    extract::{Path, State},
    response::{IntoResponse, Response},
};

use crate::{
    AppState, error::ApiError, middleware::AuthenticatedProject,
    pricing::microcents_to_dollars, telemetry::ProjectAggregate,
};

fn aggregate_json(project_id: &str, aggregate: &ProjectAggregate) -> serde_json::Value {
    let hit_rate = if aggregate.requests > 0 {
        aggregate.cache_hits as f64 / aggregate.requests as f64
    } else {
        0.0
    };
    serde_json::json!({
        "project_id": project_id,
        "requests": aggregate.requests,
        "cache_hits": aggregate.cache_hits,
        "cache_hit_rate": hit_rate,
        "coalesced": aggregate.coalesced,
        "errors": aggregate.errors,
        "tokens_in": aggregate.tokens_in,
        "tokens_out": aggregate.tokens_out,
        "cost_usd": microcents_to_dollars(aggregate.cost_microcents as i64),
        "saved_usd": microcents_to_dollars(aggregate.saved_microcents as i64),
    })
}

/// `GET /v1/analytics/summary`: the calling project's rollup.
pub async fn summary(
    State(state): State<AppState>,
    Extension(AuthenticatedProject(project)): Extension<AuthenticatedProject>,
) -> Response {
    let aggregate = state
        .telemetry
        .project_aggregate(&project.id)
        .unwrap_or_default();
    Json(aggregate_json(&project.id, &aggregate)).into_response()
}

/// `GET /v1/analytics/projects/{project_id}`: a specific project's rollup.
/// A project can only read its own numbers.
pub async fn project(
    State(state): State<AppState>,
    Extension(AuthenticatedProject(project)): Extension<AuthenticatedProject>,
    Path(project_id): Path<String>,
) -> Response {
    if project.id != project_id {
        return ApiError::forbidden("analytics are scoped to the authenticated project")
            .into_response();
    }

    let aggregate = state
        .telemetry
        .project_aggregate(&project_id)
        .unwrap_or_default();
    Json(aggregate_json(&project_id, &aggregate)).into_response()
}
