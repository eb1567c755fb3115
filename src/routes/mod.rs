//! HTTP surface: the OpenAI-compatible endpoints, analytics, and health.

mod analytics;
pub mod execution;
mod health;

use std::time::Instant;

use axum::{
    Extension, Json, Router,
    extract::{State, rejection::JsonRejection},
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use uuid::Uuid;
use validator::Validate;

use crate::{
    AppState,
    api_types::{CreateChatCompletionPayload, CreateCompletionPayload, CreateEmbeddingPayload},
    canonical::{self, CanonicalRequest, Endpoint},
    error::ApiError,
    middleware::{AuthenticatedProject, auth_middleware},
    observability::metrics,
};

/// Assemble the full router.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/analytics/summary", get(analytics::summary))
        .route("/v1/analytics/projects/{project_id}", get(analytics::project))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(RequestBodyLimitLayer::new(
            state.config.server.request_body_limit_bytes,
        ));

    let router = Router::new()
        .merge(api)
        .route("/health", get(health::health));

    #[cfg(feature = "prometheus")]
    let router = router.route("/metrics", get(health::prometheus_metrics));

    router
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn chat_completions(
    State(state): State<AppState>,
    Extension(AuthenticatedProject(project)): Extension<AuthenticatedProject>,
    payload: Result<Json<CreateChatCompletionPayload>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    run_endpoint(state, project, Endpoint::Chat, started, move |state| {
        let Json(payload) = payload.map_err(|e| ApiError::bad_request(e.to_string()))?;
        payload
            .validate()
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
        canonical::canonicalize_chat(payload, state.config.server.request_body_limit_bytes)
    })
    .await
}

async fn completions(
    State(state): State<AppState>,
    Extension(AuthenticatedProject(project)): Extension<AuthenticatedProject>,
    payload: Result<Json<CreateCompletionPayload>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    run_endpoint(state, project, Endpoint::Completions, started, move |state| {
        let Json(payload) = payload.map_err(|e| ApiError::bad_request(e.to_string()))?;
        payload
            .validate()
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
        canonical::canonicalize_completion(payload, state.config.server.request_body_limit_bytes)
    })
    .await
}

async fn embeddings(
    State(state): State<AppState>,
    Extension(AuthenticatedProject(project)): Extension<AuthenticatedProject>,
    payload: Result<Json<CreateEmbeddingPayload>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    run_endpoint(state, project, Endpoint::Embeddings, started, move |state| {
        let Json(payload) = payload.map_err(|e| ApiError::bad_request(e.to_string()))?;
        payload
            .validate()
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
        canonical::canonicalize_embedding(payload, state.config.server.request_body_limit_bytes)
    })
    .await
}

/// Shared endpoint skeleton: per-minute admission, normalization, then the
/// execution state machine. Failures emit a usage event before rendering
/// the error body.
async fn run_endpoint<F>(
    state: AppState,
    project: std::sync::Arc<crate::registry::Project>,
    endpoint: Endpoint,
    started: Instant,
    normalize: F,
) -> Response
where
    F: FnOnce(&AppState) -> Result<CanonicalRequest, ApiError>,
{
    let request_id = Uuid::new_v4().to_string();

    let result = async {
        state.limiter.check_minute(&project)?;
        let canonical = normalize(&state)?;
        execution::execute(
            state.clone(),
            std::sync::Arc::clone(&project),
            canonical,
            request_id.clone(),
            started,
        )
        .await
    }
    .await;

    let method = "POST";
    let path = match endpoint {
        Endpoint::Chat => "/v1/chat/completions",
        Endpoint::Completions => "/v1/completions",
        Endpoint::Embeddings => "/v1/embeddings",
    };

    match result {
        Ok(response) => {
            metrics::record_http_request(
                method,
                path,
                response.status().as_u16(),
                started.elapsed().as_secs_f64(),
            );
            response
        }
        Err(error) => {
            // Upstream failures already recorded their event inside the
            // state machine; admission and normalization failures record
            // theirs here.
            if matches!(
                error.kind,
                crate::error::ErrorKind::BadRequest | crate::error::ErrorKind::RateLimited
            ) {
                execution::record_failure(
                    &state, &project, endpoint, "", &request_id, started, &error,
                );
            }
            let response = error.into_response();
            metrics::record_http_request(
                method,
                path,
                response.status().as_u16(),
                started.elapsed().as_secs_f64(),
            );
            response
        }
    }
}
