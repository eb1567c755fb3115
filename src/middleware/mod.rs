//! Request middleware: bearer-token authentication.
//!
//! The token identifies a project in the registry. Missing or unknown
//! tokens are 401; a suspended project authenticates but is refused with
//! 403. The resolved project rides in request extensions for the handlers.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::{AppState, error::ApiError, registry::{Project, Registry}};

/// The project resolved from the request's bearer token.
#[derive(Clone)]
pub struct AuthenticatedProject(pub Arc<Project>);

/// Authenticate a request against the registry.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(&request).ok_or_else(ApiError::unauthenticated)?;

    let project = state
        .registry
        .lookup(token)
        .ok_or_else(ApiError::unauthenticated)?;

    if project.suspended {
        return Err(ApiError::forbidden(format!(
            "project {} is suspended",
            project.id
        )));
    }

    request
        .extensions_mut()
        .insert(AuthenticatedProject(project));
    Ok(next.run(request).await)
}

fn bearer_token(request: &Request) -> Option<&str> {
    let header = request
        .headers()
        .get(http::header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    let token = header.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_auth(value: Option<&str>) -> Request {
        let mut builder = http::Request::builder().uri("/v1/chat/completions");
        if let Some(value) = value {
            builder = builder.header(http::header::AUTHORIZATION, value);
        }
        builder.body(axum::body::Body::empty()).unwrap()
    }

    #[test]
    fn extracts_bearer_tokens() {
        assert_eq!(
            bearer_token(&request_with_auth(Some("Bearer wl-abc"))),
            Some("wl-abc")
        );
        assert_eq!(bearer_token(&request_with_auth(Some("Basic dXNlcg=="))), None);
        assert_eq!(bearer_token(&request_with_auth(Some("Bearer "))), None);
        assert_eq!(bearer_token(&request_with_auth(None)), None);
    }
}
