//! HTTP surface of the gateway.

use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};

use crate::app_state::AppState;
use crate::error::AppError;

mod proxy;
mod websocket;

pub fn build_router(state: AppState) -> Router {
    let authed = Router::new()
        .merge(proxy::router())
        .merge(websocket::router())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_session,
        ));

    Router::new()
        .route("/health", get(healthz))
        .route("/metrics", get(metrics))
        .merge(authed)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
        .with_state(state)
}

/// Router for the private metrics listener.
pub fn build_metrics_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Resolves the caller's session and stashes the security context in the
/// request extensions, where transports and handlers pick it up.
///
/// Browsers cannot set headers on websocket upgrades, so a `token` query
/// parameter is accepted as a fallback to the Authorization header.
pub(crate) async fn require_session(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let Some(token) = bearer_from_request(&req) else {
        return AppError::unauthorized("missing bearer token").into_response();
    };

    match state.sessions.validate(&token).await {
        Ok(Some(ctx)) => {
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        Ok(None) => AppError::unauthorized("invalid or expired session").into_response(),
        Err(err) => AppError::from(err).into_response(),
    }
}

fn bearer_from_request(req: &Request<Body>) -> Option<String> {
    if let Some(value) = req.headers().get(AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }

    req.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.split_once('=')
                .filter(|(key, value)| *key == "token" && !value.is_empty())
                .map(|(_, value)| value.to_string())
        })
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: crate::version::VERSION,
    })
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4",
            )],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, auth: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(auth) = auth {
            builder = builder.header(AUTHORIZATION, auth);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn bearer_prefers_the_authorization_header() {
        let req = request("/api/endpoints/1/docker/info?token=qs", Some("Bearer hdr"));
        assert_eq!(bearer_from_request(&req).as_deref(), Some("hdr"));
    }

    #[test]
    fn bearer_falls_back_to_the_token_query_parameter() {
        let req = request("/api/websocket/attach?endpointId=1&id=ab&token=qs", None);
        assert_eq!(bearer_from_request(&req).as_deref(), Some("qs"));
    }

    #[test]
    fn missing_credentials_yield_none() {
        assert!(bearer_from_request(&request("/api/endpoints/1/docker/info", None)).is_none());
        assert!(bearer_from_request(&request("/x?token=", None)).is_none());
        assert!(bearer_from_request(&request("/x", Some("Basic abc"))).is_none());
    }
}
