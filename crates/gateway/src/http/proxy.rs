//! Proxy handlers for the Docker and Kubernetes backend APIs.
//!
//! Requests stream through untouched unless they hit an operation the
//! access-control engine decorates; those responses are buffered (bounded by
//! `limits.proxy_body_bytes`), rewritten, and re-emitted.

use std::time::Instant;

use axum::{
    body::{self, Body},
    extract::{Extension, Path, State},
    http::{
        header::{CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING},
        response::Parts,
        HeaderValue, Method, Request, Response, StatusCode, Uri,
    },
    routing::any,
    Router,
};
use bytes::Bytes;
use common::model::{EndpointId, SecurityContext};
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::warn;

use crate::access::volumes::{InspectOutcome, VolumeOperations};
use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::factory::Proxy;

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/endpoints/{endpoint_id}/docker/{*path}",
            any(proxy_docker),
        )
        .route(
            "/api/endpoints/{endpoint_id}/kubernetes/{*path}",
            any(proxy_kubernetes),
        )
}

/// Backend operations the gateway rewrites rather than streams.
#[derive(Debug, PartialEq, Eq)]
enum DockerOp {
    VolumeList,
    VolumeInspect(String),
    VolumeCreate,
    VolumeDelete(String),
    Passthrough,
}

/// Match the backend-relative path against the decorated operations. A
/// leading Docker API version segment (`/v1.41/...`) is ignored.
fn classify(method: &Method, path: &str) -> DockerOp {
    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if let Some(first) = segments.first() {
        let is_version = first.len() > 1
            && first.starts_with('v')
            && first[1..].chars().all(|c| c.is_ascii_digit() || c == '.');
        if is_version {
            segments.remove(0);
        }
    }

    match (method, segments.as_slice()) {
        (&Method::GET, ["volumes"]) => DockerOp::VolumeList,
        (&Method::POST, ["volumes", "create"]) => DockerOp::VolumeCreate,
        (&Method::GET, ["volumes", name]) => DockerOp::VolumeInspect((*name).to_string()),
        (&Method::DELETE, ["volumes", name]) => DockerOp::VolumeDelete((*name).to_string()),
        _ => DockerOp::Passthrough,
    }
}

async fn proxy_docker(
    State(state): State<AppState>,
    Path((endpoint_id, path)): Path<(i64, String)>,
    Extension(ctx): Extension<SecurityContext>,
    req: Request<Body>,
) -> ApiResult<Response<Body>> {
    let endpoint = state
        .endpoints
        .endpoint(EndpointId(endpoint_id))
        .await?
        .ok_or_else(|| AppError::not_found("endpoint not found"))?;
    if !endpoint.endpoint_type.is_docker() {
        return Err(AppError::bad_request("endpoint is not Docker-backed"));
    }

    let backend = endpoint.endpoint_type.as_str();
    let request_id = crate::telemetry::request_id_from_request(&req);
    let start = Instant::now();
    let result = async {
        let proxy = state.factory.build(&endpoint).await?;
        let req = rebase_request(req, &path, &ctx)?;
        let op = classify(req.method(), req.uri().path());

        match op {
            DockerOp::Passthrough => Ok(proxy.forward(req).await?),
            decorated => {
                let docker_id = proxy.docker_id().await?;
                let ops = VolumeOperations::new(&state.engine, &docker_id, &ctx);
                match decorated {
                    DockerOp::VolumeList => {
                        volume_list(&state, &proxy, &ops, req).await
                    }
                    DockerOp::VolumeInspect(_) => {
                        volume_inspect(&state, &proxy, &ops, req).await
                    }
                    DockerOp::VolumeCreate => {
                        volume_create(&state, &proxy, &ops, req).await
                    }
                    DockerOp::VolumeDelete(name) => {
                        volume_delete(&proxy, &ops, req, &name).await
                    }
                    DockerOp::Passthrough => unreachable!(),
                }
            }
        }
    }
    .await;

    if let Err(err) = &result {
        warn!(?request_id, status = %err.status, "docker proxy request failed");
    }
    record_proxy_metrics(backend, &result, start);
    result
}

async fn proxy_kubernetes(
    State(state): State<AppState>,
    Path((endpoint_id, path)): Path<(i64, String)>,
    Extension(ctx): Extension<SecurityContext>,
    req: Request<Body>,
) -> ApiResult<Response<Body>> {
    let endpoint = state
        .endpoints
        .endpoint(EndpointId(endpoint_id))
        .await?
        .ok_or_else(|| AppError::not_found("endpoint not found"))?;
    if endpoint.endpoint_type.is_docker() {
        return Err(AppError::bad_request("endpoint is not Kubernetes-backed"));
    }

    let backend = endpoint.endpoint_type.as_str();
    let request_id = crate::telemetry::request_id_from_request(&req);
    let start = Instant::now();
    let result: ApiResult<Response<Body>> = async {
        let proxy = state.factory.build(&endpoint).await?;
        let req = rebase_request(req, &path, &ctx)?;
        Ok(proxy.forward(req).await?)
    }
    .await;

    if let Err(err) = &result {
        warn!(?request_id, status = %err.status, "kubernetes proxy request failed");
    }
    record_proxy_metrics(backend, &result, start);
    result
}

fn record_proxy_metrics(
    backend: &'static str,
    result: &ApiResult<Response<Body>>,
    start: Instant,
) {
    let label = match result {
        Ok(response) if response.status() == StatusCode::FORBIDDEN => "denied",
        Ok(_) => "ok",
        Err(err) if err.status == StatusCode::FORBIDDEN => "denied",
        Err(_) => "error",
    };
    counter!(
        "gateway_proxy_requests_total",
        "backend" => backend,
        "result" => label
    )
    .increment(1);
    histogram!(
        "gateway_proxy_request_duration_seconds",
        "backend" => backend,
        "result" => label
    )
    .record(start.elapsed().as_secs_f64());
}

/// Rebase the request onto the backend-relative path captured by the route
/// wildcard and attach the caller's security context for the transports.
fn rebase_request(
    mut req: Request<Body>,
    path: &str,
    ctx: &SecurityContext,
) -> Result<Request<Body>, AppError> {
    let path_and_query = match req.uri().query() {
        Some(query) => format!("/{path}?{query}"),
        None => format!("/{path}"),
    };
    let uri: Uri = path_and_query
        .parse()
        .map_err(|_| AppError::bad_request("invalid request path"))?;
    *req.uri_mut() = uri;
    req.extensions_mut().insert(ctx.clone());
    Ok(req)
}

async fn volume_list(
    state: &AppState,
    proxy: &Proxy,
    ops: &VolumeOperations<'_>,
    req: Request<Body>,
) -> ApiResult<Response<Body>> {
    let response = proxy.forward(req).await?;
    if !response.status().is_success() {
        return Ok(response);
    }

    let (parts, payload) = buffer_json(response, state.proxy_body_limit).await?;
    let rewritten = ops.rewrite_list(payload).await?;
    rebuild_json(parts, &rewritten)
}

async fn volume_inspect(
    state: &AppState,
    proxy: &Proxy,
    ops: &VolumeOperations<'_>,
    req: Request<Body>,
) -> ApiResult<Response<Body>> {
    let response = proxy.forward(req).await?;
    if !response.status().is_success() {
        return Ok(response);
    }

    let (parts, payload) = buffer_json(response, state.proxy_body_limit).await?;
    match ops.rewrite_inspect(payload).await? {
        InspectOutcome::Allowed(body) => rebuild_json(parts, &body),
        InspectOutcome::Denied => Err(AppError::forbidden("access denied to resource")),
    }
}

async fn volume_create(
    state: &AppState,
    proxy: &Proxy,
    ops: &VolumeOperations<'_>,
    req: Request<Body>,
) -> ApiResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let bytes = body::to_bytes(body, state.proxy_body_limit)
        .await
        .map_err(|_| AppError::payload_too_large("request payload too large"))?;
    let payload: Value = serde_json::from_slice(&bytes)
        .map_err(|_| AppError::bad_request("create request body is not valid JSON"))?;

    // Duplicate names are rejected before the backend call. Docker's create
    // is idempotent and would answer 201 for an existing volume, silently
    // binding the caller to an object they did not create.
    if let Some(name) = VolumeOperations::declared_name(&payload)? {
        if volume_exists(proxy, &name).await? {
            return Err(AppError::conflict(
                "a volume with the same name already exists",
            ));
        }
    }

    let response = proxy
        .forward(Request::from_parts(parts, Body::from(bytes)))
        .await?;
    if !response.status().is_success() {
        return Ok(response);
    }

    let (parts, created) = buffer_json(response, state.proxy_body_limit).await?;
    let decorated = ops.register_created(created).await?;
    rebuild_json(parts, &decorated)
}

async fn volume_exists(proxy: &Proxy, name: &str) -> ApiResult<bool> {
    let lookup = Request::builder()
        .method(Method::GET)
        .uri(format!("/volumes/{name}"))
        .body(Body::empty())
        .map_err(|_| AppError::bad_request("invalid volume name"))?;
    let response = proxy.forward(lookup).await?;
    Ok(response.status().is_success())
}

async fn volume_delete(
    proxy: &Proxy,
    ops: &VolumeOperations<'_>,
    req: Request<Body>,
    name: &str,
) -> ApiResult<Response<Body>> {
    if !ops.authorize_removal(name).await? {
        return Err(AppError::forbidden("access denied to resource"));
    }

    let response = proxy.forward(req).await?;
    if response.status().is_success() {
        if let Err(err) = ops.forget_removed(name).await {
            warn!(?err, volume = name, "failed to drop resource control after delete");
        }
    }
    Ok(response)
}

async fn buffer_json(
    response: Response<Body>,
    limit: usize,
) -> ApiResult<(Parts, Value)> {
    let (parts, body) = response.into_parts();
    let bytes: Bytes = body::to_bytes(body, limit)
        .await
        .map_err(|err| AppError::bad_gateway(format!("failed to read backend response: {err}")))?;
    let payload: Value = serde_json::from_slice(&bytes)
        .map_err(|err| AppError::bad_gateway(format!("backend response is not JSON: {err}")))?;
    Ok((parts, payload))
}

fn rebuild_json(mut parts: Parts, payload: &Value) -> ApiResult<Response<Body>> {
    let bytes = serde_json::to_vec(payload)
        .map_err(|err| AppError::internal(&format!("failed to serialize response: {err}")))?;
    // The rewritten body has a different length; the stale framing headers
    // must not survive.
    parts.headers.remove(CONTENT_LENGTH);
    parts.headers.remove(TRANSFER_ENCODING);
    parts
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(Response::from_parts(parts, Body::from(bytes)))
}
