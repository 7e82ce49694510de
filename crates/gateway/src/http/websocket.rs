//! Websocket endpoints bridging browser terminals onto interactive
//! attach/exec sessions.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension, Query, State,
    },
    http::Response,
    routing::get,
    Router,
};
use axum::body::Body;
use bytes::Bytes;
use common::model::{EndpointId, SecurityContext};
use metrics::counter;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::hijack::{self, BackendDialer, HijackOp, HijackPhase};

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/api/websocket/attach", get(attach))
        .route("/api/websocket/exec", get(exec))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionParams {
    /// Container ID for attach, exec instance ID for exec.
    id: String,
    endpoint_id: i64,
    /// Swarm node hint; recorded for diagnostics, routing happens backend-side.
    node_name: Option<String>,
}

async fn attach(
    state: State<AppState>,
    params: Query<SessionParams>,
    ctx: Extension<SecurityContext>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response<Body>> {
    start_session(state, params, ctx, ws, HijackOp::Attach).await
}

async fn exec(
    state: State<AppState>,
    params: Query<SessionParams>,
    ctx: Extension<SecurityContext>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response<Body>> {
    start_session(state, params, ctx, ws, HijackOp::ExecStart).await
}

async fn start_session(
    State(state): State<AppState>,
    Query(params): Query<SessionParams>,
    Extension(ctx): Extension<SecurityContext>,
    ws: WebSocketUpgrade,
    op: HijackOp,
) -> ApiResult<Response<Body>> {
    debug!(
        phase = HijackPhase::Received.as_str(),
        operation_id = %params.id,
        "interactive session requested"
    );
    hijack::validate_operation_id(&params.id)
        .map_err(|_| AppError::bad_request("operation id must be hexadecimal"))?;

    let endpoint = state
        .endpoints
        .endpoint(EndpointId(params.endpoint_id))
        .await?
        .ok_or_else(|| AppError::not_found("endpoint not found"))?;
    if !endpoint.endpoint_type.is_docker() {
        return Err(AppError::bad_request(
            "interactive sessions require a Docker endpoint",
        ));
    }

    let dialer = state.factory.hijack_dialer(&endpoint).await?;
    let id = params.id;
    debug!(
        phase = HijackPhase::Authorized.as_str(),
        endpoint = %endpoint.id,
        user = ctx.user_id,
        op = op.as_str(),
        node = params.node_name.as_deref().unwrap_or(""),
        "starting interactive session"
    );
    counter!("gateway_hijack_sessions_total", "op" => op.as_str()).increment(1);

    Ok(ws.on_upgrade(move |socket| async move {
        if let Err(err) = bridge(socket, dialer.as_ref(), op, &id).await {
            warn!(?err, operation_id = %id, "interactive session ended with error");
        }
    }))
}

/// Pump bytes between the websocket and the raw backend stream until either
/// side closes.
async fn bridge(
    mut socket: WebSocket,
    dialer: &dyn BackendDialer,
    op: HijackOp,
    id: &str,
) -> anyhow::Result<()> {
    let (mut backend, leftover) = hijack::open_backend(dialer, op, id).await?;
    if !leftover.is_empty() {
        socket.send(Message::Binary(leftover)).await?;
    }

    let mut buf = vec![0u8; 8 * 1024];
    loop {
        tokio::select! {
            read = backend.read(&mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        socket
                            .send(Message::Binary(Bytes::copy_from_slice(&buf[..n])))
                            .await?;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => backend.write_all(&data).await?,
                    Some(Ok(Message::Text(text))) => backend.write_all(text.as_bytes()).await?,
                    Some(Ok(Message::Close(_))) | None => break,
                    // Pings are answered by axum.
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                }
            }
        }
    }

    let _ = socket.send(Message::Close(None)).await;
    Ok(())
}
