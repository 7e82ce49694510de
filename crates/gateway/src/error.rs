use axum::http::StatusCode;
use axum::{response::IntoResponse, Json};
use tracing::error;

use crate::transport::TransportError;
use crate::tunnel::TunnelError;

/// Application error type for HTTP handlers.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

pub type ApiResult<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: msg.into(),
        }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthorized",
            message: msg.into(),
        }
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            code: "forbidden",
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            code: "conflict",
            message: msg.into(),
        }
    }

    pub fn payload_too_large(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            code: "payload_too_large",
            message: msg.into(),
        }
    }

    pub fn bad_gateway(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            code: "bad_gateway",
            message: msg.into(),
        }
    }

    pub fn internal(msg: &str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error",
            message: msg.to_string(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(transport) = err.chain().find_map(|cause| cause.downcast_ref::<TransportError>()) {
            let mapped = map_transport_error(transport);
            crate::telemetry::record_proxy_error_metrics("transport");
            error!(?err, "transport error");
            return mapped;
        }
        if let Some(tunnel) = err.chain().find_map(|cause| cause.downcast_ref::<TunnelError>()) {
            let mapped = map_tunnel_error(tunnel);
            crate::telemetry::record_proxy_error_metrics("tunnel");
            error!(?err, "tunnel error");
            return mapped;
        }

        crate::telemetry::record_proxy_error_metrics("internal");
        error!(?err, "internal error");
        AppError::internal("internal server error")
    }
}

fn map_transport_error(err: &TransportError) -> AppError {
    match err {
        // Preserve the upstream status when one was partially received so the
        // caller can distinguish a backend refusal from a dead connection.
        TransportError::Connection {
            upstream_status: Some(status),
            ..
        } => AppError {
            status: *status,
            code: "backend_error",
            message: err.to_string(),
        },
        TransportError::Connection { .. } => AppError::internal(&err.to_string()),
        TransportError::InvalidResponse(_) => AppError::bad_gateway(err.to_string()),
    }
}

fn map_tunnel_error(err: &TunnelError) -> AppError {
    match err {
        TunnelError::NotConnected => AppError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "tunnel_unavailable",
            message: "no active tunnel for endpoint".to_string(),
        },
    }
}

pub(crate) fn into_response(err: AppError) -> axum::response::Response {
    let body = Json(serde_json::json!({
        "error": err.message,
        "code": err.code,
    }));
    (err.status, body).into_response()
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        into_response(self)
    }
}
