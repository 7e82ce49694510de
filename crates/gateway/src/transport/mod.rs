//! Per-backend transport implementations.
//!
//! One strategy per backend kind, selected once at proxy-construction time.
//! Upstream status codes pass through verbatim; only transport-level
//! failures (dial, TLS, DNS) synthesize an error response, carrying the
//! upstream status when one was partially received.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use std::sync::Arc;
use thiserror::Error;

pub mod docker;
pub mod kubernetes;

pub use docker::{DockerHttpTransport, DockerIdCache, DockerLocalTransport, HttpTarget};
pub use kubernetes::{AgentSigner, KubernetesTransport, KubernetesMode};

pub type DynBackendTransport = Arc<dyn BackendTransport>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to reach backend ({context}): {source}")]
    Connection {
        context: &'static str,
        /// Status received from the upstream before the failure, if any.
        upstream_status: Option<StatusCode>,
        #[source]
        source: anyhow::Error,
    },
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    pub fn connection(context: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Self::Connection {
            context,
            upstream_status: None,
            source: source.into(),
        }
    }

    /// Synthesize an error response for the client, preferring the real
    /// upstream status over a generic 500.
    pub fn into_response(self) -> Response<Body> {
        let status = match &self {
            TransportError::Connection {
                upstream_status: Some(status),
                ..
            } => *status,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "error": self.to_string(),
            "code": "backend_unreachable",
        });
        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }
}

/// One round-trip against a backend. The proxy handler owns the director
/// rewrite and the response decoration; transports only move bytes.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_prefers_upstream_status() {
        let err = TransportError::Connection {
            context: "round_trip",
            upstream_status: Some(StatusCode::BAD_GATEWAY),
            source: anyhow::anyhow!("stream reset"),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn error_response_falls_back_to_500() {
        let err = TransportError::connection("dial", anyhow::anyhow!("connection refused"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
