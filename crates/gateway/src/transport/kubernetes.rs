//! Kubernetes transports: cluster-local, agent-backed, and edge-tunneled.
//!
//! Every variant attaches a per-user bearer token minted by the token cache
//! so backend audit logs attribute actions to the real caller. Agent-backed
//! endpoints additionally sign each request for mutual authentication with
//! the remote agent.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header::AUTHORIZATION, HeaderValue, Request, Response};
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use common::model::{Endpoint, SecurityContext};
use sha2::{Digest, Sha256};

use crate::tokens::TokenCache;

use super::docker::{send_over_http, HttpTarget};
use super::{BackendTransport, TransportError};

pub const AGENT_SIGNATURE_HEADER: &str = "x-agent-signature";
pub const AGENT_TIMESTAMP_HEADER: &str = "x-agent-timestamp";

/// Signs proxied requests with a shared secret so the remote agent can
/// reject traffic that did not originate from this gateway.
#[derive(Clone)]
pub struct AgentSigner {
    secret: String,
}

impl AgentSigner {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn sign(&self, method: &str, path: &str, timestamp: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(method.as_bytes());
        hasher.update(path.as_bytes());
        hasher.update(timestamp.to_string().as_bytes());
        general_purpose::STANDARD.encode(hasher.finalize())
    }
}

/// Connectivity-specific behavior layered on the shared token handling.
pub enum KubernetesMode {
    /// Locally privileged client inside the cluster.
    Local,
    /// Non-edge agent: HTTPS with a request signature.
    Agent { signer: AgentSigner },
    /// Edge agent: plain HTTP to a tunnel address resolved per call. The
    /// remote agent authenticates the gateway the same way the non-edge
    /// agent does, so edge requests carry the signature too.
    Edge { signer: AgentSigner },
}

impl KubernetesMode {
    fn signer(&self) -> Option<&AgentSigner> {
        match self {
            KubernetesMode::Local => None,
            KubernetesMode::Agent { signer } | KubernetesMode::Edge { signer } => Some(signer),
        }
    }
}

pub struct KubernetesTransport {
    client: reqwest::Client,
    target: HttpTarget,
    endpoint: Endpoint,
    tokens: Arc<TokenCache>,
    mode: KubernetesMode,
}

impl KubernetesTransport {
    pub fn new(
        client: reqwest::Client,
        target: HttpTarget,
        endpoint: Endpoint,
        tokens: Arc<TokenCache>,
        mode: KubernetesMode,
    ) -> Self {
        Self {
            client,
            target,
            endpoint,
            tokens,
            mode,
        }
    }
}

#[async_trait]
impl BackendTransport for KubernetesTransport {
    async fn round_trip(&self, mut req: Request<Body>) -> Result<Response<Body>, TransportError> {
        let ctx = req
            .extensions()
            .get::<SecurityContext>()
            .cloned()
            .ok_or_else(|| {
                TransportError::connection(
                    "authenticate",
                    anyhow::anyhow!("request is missing a security context"),
                )
            })?;

        let bearer = self
            .tokens
            .bearer_for(&self.endpoint, &ctx)
            .await
            .map_err(|err| TransportError::connection("mint cluster token", err))?;
        let value = HeaderValue::from_str(&format!("Bearer {bearer}")).map_err(|err| {
            TransportError::connection("mint cluster token", anyhow::anyhow!(err))
        })?;
        req.headers_mut().insert(AUTHORIZATION, value);

        if let Some(signer) = self.mode.signer() {
            let timestamp = Utc::now().timestamp();
            let signature = signer.sign(req.method().as_str(), req.uri().path(), timestamp);
            req.headers_mut().insert(
                AGENT_SIGNATURE_HEADER,
                HeaderValue::from_str(&signature).map_err(|err| {
                    TransportError::connection("sign request", anyhow::anyhow!(err))
                })?,
            );
            req.headers_mut().insert(
                AGENT_TIMESTAMP_HEADER,
                HeaderValue::from_str(&timestamp.to_string()).map_err(|err| {
                    TransportError::connection("sign request", anyhow::anyhow!(err))
                })?,
            );
        }

        let (scheme, host) = self.target.authority().await?;
        send_over_http(&self.client, &scheme, &host, req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::memory::StaticTokenIssuer;
    use crate::tokens::TokenCache;
    use axum::http::HeaderMap;
    use axum::routing::any;
    use axum::Router;
    use chrono::Duration;
    use common::model::{EndpointId, EndpointType};

    fn endpoint() -> Endpoint {
        Endpoint {
            id: EndpointId(1),
            name: "k8s".to_string(),
            endpoint_type: EndpointType::KubernetesEdge,
            url: String::new(),
            socket_path: None,
            tls: None,
        }
    }

    fn ctx(user_id: i64) -> SecurityContext {
        SecurityContext {
            user_id,
            team_ids: vec![],
            is_admin: false,
            auth_token: "jwt".to_string(),
        }
    }

    /// Loopback server that records the headers of the first request.
    async fn capture_server() -> (String, tokio::sync::mpsc::Receiver<HeaderMap>) {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let host = format!("127.0.0.1:{}", listener.local_addr().expect("addr").port());

        let app = Router::new().route(
            "/{*path}",
            any(move |req: Request<Body>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(req.headers().clone()).await;
                    "ok"
                }
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("capture server");
        });
        (host, rx)
    }

    fn transport(host: String, mode: KubernetesMode) -> KubernetesTransport {
        let tokens = Arc::new(TokenCache::new(Arc::new(StaticTokenIssuer::new(
            Duration::minutes(5),
        ))));
        KubernetesTransport::new(
            reqwest::Client::new(),
            HttpTarget::Direct {
                scheme: "http".to_string(),
                host,
            },
            endpoint(),
            tokens,
            mode,
        )
    }

    async fn round_trip_and_capture(mode: KubernetesMode) -> HeaderMap {
        let (host, mut rx) = capture_server().await;
        let transport = transport(host, mode);

        let mut req = Request::builder()
            .uri("/api/v1/pods")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut().insert(ctx(7));

        let response = transport.round_trip(req).await.expect("round trip");
        assert!(response.status().is_success());
        rx.recv().await.expect("captured headers")
    }

    #[tokio::test]
    async fn edge_mode_signs_requests_like_the_agent_mode() {
        let mode = KubernetesMode::Edge {
            signer: AgentSigner::new("shared-secret"),
        };
        let headers = round_trip_and_capture(mode).await;

        assert!(headers.contains_key(AGENT_SIGNATURE_HEADER));
        assert!(headers.contains_key(AGENT_TIMESTAMP_HEADER));
        let auth = headers.get(AUTHORIZATION).expect("bearer").to_str().unwrap();
        assert!(auth.starts_with("Bearer "));
    }

    #[tokio::test]
    async fn local_mode_attaches_only_the_bearer() {
        let headers = round_trip_and_capture(KubernetesMode::Local).await;

        assert!(!headers.contains_key(AGENT_SIGNATURE_HEADER));
        assert!(!headers.contains_key(AGENT_TIMESTAMP_HEADER));
        assert!(headers.contains_key(AUTHORIZATION));
    }

    #[test]
    fn signature_is_deterministic_per_request_shape() {
        let signer = AgentSigner::new("shared-secret");
        let a = signer.sign("GET", "/api/v1/pods", 1_700_000_000);
        let b = signer.sign("GET", "/api/v1/pods", 1_700_000_000);
        assert_eq!(a, b);
    }

    #[test]
    fn signature_varies_with_inputs() {
        let signer = AgentSigner::new("shared-secret");
        let base = signer.sign("GET", "/api/v1/pods", 1_700_000_000);
        assert_ne!(base, signer.sign("POST", "/api/v1/pods", 1_700_000_000));
        assert_ne!(base, signer.sign("GET", "/api/v1/secrets", 1_700_000_000));
        assert_ne!(base, signer.sign("GET", "/api/v1/pods", 1_700_000_001));
        assert_ne!(
            base,
            AgentSigner::new("other-secret").sign("GET", "/api/v1/pods", 1_700_000_000)
        );
    }
}
