//! Docker transports: local socket and HTTP(S), plus the per-transport
//! daemon/cluster identifier cache that backs resource-ID derivation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response, Uri};
use common::model::EndpointId;
use tokio::sync::Mutex;
use tracing::debug;

use crate::director::{self, ProxyTarget};
use crate::stores::SnapshotStore;
use crate::tunnel::TunnelRegistry;

use super::{BackendTransport, TransportError};

const INFO_BODY_LIMIT_BYTES: usize = 1024 * 1024;

/// Talks to a Docker daemon over a Unix socket. The request URL carries the
/// synthetic `http://unixsocket` marker; the connection is dialed directly.
pub struct DockerLocalTransport {
    socket_path: PathBuf,
}

impl DockerLocalTransport {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }
}

#[async_trait]
impl BackendTransport for DockerLocalTransport {
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>, TransportError> {
        let (mut parts, body) = req.into_parts();

        // Force the marker host so misrouted requests never escape the
        // socket, then downgrade to origin-form for the wire.
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        parts.uri = path_and_query
            .parse::<Uri>()
            .map_err(|err| TransportError::InvalidResponse(format!("invalid request path: {err}")))?;

        #[cfg(unix)]
        {
            use hyper_util::rt::TokioIo;
            use tokio::net::UnixStream;

            let stream = UnixStream::connect(&self.socket_path)
                .await
                .map_err(|err| TransportError::connection("dial unix socket", err))?;
            let io = TokioIo::new(stream);
            let (mut sender, connection) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|err| TransportError::connection("http handshake", err))?;
            tokio::spawn(async move {
                if let Err(err) = connection.await {
                    debug!(?err, "unix socket connection closed with error");
                }
            });

            let response = sender
                .send_request(Request::from_parts(parts, body))
                .await
                .map_err(|err| TransportError::connection("round trip", err))?;
            let (parts, incoming) = response.into_parts();
            Ok(Response::from_parts(parts, Body::new(incoming)))
        }

        #[cfg(not(unix))]
        {
            let _ = (parts, body);
            Err(TransportError::connection(
                "dial named pipe",
                anyhow::anyhow!("local-socket endpoints are not supported on this platform"),
            ))
        }
    }
}

/// Where an HTTP transport points: a fixed authority, or a tunnel address
/// resolved per call because edge tunnels reconnect on new ports.
pub enum HttpTarget {
    Direct { scheme: String, host: String },
    Edge {
        registry: TunnelRegistry,
        endpoint_id: EndpointId,
        wait: Duration,
        poll_interval: Duration,
    },
}

impl HttpTarget {
    pub(crate) async fn authority(&self) -> Result<(String, String), TransportError> {
        match self {
            HttpTarget::Direct { scheme, host } => Ok((scheme.clone(), host.clone())),
            HttpTarget::Edge {
                registry,
                endpoint_id,
                wait,
                poll_interval,
            } => {
                let address = registry
                    .resolve_address(*endpoint_id, *wait, *poll_interval)
                    .await
                    .map_err(|err| TransportError::connection("resolve tunnel", err))?;
                Ok(("http".to_string(), address))
            }
        }
    }
}

/// Talks to a Docker daemon over HTTP(S), directly or through an edge
/// tunnel. TLS material is baked into the `reqwest` client at construction.
pub struct DockerHttpTransport {
    client: reqwest::Client,
    target: HttpTarget,
}

impl DockerHttpTransport {
    pub fn new(client: reqwest::Client, target: HttpTarget) -> Self {
        Self { client, target }
    }
}

#[async_trait]
impl BackendTransport for DockerHttpTransport {
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>, TransportError> {
        let (scheme, host) = self.target.authority().await?;
        send_over_http(&self.client, &scheme, &host, req).await
    }
}

/// Forward one request with a `reqwest` client, re-pointing the URL at the
/// given authority. Shared by the Docker and Kubernetes HTTP transports.
pub(crate) async fn send_over_http(
    client: &reqwest::Client,
    scheme: &str,
    host: &str,
    req: Request<Body>,
) -> Result<Response<Body>, TransportError> {
    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = reqwest::Url::parse(&format!("{scheme}://{host}{path_and_query}"))
        .map_err(|err| TransportError::InvalidResponse(format!("invalid backend URL: {err}")))?;

    let outbound = client
        .request(parts.method, url)
        .headers(parts.headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()));

    let response = outbound.send().await.map_err(|err| TransportError::Connection {
        context: "round trip",
        upstream_status: err.status(),
        source: err.into(),
    })?;

    let status = response.status();
    let headers = response.headers().clone();
    let mut builder = Response::builder().status(status);
    if let Some(out_headers) = builder.headers_mut() {
        *out_headers = headers;
    }
    builder
        .body(Body::from_stream(response.bytes_stream()))
        .map_err(|err| TransportError::InvalidResponse(err.to_string()))
}

/// Lazily resolved daemon/cluster identifier, one per transport instance.
///
/// Priority: in-memory value, then the snapshot cache, then a live `/info`
/// call. Write-once; a new transport is built per endpoint access, which is
/// what refreshes the value.
pub struct DockerIdCache {
    endpoint_id: EndpointId,
    snapshots: Arc<dyn SnapshotStore>,
    cached: Mutex<Option<String>>,
}

impl DockerIdCache {
    pub fn new(endpoint_id: EndpointId, snapshots: Arc<dyn SnapshotStore>) -> Self {
        Self {
            endpoint_id,
            snapshots,
            cached: Mutex::new(None),
        }
    }

    pub async fn docker_id(
        &self,
        target: &ProxyTarget,
        transport: &dyn BackendTransport,
    ) -> anyhow::Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        if let Some(id) = self.snapshots.docker_id(self.endpoint_id).await? {
            *cached = Some(id.clone());
            return Ok(id);
        }

        let id = fetch_docker_id(target, transport).await?;
        *cached = Some(id.clone());
        Ok(id)
    }
}

async fn fetch_docker_id(
    target: &ProxyTarget,
    transport: &dyn BackendTransport,
) -> anyhow::Result<String> {
    let mut req = Request::builder()
        .method(Method::GET)
        .uri("/info")
        .body(Body::empty())?;
    director::rewrite(target, &mut req)?;

    let response = transport.round_trip(req).await?;
    if !response.status().is_success() {
        anyhow::bail!("info call failed with status {}", response.status());
    }
    let bytes = axum::body::to_bytes(response.into_body(), INFO_BODY_LIMIT_BYTES).await?;
    let info: serde_json::Value = serde_json::from_slice(&bytes)?;
    docker_id_from_info(&info)
}

/// The Swarm cluster ID when the daemon participates in a swarm, else the
/// daemon's own ID. This salt makes resource IDs disambiguate same-named
/// objects on different clusters.
pub(crate) fn docker_id_from_info(info: &serde_json::Value) -> anyhow::Result<String> {
    if let Some(cluster_id) = info
        .pointer("/Swarm/Cluster/ID")
        .and_then(|v| v.as_str())
        .filter(|id| !id.is_empty())
    {
        return Ok(cluster_id.to_string());
    }
    info.get("ID")
        .and_then(|v| v.as_str())
        .filter(|id| !id.is_empty())
        .map(|id| id.to_string())
        .ok_or_else(|| anyhow::anyhow!("daemon info is missing an identifier"))
}
