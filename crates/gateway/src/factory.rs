//! Builds a proxy per (endpoint, request): a cheap construction that picks
//! the transport strategy for the endpoint's type and wires in the shared
//! caches. The heavyweight state lives elsewhere and outlives any single
//! proxy: token caches in the registry, tunnel addresses in the tunnel
//! registry, docker-id snapshots in the snapshot store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::body::Body;
use axum::http::{Request, Response};
use common::model::{Endpoint, EndpointType, TlsMaterial};

use crate::director::{self, ProxyTarget};
use crate::hijack::{BackendDialer, TcpDialer, UnixDialer};
use crate::stores::SnapshotStore;
use crate::tokens::TokenCacheRegistry;
use crate::transport::{
    AgentSigner, DockerHttpTransport, DockerIdCache, DockerLocalTransport, DynBackendTransport,
    HttpTarget, KubernetesMode, KubernetesTransport,
};
use crate::tunnel::TunnelRegistry;

/// Backend-kind-specific state a built proxy carries besides its transport.
pub enum ProxyKind {
    Docker { id_cache: DockerIdCache },
    Kubernetes,
}

/// A proxy built for one endpoint. Rewrites requests with the director and
/// forwards them through the selected transport.
pub struct Proxy {
    endpoint: Endpoint,
    target: ProxyTarget,
    transport: DynBackendTransport,
    kind: ProxyKind,
}

impl Proxy {
    pub fn is_docker(&self) -> bool {
        matches!(self.kind, ProxyKind::Docker { .. })
    }

    /// Rewrite and forward one request.
    pub async fn forward(&self, mut req: Request<Body>) -> anyhow::Result<Response<Body>> {
        director::rewrite(&self.target, &mut req)?;
        match self.transport.round_trip(req).await {
            Ok(response) => Ok(response),
            Err(err) => Err(err.into()),
        }
    }

    /// The daemon/cluster identifier used to derive resource IDs. Only
    /// meaningful for Docker-backed proxies.
    pub async fn docker_id(&self) -> anyhow::Result<String> {
        match &self.kind {
            ProxyKind::Docker { id_cache } => {
                id_cache.docker_id(&self.target, self.transport.as_ref()).await
            }
            ProxyKind::Kubernetes => {
                anyhow::bail!("endpoint {} is not Docker-backed", self.endpoint.id)
            }
        }
    }
}

/// Builds proxies and interactive-session dialers per endpoint.
#[derive(Clone)]
pub struct ProxyFactory {
    snapshots: Arc<dyn SnapshotStore>,
    tokens: TokenCacheRegistry,
    tunnels: TunnelRegistry,
    tunnel_wait: Duration,
    tunnel_poll_interval: Duration,
    hijack_keepalive: Duration,
    agent_secret: String,
}

impl ProxyFactory {
    pub fn new(
        snapshots: Arc<dyn SnapshotStore>,
        tokens: TokenCacheRegistry,
        tunnels: TunnelRegistry,
        tunnel_wait: Duration,
        tunnel_poll_interval: Duration,
        hijack_keepalive: Duration,
        agent_secret: String,
    ) -> Self {
        Self {
            snapshots,
            tokens,
            tunnels,
            tunnel_wait,
            tunnel_poll_interval,
            hijack_keepalive,
            agent_secret,
        }
    }

    /// Build the proxy for an endpoint. The transport strategy is fixed by
    /// the endpoint's type; only the edge tunnel address is deferred to call
    /// time.
    pub async fn build(&self, endpoint: &Endpoint) -> anyhow::Result<Proxy> {
        let (target, transport): (ProxyTarget, DynBackendTransport) = match endpoint.endpoint_type {
            EndpointType::DockerLocal => {
                let socket_path = endpoint
                    .socket_path
                    .clone()
                    .with_context(|| format!("endpoint {} has no socket path", endpoint.id))?;
                (
                    ProxyTarget::local_socket(),
                    Arc::new(DockerLocalTransport::new(socket_path)),
                )
            }
            EndpointType::DockerHttp => {
                let target = ProxyTarget::parse(&endpoint.url)?;
                let client = build_client(endpoint.tls.as_ref())?;
                let http_target = HttpTarget::Direct {
                    scheme: target.scheme.clone(),
                    host: target.host.clone(),
                };
                (target, Arc::new(DockerHttpTransport::new(client, http_target)))
            }
            EndpointType::DockerEdge => {
                // Tunnel backends do not route on Host; the marker authority
                // is replaced with the live tunnel address per call.
                let target = ProxyTarget::for_tunnel("edge-tunnel");
                let client = build_client(None)?;
                let http_target = self.edge_target(endpoint);
                (target, Arc::new(DockerHttpTransport::new(client, http_target)))
            }
            EndpointType::KubernetesLocal => {
                self.kubernetes(endpoint, KubernetesMode::Local).await?
            }
            EndpointType::KubernetesAgent => {
                let mode = KubernetesMode::Agent {
                    signer: self.agent_signer(endpoint)?,
                };
                self.kubernetes(endpoint, mode).await?
            }
            EndpointType::KubernetesEdge => {
                // Edge agents authenticate the gateway exactly like non-edge
                // agents, so edge traffic is signed too.
                let mode = KubernetesMode::Edge {
                    signer: self.agent_signer(endpoint)?,
                };
                self.kubernetes(endpoint, mode).await?
            }
        };

        let kind = if endpoint.endpoint_type.is_docker() {
            ProxyKind::Docker {
                id_cache: DockerIdCache::new(endpoint.id, self.snapshots.clone()),
            }
        } else {
            ProxyKind::Kubernetes
        };

        Ok(Proxy {
            endpoint: endpoint.clone(),
            target,
            transport,
            kind,
        })
    }

    async fn kubernetes(
        &self,
        endpoint: &Endpoint,
        mode: KubernetesMode,
    ) -> anyhow::Result<(ProxyTarget, DynBackendTransport)> {
        let (target, http_target, client) = if endpoint.endpoint_type.is_edge() {
            (
                ProxyTarget::for_tunnel("edge-tunnel"),
                self.edge_target(endpoint),
                build_client(None)?,
            )
        } else {
            let target = ProxyTarget::parse(&endpoint.url)?;
            let http_target = HttpTarget::Direct {
                scheme: target.scheme.clone(),
                host: target.host.clone(),
            };
            (target, http_target, build_client(endpoint.tls.as_ref())?)
        };

        let tokens = self.tokens.cache_for(endpoint.id).await;
        let transport = KubernetesTransport::new(client, http_target, endpoint.clone(), tokens, mode);
        Ok((target, Arc::new(transport)))
    }

    fn agent_signer(&self, endpoint: &Endpoint) -> anyhow::Result<AgentSigner> {
        if self.agent_secret.is_empty() {
            anyhow::bail!(
                "endpoint {} requires agent.shared_secret to be configured",
                endpoint.id
            );
        }
        Ok(AgentSigner::new(self.agent_secret.clone()))
    }

    fn edge_target(&self, endpoint: &Endpoint) -> HttpTarget {
        HttpTarget::Edge {
            registry: self.tunnels.clone(),
            endpoint_id: endpoint.id,
            wait: self.tunnel_wait,
            poll_interval: self.tunnel_poll_interval,
        }
    }

    /// Dialer for the raw data plane of an interactive session. Only
    /// Docker-backed endpoints support attach/exec.
    pub async fn hijack_dialer(&self, endpoint: &Endpoint) -> anyhow::Result<Box<dyn BackendDialer>> {
        match endpoint.endpoint_type {
            EndpointType::DockerLocal => {
                let socket_path = endpoint
                    .socket_path
                    .clone()
                    .with_context(|| format!("endpoint {} has no socket path", endpoint.id))?;
                Ok(Box::new(UnixDialer::new(socket_path)))
            }
            EndpointType::DockerHttp => {
                if endpoint.tls.is_some() {
                    anyhow::bail!(
                        "interactive sessions over TLS endpoints are not supported (endpoint {})",
                        endpoint.id
                    );
                }
                let target = ProxyTarget::parse(&endpoint.url)?;
                Ok(Box::new(TcpDialer::new(target.host, self.hijack_keepalive)))
            }
            EndpointType::DockerEdge => {
                let address = self
                    .tunnels
                    .resolve_address(endpoint.id, self.tunnel_wait, self.tunnel_poll_interval)
                    .await?;
                Ok(Box::new(TcpDialer::new(address, self.hijack_keepalive)))
            }
            EndpointType::KubernetesLocal
            | EndpointType::KubernetesAgent
            | EndpointType::KubernetesEdge => {
                anyhow::bail!(
                    "interactive sessions are only supported on Docker endpoints (endpoint {})",
                    endpoint.id
                )
            }
        }
    }
}

/// A `reqwest` client with the endpoint's TLS material baked in.
fn build_client(tls: Option<&TlsMaterial>) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().use_rustls_tls();

    if let Some(tls) = tls {
        if let Some(ca_path) = &tls.ca_path {
            let pem = std::fs::read(ca_path)
                .with_context(|| format!("read CA bundle {}", ca_path.display()))?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        if let (Some(cert_path), Some(key_path)) = (&tls.cert_path, &tls.key_path) {
            let mut pem = std::fs::read(cert_path)
                .with_context(|| format!("read client certificate {}", cert_path.display()))?;
            pem.extend(
                std::fs::read(key_path)
                    .with_context(|| format!("read client key {}", key_path.display()))?,
            );
            builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
        }
        if tls.skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
    }

    builder.build().context("build backend HTTP client")
}
