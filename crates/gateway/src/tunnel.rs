//! Registry of live edge-agent tunnel addresses.
//!
//! Edge agents maintain a reverse connection; the address a proxy must dial
//! changes whenever the tunnel reconnects, so it is resolved per call rather
//! than captured at proxy construction.

use std::{collections::HashMap, sync::Arc, time::Duration};

use common::model::EndpointId;
use metrics::gauge;
use tokio::sync::RwLock;
use tokio::time::{self, Instant};

#[derive(Clone, Debug)]
pub struct TunnelAddress {
    pub address: String,
    pub connected_at: Instant,
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("no active tunnel for endpoint")]
    NotConnected,
}

/// Lightweight registry for active edge tunnels.
#[derive(Clone, Default)]
pub struct TunnelRegistry {
    inner: Arc<RwLock<HashMap<EndpointId, TunnelAddress>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, endpoint: EndpointId, address: impl Into<String>) {
        let mut guard = self.inner.write().await;
        guard.insert(
            endpoint,
            TunnelAddress {
                address: address.into(),
                connected_at: Instant::now(),
            },
        );
        gauge!("gateway_tunnel_sessions").set(guard.len() as f64);
    }

    pub async fn remove(&self, endpoint: EndpointId) {
        let mut guard = self.inner.write().await;
        guard.remove(&endpoint);
        gauge!("gateway_tunnel_sessions").set(guard.len() as f64);
    }

    pub async fn current(&self, endpoint: EndpointId) -> Option<String> {
        self.inner
            .read()
            .await
            .get(&endpoint)
            .map(|tunnel| tunnel.address.clone())
    }

    /// Resolve the live tunnel address, polling until the agent has
    /// (re)connected or `wait` elapses. This is the one place a request can
    /// stall; the caller's own context deadline still bounds it.
    pub async fn resolve_address(
        &self,
        endpoint: EndpointId,
        wait: Duration,
        poll_interval: Duration,
    ) -> Result<String, TunnelError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(address) = self.current(endpoint).await {
                return Ok(address);
            }
            if Instant::now() >= deadline {
                return Err(TunnelError::NotConnected);
            }
            time::sleep(poll_interval.min(deadline.saturating_duration_since(Instant::now())))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_returns_current_address_immediately() {
        let registry = TunnelRegistry::new();
        registry.upsert(EndpointId(1), "127.0.0.1:40001").await;

        let address = registry
            .resolve_address(
                EndpointId(1),
                Duration::from_secs(1),
                Duration::from_millis(10),
            )
            .await
            .expect("address");
        assert_eq!(address, "127.0.0.1:40001");
    }

    #[tokio::test]
    async fn resolve_waits_for_late_connection() {
        let registry = TunnelRegistry::new();
        let registry_for_agent = registry.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(50)).await;
            registry_for_agent.upsert(EndpointId(2), "127.0.0.1:40002").await;
        });

        let address = registry
            .resolve_address(
                EndpointId(2),
                Duration::from_secs(2),
                Duration::from_millis(10),
            )
            .await
            .expect("address");
        assert_eq!(address, "127.0.0.1:40002");
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_times_out_when_agent_never_connects() {
        let registry = TunnelRegistry::new();
        let err = registry
            .resolve_address(
                EndpointId(3),
                Duration::from_secs(1),
                Duration::from_millis(100),
            )
            .await
            .expect_err("timeout");
        assert!(matches!(err, TunnelError::NotConnected));
    }

    #[tokio::test]
    async fn reconnect_replaces_the_address() {
        let registry = TunnelRegistry::new();
        registry.upsert(EndpointId(4), "127.0.0.1:40001").await;
        registry.upsert(EndpointId(4), "127.0.0.1:40009").await;
        assert_eq!(
            registry.current(EndpointId(4)).await.as_deref(),
            Some("127.0.0.1:40009")
        );

        registry.remove(EndpointId(4)).await;
        assert!(registry.current(EndpointId(4)).await.is_none());
    }
}
