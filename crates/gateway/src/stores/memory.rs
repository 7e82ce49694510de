//! In-memory store implementations.
//!
//! Back the tests and the development default of the binary; production
//! deployments wire adapters to the real data store instead.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use common::model::{Endpoint, EndpointId, ResourceControl, ResourceType, SecurityContext};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{EndpointStore, IssuedToken, ResourceControlStore, SessionValidator, SnapshotStore, TokenIssuer};

#[derive(Default)]
pub struct InMemoryEndpointStore {
    endpoints: RwLock<HashMap<EndpointId, Endpoint>>,
}

impl InMemoryEndpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, endpoint: Endpoint) {
        self.endpoints.write().await.insert(endpoint.id, endpoint);
    }
}

#[async_trait]
impl EndpointStore for InMemoryEndpointStore {
    async fn endpoint(&self, id: EndpointId) -> anyhow::Result<Option<Endpoint>> {
        Ok(self.endpoints.read().await.get(&id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryResourceControlStore {
    // Keyed by (resource_id, resource_type); the map key enforces the
    // at-most-one-row invariant structurally.
    controls: RwLock<HashMap<(String, ResourceType), ResourceControl>>,
}

impl InMemoryResourceControlStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.controls.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.controls.read().await.is_empty()
    }
}

#[async_trait]
impl ResourceControlStore for InMemoryResourceControlStore {
    async fn find(
        &self,
        resource_id: &str,
        resource_type: ResourceType,
    ) -> anyhow::Result<Option<ResourceControl>> {
        Ok(self
            .controls
            .read()
            .await
            .get(&(resource_id.to_string(), resource_type))
            .cloned())
    }

    async fn create(&self, control: ResourceControl) -> anyhow::Result<()> {
        let key = (control.resource_id.clone(), control.resource_type);
        // Create-if-absent: the first writer wins.
        self.controls.write().await.entry(key).or_insert(control);
        Ok(())
    }

    async fn delete(
        &self,
        resource_id: &str,
        resource_type: ResourceType,
    ) -> anyhow::Result<()> {
        self.controls
            .write()
            .await
            .remove(&(resource_id.to_string(), resource_type));
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemorySessionValidator {
    sessions: RwLock<HashMap<String, SecurityContext>>,
}

impl InMemorySessionValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, bearer: impl Into<String>, ctx: SecurityContext) {
        self.sessions.write().await.insert(bearer.into(), ctx);
    }
}

#[async_trait]
impl SessionValidator for InMemorySessionValidator {
    async fn validate(&self, bearer: &str) -> anyhow::Result<Option<SecurityContext>> {
        Ok(self.sessions.read().await.get(bearer).cloned())
    }
}

/// Issues opaque random tokens with a fixed lifetime. Stands in for the real
/// token service in tests and development.
pub struct StaticTokenIssuer {
    ttl: Duration,
    issued: RwLock<u64>,
}

impl StaticTokenIssuer {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            issued: RwLock::new(0),
        }
    }

    /// Number of tokens minted so far; used by tests asserting cache reuse.
    pub async fn issued_count(&self) -> u64 {
        *self.issued.read().await
    }
}

#[async_trait]
impl TokenIssuer for StaticTokenIssuer {
    async fn issue(
        &self,
        _endpoint: &Endpoint,
        ctx: &SecurityContext,
    ) -> anyhow::Result<IssuedToken> {
        let mut issued = self.issued.write().await;
        *issued += 1;
        Ok(IssuedToken {
            token: format!("tok-{}-{}", ctx.user_id, Uuid::new_v4()),
            expires_at: Utc::now() + self.ttl,
        })
    }
}

#[derive(Default)]
pub struct InMemorySnapshotStore {
    docker_ids: RwLock<HashMap<EndpointId, String>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_docker_id(&self, endpoint: EndpointId, docker_id: impl Into<String>) {
        self.docker_ids
            .write()
            .await
            .insert(endpoint, docker_id.into());
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn docker_id(&self, endpoint: EndpointId) -> anyhow::Result<Option<String>> {
        Ok(self.docker_ids.read().await.get(&endpoint).cloned())
    }
}

/// Convenience bundle used by the binary's development wiring and by tests.
#[derive(Clone)]
pub struct MemoryStores {
    pub endpoints: Arc<InMemoryEndpointStore>,
    pub controls: Arc<InMemoryResourceControlStore>,
    pub sessions: Arc<InMemorySessionValidator>,
    pub issuer: Arc<StaticTokenIssuer>,
    pub snapshots: Arc<InMemorySnapshotStore>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self {
            endpoints: Arc::new(InMemoryEndpointStore::new()),
            controls: Arc::new(InMemoryResourceControlStore::new()),
            sessions: Arc::new(InMemorySessionValidator::new()),
            issuer: Arc::new(StaticTokenIssuer::new(Duration::minutes(10))),
            snapshots: Arc::new(InMemorySnapshotStore::new()),
        }
    }
}

impl Default for MemoryStores {
    fn default() -> Self {
        Self::new()
    }
}
