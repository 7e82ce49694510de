//! Narrow interfaces to external collaborators.
//!
//! Persistent storage of users, endpoints, and resource controls, session
//! validation, and cluster token issuance are owned by external services.
//! The gateway consumes them through these traits only.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::model::{Endpoint, EndpointId, ResourceControl, ResourceType, SecurityContext};

pub mod memory;

/// Read access to registered endpoints.
#[async_trait]
pub trait EndpointStore: Send + Sync {
    async fn endpoint(&self, id: EndpointId) -> anyhow::Result<Option<Endpoint>>;
}

/// Read/write access to individual resource-control rows.
///
/// `create` is best-effort create-if-absent: two concurrent creates of the
/// same resource may briefly race in the external store, which is an accepted
/// edge case rather than something the gateway serializes.
#[async_trait]
pub trait ResourceControlStore: Send + Sync {
    async fn find(
        &self,
        resource_id: &str,
        resource_type: ResourceType,
    ) -> anyhow::Result<Option<ResourceControl>>;

    async fn create(&self, control: ResourceControl) -> anyhow::Result<()>;

    async fn delete(
        &self,
        resource_id: &str,
        resource_type: ResourceType,
    ) -> anyhow::Result<()>;
}

/// Resolves a bearer token into the authenticated principal.
#[async_trait]
pub trait SessionValidator: Send + Sync {
    async fn validate(&self, bearer: &str) -> anyhow::Result<Option<SecurityContext>>;
}

/// A short-lived cluster credential minted for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl IssuedToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Mints per-cluster credentials impersonating the calling user.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(
        &self,
        endpoint: &Endpoint,
        ctx: &SecurityContext,
    ) -> anyhow::Result<IssuedToken>;
}

/// Periodically refreshed environment snapshots; consulted before a live
/// `Info` call when deriving the Docker cluster identifier.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn docker_id(&self, endpoint: EndpointId) -> anyhow::Result<Option<String>>;
}
