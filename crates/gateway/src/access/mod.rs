//! Access-control decoration engine.
//!
//! The backends have no notion of ownership; this engine derives a stable
//! resource identifier for each backend object, matches it against the
//! resource-control table, and filters, blocks, or decorates accordingly.

use std::sync::Arc;

use common::model::{ResourceControl, ResourceType, SecurityContext};
use serde_json::Map;
use thiserror::Error;

use crate::stores::ResourceControlStore;

pub mod document;
pub mod volumes;

/// Swarm stacks label their resources with the stack namespace.
pub const STACK_LABEL_SWARM: &str = "com.docker.stack.namespace";
/// Compose stacks label their resources with the project name.
pub const STACK_LABEL_COMPOSE: &str = "com.docker.compose.project";

#[derive(Debug, Error)]
pub enum DecorationError {
    #[error("backend response is missing field {0}")]
    MissingField(&'static str),
    #[error("backend response is not a JSON object")]
    NotAnObject,
}

/// Docker resource IDs are salted with the daemon/cluster identifier so
/// same-named objects on different clusters never collide.
pub fn docker_resource_id(name: &str, docker_id: &str) -> String {
    format!("{name}_{docker_id}")
}

#[derive(Clone)]
pub struct AccessControlEngine {
    controls: Arc<dyn ResourceControlStore>,
}

impl AccessControlEngine {
    pub fn new(controls: Arc<dyn ResourceControlStore>) -> Self {
        Self { controls }
    }

    pub fn controls(&self) -> &Arc<dyn ResourceControlStore> {
        &self.controls
    }

    /// The control governing a resource: its own row first, then a control
    /// inherited from the stack named by its labels, then none.
    pub async fn effective_control(
        &self,
        resource_id: &str,
        resource_type: ResourceType,
        labels: Option<&Map<String, serde_json::Value>>,
        docker_id: &str,
    ) -> anyhow::Result<Option<ResourceControl>> {
        if let Some(control) = self.controls.find(resource_id, resource_type).await? {
            return Ok(Some(control));
        }

        if let Some(stack_name) = labels.and_then(stack_label) {
            let stack_id = docker_resource_id(stack_name, docker_id);
            if let Some(control) = self.controls.find(&stack_id, ResourceType::Stack).await? {
                return Ok(Some(control));
            }
        }

        Ok(None)
    }

    /// Access decision for one resource. Absent control means visible.
    pub async fn authorize(
        &self,
        ctx: &SecurityContext,
        resource_id: &str,
        resource_type: ResourceType,
        labels: Option<&Map<String, serde_json::Value>>,
        docker_id: &str,
    ) -> anyhow::Result<bool> {
        let control = self
            .effective_control(resource_id, resource_type, labels, docker_id)
            .await?;
        Ok(ctx.can_access(control.as_ref()))
    }

    /// Registers the private control created for a freshly created resource.
    /// Best-effort create-if-absent; the store's first writer wins.
    pub async fn register_private(
        &self,
        resource_id: &str,
        resource_type: ResourceType,
        user_id: i64,
    ) -> anyhow::Result<()> {
        self.controls
            .create(ResourceControl::private(resource_id, resource_type, user_id))
            .await
    }

    /// Removes the control row of a deleted resource so it does not orphan.
    pub async fn forget(&self, resource_id: &str, resource_type: ResourceType) -> anyhow::Result<()> {
        self.controls.delete(resource_id, resource_type).await
    }
}

fn stack_label(labels: &Map<String, serde_json::Value>) -> Option<&str> {
    labels
        .get(STACK_LABEL_SWARM)
        .or_else(|| labels.get(STACK_LABEL_COMPOSE))
        .and_then(|v| v.as_str())
        .filter(|name| !name.is_empty())
}
