//! Volume operation handlers, the representative instantiation of the
//! decoration engine's list/inspect/create/delete pattern.

use common::model::{ResourceType, SecurityContext};
use serde_json::Value;

use super::document::{self, as_object, as_object_mut};
use super::{docker_resource_id, AccessControlEngine};

const LIST_FIELD: &str = "Volumes";
const NAME_FIELD: &str = "Name";

/// Outcome of a single-object rewrite.
#[derive(Debug, PartialEq, Eq)]
pub enum InspectOutcome {
    /// Caller may see the object; the decorated body is returned.
    Allowed(Value),
    /// Caller is denied; the object body must not leak.
    Denied,
}

pub struct VolumeOperations<'a> {
    engine: &'a AccessControlEngine,
    docker_id: &'a str,
    ctx: &'a SecurityContext,
}

impl<'a> VolumeOperations<'a> {
    pub fn new(engine: &'a AccessControlEngine, docker_id: &'a str, ctx: &'a SecurityContext) -> Self {
        Self {
            engine,
            docker_id,
            ctx,
        }
    }

    /// Decorate and filter a volume listing. Items the caller may not see
    /// are removed from the array, not merely flagged; surviving items keep
    /// the backend's order.
    pub async fn rewrite_list(&self, mut body: Value) -> anyhow::Result<Value> {
        let obj = as_object_mut(&mut body)?;
        let items = match obj.remove(LIST_FIELD) {
            Some(Value::Array(items)) => items,
            // No item array: pass the response through unchanged.
            Some(other) => {
                obj.insert(LIST_FIELD.to_string(), other);
                return Ok(body);
            }
            None => return Ok(body),
        };

        let mut surviving = Vec::with_capacity(items.len());
        for mut item in items {
            let visible = {
                let item_obj = as_object_mut(&mut item)?;
                let name = document::required_string(item_obj, NAME_FIELD)?.to_string();
                let resource_id = docker_resource_id(&name, self.docker_id);
                document::decorate(item_obj, &resource_id);
                let labels = document::labels(item_obj).cloned();
                self.engine
                    .authorize(
                        self.ctx,
                        &resource_id,
                        ResourceType::Volume,
                        labels.as_ref(),
                        self.docker_id,
                    )
                    .await?
            };
            if visible {
                surviving.push(item);
            }
        }

        obj.insert(LIST_FIELD.to_string(), Value::Array(surviving));
        Ok(body)
    }

    /// Decorate a single inspected volume, or signal denial without leaking
    /// the object body.
    pub async fn rewrite_inspect(&self, mut body: Value) -> anyhow::Result<InspectOutcome> {
        let obj = as_object_mut(&mut body)?;
        let name = document::required_string(obj, NAME_FIELD)?.to_string();
        let resource_id = docker_resource_id(&name, self.docker_id);
        document::decorate(obj, &resource_id);
        let labels = document::labels(obj).cloned();

        let allowed = self
            .engine
            .authorize(
                self.ctx,
                &resource_id,
                ResourceType::Volume,
                labels.as_ref(),
                self.docker_id,
            )
            .await?;

        if allowed {
            Ok(InspectOutcome::Allowed(body))
        } else {
            Ok(InspectOutcome::Denied)
        }
    }

    /// After a successful backend create: register exactly one private
    /// control for the creating principal and decorate the response.
    pub async fn register_created(&self, mut body: Value) -> anyhow::Result<Value> {
        let resource_id = {
            let obj = as_object_mut(&mut body)?;
            let name = document::required_string(obj, NAME_FIELD)?.to_string();
            let resource_id = docker_resource_id(&name, self.docker_id);
            document::decorate(obj, &resource_id);
            resource_id
        };

        self.engine
            .register_private(&resource_id, ResourceType::Volume, self.ctx.user_id)
            .await?;
        Ok(body)
    }

    /// Access check before a delete is forwarded to the backend. Deletes
    /// address the volume by name only, so there are no labels to inherit
    /// from at this point.
    pub async fn authorize_removal(&self, name: &str) -> anyhow::Result<bool> {
        let resource_id = docker_resource_id(name, self.docker_id);
        self.engine
            .authorize(self.ctx, &resource_id, ResourceType::Volume, None, self.docker_id)
            .await
    }

    /// After a successful backend delete, drop the control row.
    pub async fn forget_removed(&self, name: &str) -> anyhow::Result<()> {
        let resource_id = docker_resource_id(name, self.docker_id);
        self.engine.forget(&resource_id, ResourceType::Volume).await
    }

    /// Name declared by a volume-create request body, used for the conflict
    /// pre-check before the backend call.
    pub fn declared_name(body: &Value) -> anyhow::Result<Option<String>> {
        let obj = as_object(body)?;
        Ok(obj
            .get(NAME_FIELD)
            .and_then(|v| v.as_str())
            .filter(|name| !name.is_empty())
            .map(|name| name.to_string()))
    }
}
