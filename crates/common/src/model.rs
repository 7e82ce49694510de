//! Data model shared between the gateway and its external collaborators.
//!
//! The gateway itself never persists any of these records; endpoints and
//! resource controls are owned by an external data store and consumed through
//! the narrow store traits in the gateway crate.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Identifier of a registered backend endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct EndpointId(pub i64);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend kind and connectivity mode of an endpoint.
///
/// The type is fixed for the lifetime of a proxy built for a request; only
/// the live tunnel address of edge endpoints may change between calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    /// Docker daemon reached over a local Unix socket or named pipe.
    DockerLocal,
    /// Docker daemon reached over HTTP(S), optionally with client TLS.
    DockerHttp,
    /// Docker daemon behind an edge agent, reached through a reverse tunnel.
    DockerEdge,
    /// Kubernetes API server reached with locally privileged credentials.
    KubernetesLocal,
    /// Kubernetes API server behind a (non-edge) agent, HTTPS with a request
    /// signature for mutual authentication.
    KubernetesAgent,
    /// Kubernetes API server behind an edge agent tunnel.
    KubernetesEdge,
}

impl EndpointType {
    /// Canonical snake_case representation, used in logs and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointType::DockerLocal => "docker_local",
            EndpointType::DockerHttp => "docker_http",
            EndpointType::DockerEdge => "docker_edge",
            EndpointType::KubernetesLocal => "kubernetes_local",
            EndpointType::KubernetesAgent => "kubernetes_agent",
            EndpointType::KubernetesEdge => "kubernetes_edge",
        }
    }

    /// True for Docker-backed endpoints of any connectivity mode.
    pub fn is_docker(&self) -> bool {
        matches!(
            self,
            EndpointType::DockerLocal | EndpointType::DockerHttp | EndpointType::DockerEdge
        )
    }

    /// True for endpoints reached through an edge-agent tunnel.
    pub fn is_edge(&self) -> bool {
        matches!(self, EndpointType::DockerEdge | EndpointType::KubernetesEdge)
    }
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// On-disk TLS material for an endpoint connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsMaterial {
    /// CA bundle used to verify the backend certificate.
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
    /// Client certificate presented to the backend.
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// Client private key matching `cert_path`.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// Skip backend certificate verification.
    #[serde(default)]
    pub skip_verify: bool,
}

/// A registered backend cluster or daemon.
///
/// Read-only from the gateway's perspective; created and updated by the
/// external data store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    /// Stable identifier assigned by the data store.
    pub id: EndpointId,
    /// Human-readable name.
    pub name: String,
    /// Backend kind and connectivity mode.
    pub endpoint_type: EndpointType,
    /// Base URL for HTTP(S) endpoints (ignored for local-socket endpoints).
    #[serde(default)]
    pub url: String,
    /// Socket path for local endpoints (`unix://` / `npipe://`).
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    /// TLS material, when the connection requires client TLS.
    #[serde(default)]
    pub tls: Option<TlsMaterial>,
}

/// Backend resource kinds that can carry a resource control.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    /// A container.
    Container,
    /// A named volume.
    Volume,
    /// A network.
    Network,
    /// A swarm service.
    Service,
    /// A stack; other resources may inherit its control through labels.
    Stack,
    /// A swarm secret.
    Secret,
    /// A swarm config.
    Config,
}

impl ResourceType {
    /// Canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Container => "container",
            ResourceType::Volume => "volume",
            ResourceType::Network => "network",
            ResourceType::Service => "service",
            ResourceType::Stack => "stack",
            ResourceType::Secret => "secret",
            ResourceType::Config => "config",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ownership policy attached to a resource control.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase", tag = "mode")]
pub enum Ownership {
    /// Visible to exactly one user.
    Private {
        /// Owning user.
        user_id: i64,
    },
    /// Visible to the listed users and teams.
    Restricted {
        /// Users granted access.
        #[serde(default)]
        user_ids: Vec<i64>,
        /// Teams granted access.
        #[serde(default)]
        team_ids: Vec<i64>,
    },
    /// Visible to every authenticated principal.
    Public,
}

/// Binds one backend resource to an ownership policy.
///
/// At most one control exists per (resource_id, resource_type) pair; lookups
/// finding more than one indicate a data-integrity bug and fall back to the
/// first match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceControl {
    /// Derived stable identifier of the controlled resource.
    pub resource_id: String,
    /// Kind of the controlled resource.
    pub resource_type: ResourceType,
    /// Who may see and act on the resource.
    pub ownership: Ownership,
    /// Identifiers of resources inheriting this control (e.g. containers of
    /// a stack).
    #[serde(default)]
    pub sub_resource_ids: Vec<String>,
}

impl ResourceControl {
    /// Control scoped privately to a single user, as created for freshly
    /// created resources.
    pub fn private(resource_id: impl Into<String>, resource_type: ResourceType, user_id: i64) -> Self {
        Self {
            resource_id: resource_id.into(),
            resource_type,
            ownership: Ownership::Private { user_id },
            sub_resource_ids: Vec::new(),
        }
    }

    /// Whether the given principal is granted access by this control.
    pub fn grants_access(&self, ctx: &SecurityContext) -> bool {
        if ctx.is_admin {
            return true;
        }
        match &self.ownership {
            Ownership::Public => true,
            Ownership::Private { user_id } => *user_id == ctx.user_id,
            Ownership::Restricted { user_ids, team_ids } => {
                user_ids.contains(&ctx.user_id)
                    || team_ids.iter().any(|team| ctx.team_ids.contains(team))
            }
        }
    }
}

/// The authenticated principal a request acts as.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityContext {
    /// User identifier from the session layer.
    pub user_id: i64,
    /// Teams the user belongs to.
    #[serde(default)]
    pub team_ids: Vec<i64>,
    /// Administrators bypass resource-control checks.
    #[serde(default)]
    pub is_admin: bool,
    /// The user's own bearer token, used to impersonate them against
    /// token-issuing services so backend audit logs attribute correctly.
    pub auth_token: String,
}

impl SecurityContext {
    /// Access decision for a resource with an optional control.
    ///
    /// A resource with no control is public to all authenticated principals;
    /// the deny-by-default variant is configuration owned by the external
    /// authorization service, not a gateway invariant.
    pub fn can_access(&self, control: Option<&ResourceControl>) -> bool {
        match control {
            Some(control) => control.grants_access(self),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(user_id: i64, team_ids: Vec<i64>) -> SecurityContext {
        SecurityContext {
            user_id,
            team_ids,
            is_admin: false,
            auth_token: "jwt".to_string(),
        }
    }

    #[test]
    fn private_control_grants_only_the_owner() {
        let control = ResourceControl::private("vol_abc", ResourceType::Volume, 7);
        assert!(control.grants_access(&ctx(7, vec![])));
        assert!(!control.grants_access(&ctx(8, vec![])));
    }

    #[test]
    fn restricted_control_matches_users_and_teams() {
        let control = ResourceControl {
            resource_id: "net_abc".to_string(),
            resource_type: ResourceType::Network,
            ownership: Ownership::Restricted {
                user_ids: vec![1],
                team_ids: vec![3],
            },
            sub_resource_ids: Vec::new(),
        };
        assert!(control.grants_access(&ctx(1, vec![])));
        assert!(control.grants_access(&ctx(2, vec![3])));
        assert!(!control.grants_access(&ctx(2, vec![4])));
    }

    #[test]
    fn admin_bypasses_every_control() {
        let control = ResourceControl::private("vol_abc", ResourceType::Volume, 7);
        let admin = SecurityContext {
            user_id: 99,
            team_ids: vec![],
            is_admin: true,
            auth_token: "jwt".to_string(),
        };
        assert!(control.grants_access(&admin));
    }

    #[test]
    fn missing_control_defaults_to_visible() {
        assert!(ctx(5, vec![]).can_access(None));
    }

    #[test]
    fn endpoint_type_classification() {
        assert!(EndpointType::DockerLocal.is_docker());
        assert!(EndpointType::DockerEdge.is_edge());
        assert!(!EndpointType::KubernetesAgent.is_edge());
        assert!(!EndpointType::KubernetesLocal.is_docker());
        assert_eq!(EndpointType::KubernetesEdge.as_str(), "kubernetes_edge");
    }
}
