//! External machine-health-check observer
//!
//! Collaborator interface answering two questions: should this controller
//! stand down entirely because the cluster runs its own machine health
//! checks, and should a particular node be left alone because an external
//! checker owns it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams};
use kube::{Client, ResourceExt};
use tracing::{debug, warn};

/// Name of the platform-owned machine health check that only handles spot
/// instance termination; its presence alone does not conflict with us
const TERMINATION_HANDLER_MHC: &str = "machine-api-termination-handler";

/// Collaborator contract for external machine-health-check detection
#[async_trait]
pub trait MhcObserver: Send + Sync {
    /// Whether the whole controller must disable itself to avoid fighting
    /// externally configured machine health checks
    async fn need_disable(&self) -> bool;

    /// Whether this particular node is managed by an external checker and
    /// must not be remediated by us
    async fn need_ignore_node(&self, node: &Node) -> bool;
}

/// Used when the cluster has no machine health check machinery at all
pub struct NoopMhcObserver;

#[async_trait]
impl MhcObserver for NoopMhcObserver {
    async fn need_disable(&self) -> bool {
        false
    }

    async fn need_ignore_node(&self, _node: &Node) -> bool {
        false
    }
}

/// Watches `machine.openshift.io/v1beta1 MachineHealthCheck` objects; any
/// user-configured instance disables this controller cluster-wide.
pub struct MachineHealthCheckObserver {
    client: Client,
}

impl MachineHealthCheckObserver {
    #[must_use]
    pub fn new(client: Client) -> Self {
        MachineHealthCheckObserver { client }
    }

    async fn list_mhc_names(&self) -> Vec<String> {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk(
            "machine.openshift.io",
            "v1beta1",
            "MachineHealthCheck",
        ));
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        match api.list(&ListParams::default()).await {
            Ok(list) => list.items.iter().map(ResourceExt::name_any).collect(),
            Err(e) => {
                // can't tell; err on the side of keeping the controller alive
                warn!(error = %e, "failed to list MachineHealthChecks");
                vec![]
            }
        }
    }
}

#[async_trait]
impl MhcObserver for MachineHealthCheckObserver {
    async fn need_disable(&self) -> bool {
        let custom: Vec<String> = self
            .list_mhc_names()
            .await
            .into_iter()
            .filter(|name| name != TERMINATION_HANDLER_MHC)
            .collect();
        if custom.is_empty() {
            return false;
        }
        debug!(?custom, "custom MachineHealthChecks present");
        true
    }

    async fn need_ignore_node(&self, _node: &Node) -> bool {
        // the termination handler only acts on spot instances it marks for
        // deletion; those machines disappear on their own and never reach
        // the unhealthy set long enough to matter
        false
    }
}
