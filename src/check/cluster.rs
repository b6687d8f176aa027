//! Cluster-upgrade probe
//!
//! Collaborator interface telling the reconciler whether the cluster is in
//! the middle of an upgrade, in which case remediation is deferred. Probe
//! failures are treated as "not upgrading" by the caller.

use crate::check::types::Result;
use async_trait::async_trait;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use tracing::debug;

/// Collaborator contract: is the cluster currently upgrading?
#[async_trait]
pub trait UpgradeChecker: Send + Sync {
    async fn check(&self) -> Result<bool>;
}

/// Always answers "not upgrading"; used where no platform upgrade signal
/// exists
pub struct NoopUpgradeChecker;

#[async_trait]
impl UpgradeChecker for NoopUpgradeChecker {
    async fn check(&self) -> Result<bool> {
        Ok(false)
    }
}

/// Reads the OpenShift `ClusterVersion` object and reports an upgrade while
/// its `Progressing` condition is true
pub struct ClusterVersionUpgradeChecker {
    client: Client,
}

impl ClusterVersionUpgradeChecker {
    #[must_use]
    pub fn new(client: Client) -> Self {
        ClusterVersionUpgradeChecker { client }
    }
}

#[async_trait]
impl UpgradeChecker for ClusterVersionUpgradeChecker {
    async fn check(&self) -> Result<bool> {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk(
            "config.openshift.io",
            "v1",
            "ClusterVersion",
        ));
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let Some(version) = api.get_opt("version").await? else {
            debug!("no ClusterVersion object, assuming no upgrade in progress");
            return Ok(false);
        };

        let progressing = version.data["status"]["conditions"]
            .as_array()
            .map_or(false, |conditions| {
                conditions.iter().any(|c| {
                    c["type"].as_str() == Some("Progressing")
                        && c["status"].as_str() == Some("True")
                })
            });
        Ok(progressing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_checker_reports_no_upgrade() {
        assert!(!NoopUpgradeChecker.check().await.unwrap());
    }
}
