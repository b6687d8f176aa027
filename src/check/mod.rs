//! Health-check controller wiring
//!
//! Builds the reconcile context and runs the `HealthCheckPolicy` controller
//! with a node watch feeding it reconcile requests through the
//! condition-change mapper.

use crate::crds::HealthCheckPolicy;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::runtime::controller::Controller;
use kube::runtime::events::{Recorder, Reporter};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

pub mod cluster;
pub mod config;
pub mod controller;
pub mod escalation;
pub mod health;
pub mod lease;
pub mod metrics;
pub mod mhc;
pub mod template;
pub mod types;
pub mod watch;

// Re-export commonly used items
pub use config::ControllerConfig;
pub use controller::{error_policy, reconcile};
pub use metrics::Metrics;
pub use types::{Context, Error, Result, CONTROLLER_NAME};

use cluster::{ClusterVersionUpgradeChecker, NoopUpgradeChecker, UpgradeChecker};
use mhc::{MachineHealthCheckObserver, MhcObserver, NoopMhcObserver};
use watch::NodeMapper;

/// Assemble the reconcile context for the given configuration.
///
/// On OpenShift-integrated clusters the real upgrade probe and machine
/// health check observer are wired in; everywhere else both are inert.
#[must_use]
pub fn build_context(client: Client, config: ControllerConfig, metrics: Metrics) -> Context {
    let reporter = Reporter {
        controller: CONTROLLER_NAME.into(),
        instance: std::env::var("HOSTNAME").ok(),
    };
    let recorder = Recorder::new(client.clone(), reporter);

    let (upgrade_checker, mhc_observer): (Arc<dyn UpgradeChecker>, Arc<dyn MhcObserver>) =
        if config.openshift_integration {
            (
                Arc::new(ClusterVersionUpgradeChecker::new(client.clone())),
                Arc::new(MachineHealthCheckObserver::new(client.clone())),
            )
        } else {
            (Arc::new(NoopUpgradeChecker), Arc::new(NoopMhcObserver))
        };

    Context {
        client,
        config: Arc::new(config),
        recorder,
        metrics,
        upgrade_checker,
        mhc_observer,
    }
}

/// Run the `HealthCheckPolicy` controller until the process shuts down
#[instrument(skip(client, context))]
pub async fn run_health_controller(client: Client, context: Arc<Context>) -> Result<()> {
    info!("Starting HealthCheckPolicy controller");

    let policies: Api<HealthCheckPolicy> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());

    // Startup visibility: list existing policies so the logs show what the
    // controller is about to manage
    match policies.list(&ListParams::default()).await {
        Ok(list) => {
            info!("Controller startup: found {} HealthCheckPolicy(s)", list.items.len());
            for policy in list.items {
                let phase = policy
                    .status
                    .as_ref()
                    .and_then(|s| s.phase)
                    .map_or_else(String::new, |p| format!("{p:?}"));
                info!(
                    "Existing HealthCheckPolicy: name={}, phase='{}'",
                    policy.name_any(),
                    phase
                );
            }
        }
        Err(e) => {
            error!("Failed to list HealthCheckPolicies at startup: {}", e);
        }
    }

    let watcher_config = Config::default().any_semantic();
    let policy_controller = Controller::new(policies, watcher_config.clone());
    let mapper = NodeMapper::new(policy_controller.store());

    policy_controller
        .watches(nodes, watcher_config, move |node| mapper.map(&node))
        .run(reconcile, error_policy, context)
        .for_each(|reconciliation_result| async move {
            match reconciliation_result {
                Ok(policy) => {
                    debug!(resource = ?policy, "HealthCheckPolicy reconciliation successful");
                }
                Err(e) => {
                    error!(error = ?e, "HealthCheckPolicy reconciliation error");
                }
            }
        })
        .await;

    info!("HealthCheckPolicy controller shutting down");
    Ok(())
}
