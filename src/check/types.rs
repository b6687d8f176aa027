//! Shared controller types: error enum, result alias and reconcile context

use crate::check::cluster::UpgradeChecker;
use crate::check::config::ControllerConfig;
use crate::check::metrics::Metrics;
use crate::check::mhc::MhcObserver;
use crate::crds::HealthCheckPolicy;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::Resource;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Identity this controller acts as: event reporter, lease holder and
/// `app.kubernetes.io/part-of` label value on request objects
pub const CONTROLLER_NAME: &str = "node-healthcheck-controller";

/// Event reasons surfaced on the policy
pub const EVENT_REASON_REMEDIATION_CREATED: &str = "RemediationCreated";
pub const EVENT_REASON_REMEDIATION_SKIPPED: &str = "RemediationSkipped";
pub const EVENT_REASON_REMEDIATION_REMOVED: &str = "RemediationRemoved";
pub const EVENT_REASON_DISABLED: &str = "Disabled";
pub const EVENT_REASON_ENABLED: &str = "Enabled";

/// Errors surfaced by the health-check reconciler
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("remediation template {kind} {namespace}/{name} not found")]
    TemplateNotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    #[error("remediation template {kind} {namespace}/{name} has no spec.template")]
    TemplateMalformed {
        kind: String,
        name: String,
        namespace: String,
    },

    #[error("remediation template {kind} {namespace}/{name} is invalid: {reason}")]
    TemplateInvalid {
        kind: String,
        name: String,
        namespace: String,
        reason: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Reason string for the Disabled condition when this error is a
    /// policy-scoped template problem; `None` for transient errors
    #[must_use]
    pub fn disable_reason(&self) -> Option<&'static str> {
        match self {
            Error::TemplateNotFound { .. } => Some(crate::crds::healthcheckpolicy::REASON_TEMPLATE_NOT_FOUND),
            Error::TemplateMalformed { .. } | Error::TemplateInvalid { .. } => {
                Some(crate::crds::healthcheckpolicy::REASON_TEMPLATE_INVALID)
            }
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Timestamps in status fields and annotations are RFC3339 strings
#[must_use]
pub fn rfc3339(t: chrono::DateTime<chrono::Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Parse an RFC3339 status timestamp; `None` for anything unreadable
#[must_use]
pub fn parse_rfc3339(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&chrono::Utc))
}

/// Shared reconcile context, handed to every reconcile as `Arc<Context>`
pub struct Context {
    /// Kubernetes client
    pub client: kube::Client,
    /// Controller tunables
    pub config: Arc<ControllerConfig>,
    /// Event recorder publishing as this controller
    pub recorder: Recorder,
    /// Metrics registry
    pub metrics: Metrics,
    /// Cluster-upgrade probe collaborator
    pub upgrade_checker: Arc<dyn UpgradeChecker>,
    /// External machine-health-check observer collaborator
    pub mhc_observer: Arc<dyn MhcObserver>,
}

impl Context {
    /// Publish an event on the policy. Event emission is a single-shot
    /// idempotent write: failures are logged and left to the next reconcile.
    pub async fn emit_event(
        &self,
        policy: &HealthCheckPolicy,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &policy.object_ref(&())).await {
            warn!(error = %e, reason, "failed to publish event");
        }
    }
}
