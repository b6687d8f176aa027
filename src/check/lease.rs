//! Per-node coordination leases
//!
//! A `coordination.k8s.io/v1` Lease per node arbitrates who may drive that
//! node's remediation: this controller, another instance of it, or an
//! external remediator. The lease is acquired before a request object is
//! created, renewed on every reconcile while remediation is in flight, and
//! released once nothing is in flight any more.
//!
//! There is no background renewal task; all renewal happens inside the
//! reconcile that needs the lease, and a requeue hint covers the gap.

use crate::check::config::ControllerConfig;
use crate::check::types::{Result, CONTROLLER_NAME};
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, DeleteParams, PostParams};
use kube::core::ObjectMeta;
use kube::{Client, Error as KubeError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of an acquire attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseOutcome {
    /// Whether we now hold the lease
    pub acquired: bool,
    /// When to try again if we do not
    pub requeue_after: Option<Duration>,
}

impl LeaseOutcome {
    fn acquired() -> Self {
        LeaseOutcome {
            acquired: true,
            requeue_after: None,
        }
    }

    fn contended(retry: Duration) -> Self {
        LeaseOutcome {
            acquired: false,
            requeue_after: Some(retry),
        }
    }
}

/// Observed state of an existing lease relative to a holder identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// We are the recorded holder
    HeldByUs,
    /// Someone else holds it and it has not expired
    HeldByOther,
    /// Expired, or too malformed to be trusted; free to take over
    Expired,
}

/// Classify a lease. Missing spec fields make the lease untrustworthy and
/// therefore takeable.
#[must_use]
pub fn lease_state(lease: &Lease, holder: &str, now: DateTime<Utc>) -> LeaseState {
    let Some(spec) = &lease.spec else {
        return LeaseState::Expired;
    };
    if spec.holder_identity.as_deref() == Some(holder) {
        return LeaseState::HeldByUs;
    }
    let (Some(renew_time), Some(duration_seconds)) =
        (&spec.renew_time, spec.lease_duration_seconds)
    else {
        return LeaseState::Expired;
    };
    if now - renew_time.0 >= chrono::Duration::seconds(i64::from(duration_seconds)) {
        LeaseState::Expired
    } else {
        LeaseState::HeldByOther
    }
}

/// Manages the per-node coordination leases
pub struct NodeLeaseManager {
    client: Client,
    namespace: String,
    holder: String,
    default_duration: Duration,
    buffer: Duration,
    retry: Duration,
}

impl NodeLeaseManager {
    #[must_use]
    pub fn new(client: Client, config: &ControllerConfig) -> Self {
        NodeLeaseManager {
            client,
            namespace: config.lease.namespace.clone(),
            holder: CONTROLLER_NAME.to_string(),
            default_duration: Duration::from_secs(config.lease.duration_seconds),
            buffer: Duration::from_secs(config.lease.buffer_seconds),
            retry: config.lease_retry_interval(),
        }
    }

    /// Deterministic lease name for a node
    #[must_use]
    pub fn lease_name(node_name: &str) -> String {
        format!("node-{node_name}")
    }

    /// Hold duration covering the current escalation step plus the safety
    /// buffer: `max(step timeout, default duration) + buffer`
    #[must_use]
    pub fn effective_hold(&self, step_timeout: Option<chrono::Duration>) -> Duration {
        let step = step_timeout
            .and_then(|t| t.to_std().ok())
            .unwrap_or(Duration::ZERO);
        step.max(self.default_duration) + self.buffer
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn lease_spec(&self, hold: Duration, acquire_time: MicroTime, now: DateTime<Utc>) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.holder.clone()),
            lease_duration_seconds: Some(ceil_seconds(hold)),
            acquire_time: Some(acquire_time),
            renew_time: Some(MicroTime(now)),
            lease_transitions: None,
            ..Default::default()
        }
    }

    /// Acquire or renew the lease for a node.
    ///
    /// Creates a missing lease, renews our own, takes over an expired one,
    /// and reports contention (with a retry hint) for a live foreign one.
    /// A write conflict with a concurrent actor also reports contention.
    pub async fn acquire(
        &self,
        node_name: &str,
        step_timeout: Option<chrono::Duration>,
    ) -> Result<LeaseOutcome> {
        let api = self.api();
        let name = Self::lease_name(node_name);
        let now = Utc::now();
        let hold = self.effective_hold(step_timeout);

        let Some(existing) = api.get_opt(&name).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(self.namespace.clone()),
                    ..Default::default()
                },
                spec: Some(self.lease_spec(hold, MicroTime(now), now)),
            };
            return match api.create(&PostParams::default(), &lease).await {
                Ok(_) => {
                    info!(lease = %name, "acquired node lease");
                    Ok(LeaseOutcome::acquired())
                }
                Err(KubeError::Api(e)) if e.code == 409 => {
                    debug!(lease = %name, "lease created concurrently, backing off");
                    Ok(LeaseOutcome::contended(self.retry))
                }
                Err(e) => Err(e.into()),
            };
        };

        match lease_state(&existing, &self.holder, now) {
            LeaseState::HeldByOther => {
                let holder = existing
                    .spec
                    .as_ref()
                    .and_then(|s| s.holder_identity.clone())
                    .unwrap_or_default();
                debug!(lease = %name, holder = %holder, "lease held by another actor");
                Ok(LeaseOutcome::contended(self.retry))
            }
            state @ (LeaseState::HeldByUs | LeaseState::Expired) => {
                // renewal keeps the original acquire time; takeover resets it
                let acquire_time = match state {
                    LeaseState::HeldByUs => existing
                        .spec
                        .as_ref()
                        .and_then(|s| s.acquire_time.clone())
                        .unwrap_or(MicroTime(now)),
                    _ => MicroTime(now),
                };
                let mut updated = existing;
                updated.spec = Some(self.lease_spec(hold, acquire_time, now));
                match api.replace(&name, &PostParams::default(), &updated).await {
                    Ok(_) => {
                        if state == LeaseState::Expired {
                            info!(lease = %name, "took over expired node lease");
                        }
                        Ok(LeaseOutcome::acquired())
                    }
                    Err(KubeError::Api(e)) if e.code == 409 => {
                        debug!(lease = %name, "lease update conflicted, backing off");
                        Ok(LeaseOutcome::contended(self.retry))
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Delete the node's lease iff we are the recorded holder; anything
    /// else is a no-op.
    pub async fn release(&self, node_name: &str) -> Result<()> {
        let api = self.api();
        let name = Self::lease_name(node_name);

        let Some(existing) = api.get_opt(&name).await? else {
            return Ok(());
        };
        let holder = existing
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.holder.as_str()) {
            debug!(lease = %name, ?holder, "not our lease, leaving it alone");
            return Ok(());
        }

        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(lease = %name, "released node lease");
                Ok(())
            }
            Err(KubeError::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => {
                warn!(lease = %name, error = %e, "failed to release node lease");
                Err(e.into())
            }
        }
    }
}

fn ceil_seconds(duration: Duration) -> i32 {
    let mut seconds = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        seconds += 1;
    }
    i32::try_from(seconds).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::config::ControllerConfig;

    fn lease(holder: Option<&str>, renewed: Option<DateTime<Utc>>, duration: Option<i32>) -> Lease {
        Lease {
            metadata: ObjectMeta::default(),
            spec: Some(LeaseSpec {
                holder_identity: holder.map(String::from),
                lease_duration_seconds: duration,
                acquire_time: renewed.map(MicroTime),
                renew_time: renewed.map(MicroTime),
                lease_transitions: None,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_lease_state_held_by_us() {
        let now = Utc::now();
        let lease = lease(Some(CONTROLLER_NAME), Some(now), Some(30));
        assert_eq!(lease_state(&lease, CONTROLLER_NAME, now), LeaseState::HeldByUs);
    }

    #[test]
    fn test_lease_state_foreign_live() {
        let now = Utc::now();
        let lease = lease(Some("someone-else"), Some(now - chrono::Duration::seconds(10)), Some(30));
        assert_eq!(
            lease_state(&lease, CONTROLLER_NAME, now),
            LeaseState::HeldByOther
        );
    }

    #[test]
    fn test_lease_state_foreign_expired() {
        let now = Utc::now();
        let lease = lease(Some("someone-else"), Some(now - chrono::Duration::seconds(31)), Some(30));
        assert_eq!(lease_state(&lease, CONTROLLER_NAME, now), LeaseState::Expired);
    }

    #[test]
    fn test_lease_state_expiry_boundary() {
        let now = Utc::now();
        // exactly duration old: expired
        let at = lease(Some("someone-else"), Some(now - chrono::Duration::seconds(30)), Some(30));
        assert_eq!(lease_state(&at, CONTROLLER_NAME, now), LeaseState::Expired);
    }

    #[test]
    fn test_lease_state_malformed_is_takeable() {
        let now = Utc::now();
        let no_spec = Lease {
            metadata: ObjectMeta::default(),
            spec: None,
        };
        assert_eq!(lease_state(&no_spec, CONTROLLER_NAME, now), LeaseState::Expired);

        let no_renew = lease(Some("someone-else"), None, Some(30));
        assert_eq!(lease_state(&no_renew, CONTROLLER_NAME, now), LeaseState::Expired);
    }

    #[test]
    fn test_lease_name_is_deterministic() {
        assert_eq!(NodeLeaseManager::lease_name("worker-1"), "node-worker-1");
    }

    #[test]
    fn test_ceil_seconds_rounds_up() {
        assert_eq!(ceil_seconds(Duration::from_secs(30)), 30);
        assert_eq!(ceil_seconds(Duration::from_millis(30_500)), 31);
    }

    fn manager() -> NodeLeaseManager {
        // client is never used by the pure helpers under test
        let config = ControllerConfig::default();
        NodeLeaseManager {
            client: unreachable_client(),
            namespace: config.lease.namespace.clone(),
            holder: CONTROLLER_NAME.to_string(),
            default_duration: Duration::from_secs(config.lease.duration_seconds),
            buffer: Duration::from_secs(config.lease.buffer_seconds),
            retry: config.lease_retry_interval(),
        }
    }

    fn unreachable_client() -> Client {
        // points at a non-routable endpoint; pure helpers never dial it
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        Client::try_from(config).unwrap()
    }

    #[tokio::test]
    async fn test_effective_hold_takes_longer_of_step_and_default() {
        let mgr = manager();
        // default 60s + 5s buffer beats a 5s step
        assert_eq!(
            mgr.effective_hold(Some(chrono::Duration::seconds(5))),
            Duration::from_secs(65)
        );
        // a 10m step beats the default
        assert_eq!(
            mgr.effective_hold(Some(chrono::Duration::minutes(10))),
            Duration::from_secs(605)
        );
        // no step timeout at all: default + buffer
        assert_eq!(mgr.effective_hold(None), Duration::from_secs(65));
    }
}
