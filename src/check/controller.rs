//! Top-level `HealthCheckPolicy` reconciler
//!
//! Level-triggered: each pass loads the selected nodes, partitions them
//! into healthy and unhealthy, applies the safety gates, fans unhealthy
//! nodes out into the escalation engine, cleans up after recovered nodes,
//! and finally writes the policy status when it changed. All time-based
//! behaviour is expressed as requeue hints; the periodic resync bounds
//! detection latency when no events arrive.

use crate::check::escalation::{clear_node, merge_requeue, remediate_node};
use crate::check::health::{is_node_healthy, next_unhealthy_transition};
use crate::check::template::{build_remediation_request, owned_by_policy, request_api};
use crate::check::types::{
    rfc3339, Context, Error, Result, EVENT_REASON_DISABLED, EVENT_REASON_ENABLED,
    EVENT_REASON_REMEDIATION_SKIPPED,
};
use crate::check::watch::selector_matches;
use crate::crds::healthcheckpolicy::{
    scaled_min_healthy, CONDITION_TYPE_DISABLED, REASON_CONFLICTING_MHC,
};
use crate::crds::{
    HealthCheckPolicy, HealthCheckPolicyStatus, PolicyCondition, PolicyPhase, UnhealthyNodeStatus,
};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Error as KubeError, ResourceExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, error, info, instrument, warn};

/// Labels that mark a node as part of the control plane
const CONTROL_PLANE_LABELS: [&str; 2] = [
    "node-role.kubernetes.io/control-plane",
    "node-role.kubernetes.io/master",
];

/// Requeue applied after a failed reconcile
const ERROR_REQUEUE: StdDuration = StdDuration::from_secs(10);

fn is_control_plane(node: &Node) -> bool {
    CONTROL_PLANE_LABELS
        .iter()
        .any(|label| node.labels().contains_key(*label))
}

/// Quorum protection: among unhealthy control-plane nodes, at most one may
/// be remediated at a time. Candidates are `(name, control-plane,
/// already-remediating)`; the returned names sit this reconcile out.
fn control_plane_skips(candidates: &[(String, bool, bool)]) -> HashSet<String> {
    let control_plane: Vec<&(String, bool, bool)> =
        candidates.iter().filter(|(_, cp, _)| *cp).collect();
    if control_plane.len() <= 1 {
        return HashSet::new();
    }

    let in_flight: Vec<&str> = control_plane
        .iter()
        .filter(|(_, _, remediating)| *remediating)
        .map(|(name, _, _)| name.as_str())
        .collect();
    let allowed: HashSet<&str> = if in_flight.is_empty() {
        control_plane
            .iter()
            .map(|(name, _, _)| name.as_str())
            .min()
            .into_iter()
            .collect()
    } else {
        in_flight.into_iter().collect()
    };

    control_plane
        .iter()
        .filter(|(name, _, _)| !allowed.contains(name.as_str()))
        .map(|(name, _, _)| name.clone())
        .collect()
}

/// Why remediation is (not) allowed to proceed this pass
#[derive(Debug, PartialEq, Eq)]
enum RemediationGate {
    Proceed,
    BelowMinHealthy { healthy: usize, required: i32 },
    Paused,
    Upgrading,
}

fn evaluate_gates(
    healthy: usize,
    min_healthy: i32,
    paused: bool,
    upgrading: bool,
) -> RemediationGate {
    if i64::try_from(healthy).unwrap_or(i64::MAX) < i64::from(min_healthy) {
        return RemediationGate::BelowMinHealthy {
            healthy,
            required: min_healthy,
        };
    }
    if paused {
        return RemediationGate::Paused;
    }
    if upgrading {
        return RemediationGate::Upgrading;
    }
    RemediationGate::Proceed
}

/// Phase for this pass. `gated` means a safety gate (min-healthy, upgrade)
/// blocked remediation this reconcile: the policy reports Enabled even
/// while attempt records from earlier passes are still carried in status.
fn compute_phase(paused: bool, gated: bool, remediating: bool) -> PolicyPhase {
    if paused {
        PolicyPhase::Paused
    } else if gated {
        PolicyPhase::Enabled
    } else if remediating {
        PolicyPhase::Remediating
    } else {
        PolicyPhase::Enabled
    }
}

/// Set the Disabled condition, keeping the existing transition time when
/// the same reason is already recorded so status writes stay idempotent.
/// Returns whether the condition actually changed.
fn set_disabled_condition(
    status: &mut HealthCheckPolicyStatus,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> bool {
    let already_set = status.conditions.iter().any(|c| {
        c.condition_type == CONDITION_TYPE_DISABLED
            && c.status == "True"
            && c.reason.as_deref() == Some(reason)
    });
    if already_set {
        return false;
    }
    status.conditions = vec![PolicyCondition {
        condition_type: CONDITION_TYPE_DISABLED.to_string(),
        status: "True".to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_transition_time: Some(rfc3339(now)),
    }];
    true
}

fn disabled_reason(status: &HealthCheckPolicyStatus) -> Option<String> {
    status
        .conditions
        .iter()
        .find(|c| c.condition_type == CONDITION_TYPE_DISABLED && c.status == "True")
        .and_then(|c| c.reason.clone())
}

/// Write the status subresource, but only when the content changed. A
/// write conflict means a newer reconcile is already queued; it is not an
/// error.
async fn patch_policy_status(
    ctx: &Context,
    policy: &HealthCheckPolicy,
    status: HealthCheckPolicyStatus,
) -> Result<()> {
    let current = policy.status.clone().unwrap_or_default();
    if current == status {
        debug!(policy = %policy.name_any(), "status unchanged, skipping write");
        return Ok(());
    }

    let api: Api<HealthCheckPolicy> = Api::all(ctx.client.clone());
    let mut updated = policy.clone();
    updated.status = Some(status);
    let data = serde_json::to_vec(&updated)?;
    match api
        .replace_status(&policy.name_any(), &PostParams::default(), data)
        .await
    {
        Ok(_) => Ok(()),
        Err(KubeError::Api(e)) if e.code == 409 => {
            debug!(policy = %policy.name_any(), "status write conflicted, deferring to redelivery");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// All request objects currently owned by this policy, as
/// name -> creation time
async fn in_flight_census(
    ctx: &Context,
    policy: &HealthCheckPolicy,
) -> Result<BTreeMap<String, String>> {
    let mut census = BTreeMap::new();
    let mut listed: HashSet<(String, String, String)> = HashSet::new();

    for template in policy.spec.template_refs() {
        let key = (
            template.api_version.clone(),
            template.remediation_kind().to_string(),
            template.namespace.clone(),
        );
        if !listed.insert(key) {
            continue;
        }
        let api = request_api(&ctx.client, template);
        let list = match api.list(&ListParams::default()).await {
            Ok(list) => list,
            // the remediation CRD may not be installed yet
            Err(KubeError::Api(e)) if e.code == 404 => continue,
            Err(e) => return Err(e.into()),
        };
        for obj in list {
            if !owned_by_policy(&obj, policy) {
                continue;
            }
            let created = obj
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| rfc3339(t.0))
                .unwrap_or_default();
            census.insert(obj.name_any(), created);
        }
    }
    Ok(census)
}

async fn is_cluster_upgrading(ctx: &Context) -> bool {
    match ctx.upgrade_checker.check().await {
        Ok(upgrading) => upgrading,
        Err(e) => {
            // if we cannot tell, continue as if no upgrade is running
            error!(error = %e, "cluster upgrade probe failed, assuming no upgrade");
            false
        }
    }
}

#[instrument(skip(policy, ctx), fields(policy = %policy.name_any()))]
pub async fn reconcile(policy: Arc<HealthCheckPolicy>, ctx: Arc<Context>) -> Result<Action> {
    let now = Utc::now();
    let resync = ctx.config.resync_period();
    let current_status = policy.status.clone().unwrap_or_default();
    let previously_disabled = disabled_reason(&current_status);

    // conflicting external machine-health-checker gate
    if ctx.mhc_observer.need_disable().await {
        let message =
            "Custom MachineHealthCheck(s) detected, disabling node remediation to avoid conflicts";
        let mut status = current_status;
        let changed = set_disabled_condition(&mut status, REASON_CONFLICTING_MHC, message, now);
        status.phase = Some(PolicyPhase::Disabled);
        status.reason = Some(REASON_CONFLICTING_MHC.to_string());
        if changed {
            info!("disabling remediation, custom machine health checks are configured");
            ctx.emit_event(
                &policy,
                EventType::Warning,
                EVENT_REASON_DISABLED,
                message.to_string(),
            )
            .await;
        }
        patch_policy_status(&ctx, &policy, status).await?;
        return Ok(Action::requeue(resync));
    }

    // template-validation gate: probe-materialise every referenced template
    for template in policy.spec.template_refs() {
        match build_remediation_request(&ctx, &policy, template, None).await {
            Ok(_) => {}
            Err(e) => {
                let Some(reason) = e.disable_reason() else {
                    return Err(e);
                };
                let message = e.to_string();
                let mut status = current_status;
                let changed = set_disabled_condition(&mut status, reason, &message, now);
                status.phase = Some(PolicyPhase::Disabled);
                status.reason = Some(reason.to_string());
                if changed {
                    warn!(error = %message, "disabling remediation, template is unusable");
                    ctx.emit_event(&policy, EventType::Warning, EVENT_REASON_DISABLED, message)
                        .await;
                }
                patch_policy_status(&ctx, &policy, status).await?;
                return Ok(Action::requeue(resync));
            }
        }
    }

    if previously_disabled.is_some() {
        info!("re-enabling remediation");
        ctx.emit_event(
            &policy,
            EventType::Normal,
            EVENT_REASON_ENABLED,
            "Conflicts resolved, re-enabling node remediation".to_string(),
        )
        .await;
    }

    // node selection
    let nodes_api: Api<Node> = Api::all(ctx.client.clone());
    let selected: Vec<Node> = nodes_api
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .filter(|node| selector_matches(&policy.spec.selector, node.labels()))
        .collect();

    // health evaluation
    let checks = &policy.spec.unhealthy_conditions;
    let mut requeue: Option<StdDuration> = None;
    let mut healthy: Vec<&Node> = Vec::new();
    let mut unhealthy: Vec<&Node> = Vec::new();
    for node in &selected {
        let conditions = node
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_deref())
            .unwrap_or_default();
        if is_node_healthy(checks, conditions, now) {
            healthy.push(node);
            // requeue at the instant a held condition would cross its
            // duration threshold
            if let Some(deadline) = next_unhealthy_transition(checks, conditions, now) {
                merge_requeue(&mut requeue, (deadline - now).to_std().ok());
            }
        } else if ctx.mhc_observer.need_ignore_node(node).await {
            debug!(node = %node.name_any(), "unhealthy node is externally managed, ignoring");
        } else {
            unhealthy.push(node);
        }
    }
    unhealthy.sort_by_key(|n| n.name_any());

    let observed = selected.len();
    let healthy_count = observed - unhealthy.len();

    // carry attempt records over for nodes that are still unhealthy
    let mut records: Vec<UnhealthyNodeStatus> = unhealthy
        .iter()
        .map(|node| {
            let name = node.name_any();
            current_status
                .node_record(&name)
                .cloned()
                .unwrap_or(UnhealthyNodeStatus {
                    name,
                    remediations: vec![],
                })
        })
        .collect();

    let paused = !policy.spec.pause_requests.is_empty();
    let mut reason: Option<String> = None;
    let mut gated = false;

    if !unhealthy.is_empty() {
        let min_healthy = scaled_min_healthy(&policy.spec.min_healthy, observed)
            .map_err(Error::Config)?;
        let upgrading = is_cluster_upgrading(&ctx).await;

        match evaluate_gates(healthy_count, min_healthy, paused, upgrading) {
            RemediationGate::BelowMinHealthy { healthy, required } => {
                gated = true;
                let message = format!(
                    "Skipped remediation because the number of healthy nodes selected by the selector is {healthy} and should equal or exceed {required}"
                );
                warn!(healthy, required, "too few healthy nodes, skipping remediation");
                ctx.emit_event(
                    &policy,
                    EventType::Warning,
                    EVENT_REASON_REMEDIATION_SKIPPED,
                    message.clone(),
                )
                .await;
                reason = Some(message);
            }
            RemediationGate::Paused => {
                let message = "Skipping remediation because there are pause requests";
                info!("{}", message);
                ctx.emit_event(
                    &policy,
                    EventType::Normal,
                    EVENT_REASON_REMEDIATION_SKIPPED,
                    message.to_string(),
                )
                .await;
                reason = Some(message.to_string());
            }
            RemediationGate::Upgrading => {
                gated = true;
                let message = "Skipped remediation because the cluster is upgrading";
                info!("{}", message);
                ctx.emit_event(
                    &policy,
                    EventType::Normal,
                    EVENT_REASON_REMEDIATION_SKIPPED,
                    message.to_string(),
                )
                .await;
                merge_requeue(&mut requeue, Some(ctx.config.upgrade_requeue()));
                reason = Some(message.to_string());
            }
            RemediationGate::Proceed => {
                let candidates: Vec<(String, bool, bool)> = unhealthy
                    .iter()
                    .zip(records.iter())
                    .map(|(node, record)| {
                        (
                            node.name_any(),
                            is_control_plane(node),
                            !record.remediations.is_empty(),
                        )
                    })
                    .collect();
                let skips = control_plane_skips(&candidates);

                for (node, record) in unhealthy.iter().zip(records.iter_mut()) {
                    let name = node.name_any();
                    if skips.contains(&name) {
                        info!(node = %name, "deferring control-plane node, another one is being remediated");
                        continue;
                    }
                    let hint = remediate_node(&ctx, &policy, node, record).await?;
                    merge_requeue(&mut requeue, hint);
                }
            }
        }
    }

    // census of owned request objects
    let mut in_flight = in_flight_census(&ctx, &policy).await?;

    // recovered nodes: drop their requests and leases
    for node in &healthy {
        let name = node.name_any();
        if current_status.node_record(&name).is_none() && !in_flight.contains_key(&name) {
            continue;
        }
        clear_node(&ctx, &policy, &name).await?;
        in_flight.remove(&name);
    }

    let remediating = records.iter().any(|r| !r.remediations.is_empty());
    let phase = compute_phase(paused, gated, remediating);

    let status = HealthCheckPolicyStatus {
        observed_nodes: Some(i32::try_from(observed).unwrap_or(i32::MAX)),
        healthy_nodes: Some(i32::try_from(healthy_count).unwrap_or(i32::MAX)),
        in_flight_remediations: in_flight,
        unhealthy_nodes: records,
        phase: Some(phase),
        reason,
        conditions: vec![],
    };
    patch_policy_status(&ctx, &policy, status).await?;

    merge_requeue(&mut requeue, Some(resync));
    Ok(Action::requeue(requeue.unwrap_or(resync)))
}

/// Reconcile failures requeue after a short back-off; the next pass starts
/// from freshly observed state
pub fn error_policy(policy: Arc<HealthCheckPolicy>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(policy = %policy.name_any(), error = %error, "reconciliation failed");
    Action::requeue(ERROR_REQUEUE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    fn node(name: &str, labels: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_is_control_plane() {
        assert!(is_control_plane(&node(
            "cp-1",
            &[("node-role.kubernetes.io/control-plane", "")]
        )));
        assert!(is_control_plane(&node(
            "cp-2",
            &[("node-role.kubernetes.io/master", "")]
        )));
        assert!(!is_control_plane(&node("worker-1", &[("zone", "a")])));
    }

    fn candidate(name: &str, cp: bool, remediating: bool) -> (String, bool, bool) {
        (name.to_string(), cp, remediating)
    }

    #[test]
    fn test_control_plane_skips_nothing_for_workers() {
        let skips = control_plane_skips(&[
            candidate("worker-1", false, false),
            candidate("worker-2", false, true),
        ]);
        assert!(skips.is_empty());
    }

    #[test]
    fn test_control_plane_skips_all_but_lowest_name() {
        let skips = control_plane_skips(&[
            candidate("cp-3", true, false),
            candidate("cp-1", true, false),
            candidate("cp-2", true, false),
            candidate("worker-1", false, false),
        ]);
        assert!(!skips.contains("cp-1"));
        assert!(skips.contains("cp-2"));
        assert!(skips.contains("cp-3"));
        assert!(!skips.contains("worker-1"));
    }

    #[test]
    fn test_control_plane_prefers_in_flight_remediation() {
        let skips = control_plane_skips(&[
            candidate("cp-1", true, false),
            candidate("cp-2", true, true),
        ]);
        // cp-2 is mid-remediation, so cp-1 waits despite sorting first
        assert!(skips.contains("cp-1"));
        assert!(!skips.contains("cp-2"));
    }

    #[test]
    fn test_single_control_plane_node_not_skipped() {
        let skips = control_plane_skips(&[candidate("cp-1", true, false)]);
        assert!(skips.is_empty());
    }

    #[test]
    fn test_evaluate_gates_order() {
        use RemediationGate::*;

        assert_eq!(
            evaluate_gates(1, 2, true, true),
            BelowMinHealthy {
                healthy: 1,
                required: 2
            }
        );
        assert_eq!(evaluate_gates(2, 2, true, true), Paused);
        assert_eq!(evaluate_gates(2, 2, false, true), Upgrading);
        assert_eq!(evaluate_gates(2, 2, false, false), Proceed);
    }

    #[test]
    fn test_evaluate_gates_scenarios() {
        // 3 nodes, 1 unhealthy, 51% -> min 2, healthy 2: proceed
        assert_eq!(evaluate_gates(2, 2, false, false), RemediationGate::Proceed);
        // 7 nodes, 4 unhealthy, 51% -> min 4, healthy 3: blocked
        assert_eq!(
            evaluate_gates(3, 4, false, false),
            RemediationGate::BelowMinHealthy {
                healthy: 3,
                required: 4
            }
        );
        // 0% allows remediating everything, 100% forbids any unhealthy node
        assert_eq!(evaluate_gates(0, 0, false, false), RemediationGate::Proceed);
        assert_eq!(
            evaluate_gates(4, 5, false, false),
            RemediationGate::BelowMinHealthy {
                healthy: 4,
                required: 5
            }
        );
    }

    #[test]
    fn test_compute_phase() {
        assert_eq!(compute_phase(false, false, false), PolicyPhase::Enabled);
        assert_eq!(compute_phase(false, false, true), PolicyPhase::Remediating);
        assert_eq!(compute_phase(true, false, true), PolicyPhase::Paused);
        assert_eq!(compute_phase(true, true, true), PolicyPhase::Paused);
    }

    #[test]
    fn test_gated_pass_overrides_carried_remediation_records() {
        // a node is mid-remediation when more nodes go unhealthy and the
        // min-healthy gate closes: no remediation happens this pass, so
        // the phase must drop back to Enabled despite the old records
        assert_eq!(
            evaluate_gates(3, 4, false, false),
            RemediationGate::BelowMinHealthy {
                healthy: 3,
                required: 4
            }
        );
        assert_eq!(compute_phase(false, true, true), PolicyPhase::Enabled);

        // same while the cluster is upgrading
        assert_eq!(evaluate_gates(5, 4, false, true), RemediationGate::Upgrading);
        assert_eq!(compute_phase(false, true, true), PolicyPhase::Enabled);

        // an open gate keeps reporting in-flight remediation
        assert_eq!(compute_phase(false, false, true), PolicyPhase::Remediating);
    }

    #[test]
    fn test_set_disabled_condition_is_idempotent() {
        let now = Utc::now();
        let mut status = HealthCheckPolicyStatus::default();

        assert!(set_disabled_condition(
            &mut status,
            REASON_CONFLICTING_MHC,
            "conflict",
            now
        ));
        let first = status.conditions.clone();

        // same reason again: no change, transition time preserved
        assert!(!set_disabled_condition(
            &mut status,
            REASON_CONFLICTING_MHC,
            "conflict",
            now + chrono::Duration::minutes(5)
        ));
        assert_eq!(status.conditions, first);

        // different reason replaces the condition
        assert!(set_disabled_condition(
            &mut status,
            "TemplateInvalid",
            "bad template",
            now
        ));
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(
            status.conditions[0].reason.as_deref(),
            Some("TemplateInvalid")
        );
    }

    #[test]
    fn test_disabled_reason_lookup() {
        let mut status = HealthCheckPolicyStatus::default();
        assert_eq!(disabled_reason(&status), None);
        set_disabled_condition(&mut status, REASON_CONFLICTING_MHC, "conflict", Utc::now());
        assert_eq!(
            disabled_reason(&status),
            Some(REASON_CONFLICTING_MHC.to_string())
        );
    }

    #[test]
    fn test_status_content_equality_is_order_insensitive_for_census() {
        let mut a = HealthCheckPolicyStatus::default();
        a.in_flight_remediations
            .insert("worker-1".to_string(), "t1".to_string());
        a.in_flight_remediations
            .insert("worker-2".to_string(), "t2".to_string());

        let mut b = HealthCheckPolicyStatus::default();
        b.in_flight_remediations
            .insert("worker-2".to_string(), "t2".to_string());
        b.in_flight_remediations
            .insert("worker-1".to_string(), "t1".to_string());

        assert_eq!(a, b);
    }

    #[test]
    fn test_identical_reconcile_output_is_byte_equivalent() {
        let build = || HealthCheckPolicyStatus {
            observed_nodes: Some(3),
            healthy_nodes: Some(2),
            in_flight_remediations: BTreeMap::from([(
                "worker-1".to_string(),
                "2026-05-01T10:00:00Z".to_string(),
            )]),
            unhealthy_nodes: vec![UnhealthyNodeStatus {
                name: "worker-1".to_string(),
                remediations: vec![],
            }],
            phase: Some(PolicyPhase::Remediating),
            reason: None,
            conditions: vec![],
        };
        let first = serde_json::to_vec(&build()).unwrap();
        let second = serde_json::to_vec(&build()).unwrap();
        assert_eq!(first, second);
        assert_eq!(build(), build());
    }
}
