//! Escalating remediation engine
//!
//! Drives the ordered remediation attempts for one unhealthy node. Each
//! attempt materialises a request object from the step's template under the
//! protection of the node's coordination lease. A step that exceeds its
//! timeout (or whose request reports `Succeeded=False` for too long) is
//! stamped timed-out, its request is annotated for the external remediator,
//! and the next step takes over. Attempt records live in the policy status,
//! so the whole state machine is replayable from persisted state.

use crate::check::lease::NodeLeaseManager;
use crate::check::template::{
    build_remediation_request, owned_by_policy, request_api, resource_api,
};
use crate::check::types::{
    parse_rfc3339, rfc3339, Context, Error, Result, EVENT_REASON_REMEDIATION_CREATED,
    EVENT_REASON_REMEDIATION_REMOVED,
};
use crate::crds::healthcheckpolicy::parse_duration;
use crate::crds::{
    HealthCheckPolicy, HealthCheckPolicySpec, RemediationAttempt, TemplateRef, UnhealthyNodeStatus,
};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::runtime::events::EventType;
use kube::{Error as KubeError, ResourceExt};
use serde_json::{json, Value};
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};

/// Annotation telling the external remediator an attempt ran out of time;
/// the value is the RFC3339 instant the timeout was declared
pub const TIMED_OUT_ANNOTATION: &str = "remediation.platform/nhc-timed-out";

/// Annotation marking a request object that aged past the stale threshold
pub const STALE_FLAG_ANNOTATION: &str = "remediation.platform/old-remediation-cr-flag";

/// Value written under the stale flag annotation
pub const STALE_FLAG_VALUE: &str = "flagon";

/// One resolved escalation step
#[derive(Debug, Clone, PartialEq)]
pub struct EscalationStep {
    pub template: TemplateRef,
    /// `None` for the single-template form: the sole step never times out
    pub timeout: Option<chrono::Duration>,
}

/// Resolve the policy's template configuration into ordered steps.
///
/// The single-template form becomes one step without a timeout; the
/// escalating form is sorted by ascending order with parsed timeouts.
pub fn escalation_steps(spec: &HealthCheckPolicySpec) -> Result<Vec<EscalationStep>> {
    if let Some(single) = &spec.remediation_template {
        return Ok(vec![EscalationStep {
            template: single.clone(),
            timeout: None,
        }]);
    }
    let mut escalating: Vec<_> = spec
        .escalating_remediations
        .as_deref()
        .unwrap_or_default()
        .to_vec();
    if escalating.is_empty() {
        return Err(Error::Config(
            "policy has neither remediationTemplate nor escalatingRemediations".to_string(),
        ));
    }
    escalating.sort_by_key(|s| s.order);
    escalating
        .into_iter()
        .map(|step| {
            let timeout = parse_duration(&step.timeout)
                .map_err(|e| Error::Config(format!("invalid escalation timeout: {e}")))?;
            Ok(EscalationStep {
                template: step.remediation_template,
                timeout: Some(timeout),
            })
        })
        .collect()
}

/// Index of the attempt currently in flight, if any. Attempts are appended
/// in step order and stamped before the next one starts, so only the last
/// can be open.
fn in_flight_index(attempts: &[RemediationAttempt]) -> Option<usize> {
    attempts.iter().rposition(|a| a.timed_out.is_none())
}

/// Keep the earlier of two requeue hints
pub fn merge_requeue(current: &mut Option<StdDuration>, candidate: Option<StdDuration>) {
    if let Some(candidate) = candidate {
        match current {
            Some(existing) if *existing <= candidate => {}
            _ => *current = Some(candidate),
        }
    }
}

/// When the request's `Succeeded` condition went `False`, if it has
fn succeeded_false_since(data: &Value) -> Option<DateTime<Utc>> {
    data.get("status")?
        .get("conditions")?
        .as_array()?
        .iter()
        .find(|c| {
            c.get("type").and_then(Value::as_str) == Some("Succeeded")
                && c.get("status").and_then(Value::as_str) == Some("False")
        })
        .and_then(|c| c.get("lastTransitionTime"))
        .and_then(Value::as_str)
        .and_then(parse_rfc3339)
}

#[derive(Debug, PartialEq, Eq)]
enum StaleDecision {
    /// Past the threshold: flag the request (once) and sample the metric
    Flag,
    /// Not stale yet: come back shortly after it would become stale
    RequeueAt(DateTime<Utc>),
}

fn stale_decision(
    created: DateTime<Utc>,
    now: DateTime<Utc>,
    threshold: chrono::Duration,
) -> StaleDecision {
    if now - created >= threshold {
        StaleDecision::Flag
    } else {
        StaleDecision::RequeueAt(created + threshold + chrono::Duration::minutes(1))
    }
}

async fn annotate(
    api: &Api<DynamicObject>,
    name: &str,
    key: &str,
    value: &str,
) -> Result<()> {
    let mut annotations = serde_json::Map::new();
    annotations.insert(key.to_string(), Value::String(value.to_string()));
    let patch = json!({ "metadata": { "annotations": annotations } });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Flag a request object that has lingered past the stale threshold, or
/// return a requeue hint aimed just past the moment it would go stale.
async fn check_stale_request(
    ctx: &Context,
    api: &Api<DynamicObject>,
    obj: &DynamicObject,
    now: DateTime<Utc>,
) -> Result<Option<StdDuration>> {
    let Some(created) = &obj.metadata.creation_timestamp else {
        return Ok(None);
    };
    match stale_decision(created.0, now, ctx.config.stale_request_timeout()) {
        StaleDecision::RequeueAt(at) => Ok((at - now).to_std().ok()),
        StaleDecision::Flag => {
            if obj.annotations().contains_key(STALE_FLAG_ANNOTATION) {
                return Ok(None);
            }
            let name = obj.name_any();
            match annotate(api, &name, STALE_FLAG_ANNOTATION, STALE_FLAG_VALUE).await {
                Ok(()) => {
                    let namespace = obj.namespace().unwrap_or_default();
                    warn!(request = %name, "remediation request exceeded the stale threshold");
                    ctx.metrics.observe_old_remediation_cr(&name, &namespace).await;
                }
                Err(e) => {
                    // single-shot write; next reconcile tries again
                    warn!(request = %name, error = %e, "failed to set stale flag");
                }
            }
            Ok(None)
        }
    }
}

fn step_for<'a>(steps: &'a [EscalationStep], index: usize) -> Result<&'a EscalationStep> {
    steps.get(index).or_else(|| steps.last()).ok_or_else(|| {
        Error::Config("policy resolved to an empty escalation sequence".to_string())
    })
}

async fn create_request(
    ctx: &Context,
    policy: &HealthCheckPolicy,
    template: &TemplateRef,
    node: &Node,
) -> Result<()> {
    let request = build_remediation_request(ctx, policy, template, Some(node)).await?;
    let api = request_api(&ctx.client, template);
    let node_name = node.name_any();
    match api.create(&PostParams::default(), &request).await {
        Ok(_) => {
            info!(
                node = %node_name,
                kind = %template.remediation_kind(),
                "created remediation request"
            );
            ctx.emit_event(
                policy,
                EventType::Normal,
                EVENT_REASON_REMEDIATION_CREATED,
                format!("Created remediation object for node {node_name}"),
            )
            .await;
            Ok(())
        }
        // someone beat us to it; the desired state holds either way
        Err(KubeError::Api(e)) if e.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Drive remediation of one unhealthy node, mutating its status record in
/// place. Returns the engine's requeue wish for this node.
pub async fn remediate_node(
    ctx: &Context,
    policy: &HealthCheckPolicy,
    node: &Node,
    record: &mut UnhealthyNodeStatus,
) -> Result<Option<StdDuration>> {
    let steps = escalation_steps(&policy.spec)?;
    let leases = NodeLeaseManager::new(ctx.client.clone(), &ctx.config);
    let node_name = node.name_any();
    let now = Utc::now();
    let mut requeue: Option<StdDuration> = None;

    if let Some(index) = in_flight_index(&record.remediations) {
        let step = step_for(&steps, index)?;
        let outcome = leases.acquire(&node_name, step.timeout).await?;
        if !outcome.acquired {
            return Ok(outcome.requeue_after);
        }

        let started = parse_rfc3339(&record.remediations[index].started_at);
        let deadline_passed = match (step.timeout, started) {
            (Some(timeout), Some(started)) => now - started >= timeout,
            _ => false,
        };

        let resource = record.remediations[index].resource.clone();
        let api = resource_api(&ctx.client, &resource);
        match api.get_opt(&resource.name).await? {
            None if deadline_passed => {
                // the request vanished and its time is up anyway; nothing
                // left to annotate, just move on
                record.remediations[index].timed_out = Some(rfc3339(now));
            }
            None => {
                // someone deleted the in-flight request; the node is still
                // unhealthy, so re-create it under the same step keeping
                // the original start time
                debug!(node = %node_name, "in-flight remediation request missing, recreating");
                create_request(ctx, policy, &step.template, node).await?;
                if let (Some(timeout), Some(started)) = (step.timeout, started) {
                    merge_requeue(&mut requeue, (started + timeout - now).to_std().ok());
                }
                return Ok(requeue);
            }
            Some(obj) => {
                let hard_timeout = ctx.config.progressing_hard_timeout();
                let stuck = succeeded_false_since(&obj.data)
                    .is_some_and(|since| now - since >= hard_timeout);

                if !deadline_passed && !stuck {
                    // attempt still running; hold the lease and come back
                    // at its deadline (or to check staleness)
                    if let (Some(timeout), Some(started)) = (step.timeout, started) {
                        merge_requeue(&mut requeue, (started + timeout - now).to_std().ok());
                    }
                    let stale_hint = check_stale_request(ctx, &api, &obj, now).await?;
                    merge_requeue(&mut requeue, stale_hint);
                    return Ok(requeue);
                }

                if let Err(e) =
                    annotate(&api, &resource.name, TIMED_OUT_ANNOTATION, &rfc3339(now)).await
                {
                    // retried on the next reconcile; do not advance yet
                    warn!(node = %node_name, error = %e, "failed to annotate timed-out request");
                    return Ok(Some(ctx.config.lease_retry_interval()));
                }
                info!(
                    node = %node_name,
                    kind = %resource.kind,
                    stuck,
                    "remediation attempt timed out"
                );
                record.remediations[index].timed_out = Some(rfc3339(now));
            }
        }
    }

    // begin the next step, unless the sequence is exhausted
    let next_index = record.remediations.len();
    if next_index >= steps.len() {
        if let Some(last) = record.remediations.last() {
            let api = resource_api(&ctx.client, &last.resource);
            if let Some(obj) = api.get_opt(&last.resource.name).await? {
                // a request object still exists, so we keep its lease alive
                let outcome = leases.acquire(&node_name, None).await?;
                if !outcome.acquired {
                    merge_requeue(&mut requeue, outcome.requeue_after);
                }
                let stale_hint = check_stale_request(ctx, &api, &obj, now).await?;
                merge_requeue(&mut requeue, stale_hint);
            }
        }
        return Ok(requeue);
    }

    let step = &steps[next_index];
    let outcome = leases.acquire(&node_name, step.timeout).await?;
    if !outcome.acquired {
        merge_requeue(&mut requeue, outcome.requeue_after);
        return Ok(requeue);
    }

    create_request(ctx, policy, &step.template, node).await?;
    record.remediations.push(RemediationAttempt {
        resource: step.template.request_resource(&node_name),
        started_at: rfc3339(now),
        timed_out: None,
    });

    // the previous step's request has been timed out and superseded
    if next_index > 0 {
        let previous = record.remediations[next_index - 1].resource.clone();
        let superseded_by_same_object = previous.api_version == step.template.api_version
            && previous.kind == step.template.remediation_kind()
            && previous.namespace == step.template.namespace;
        if !superseded_by_same_object {
            let api = resource_api(&ctx.client, &previous);
            match api.delete(&previous.name, &DeleteParams::default()).await {
                Ok(_) => debug!(node = %node_name, kind = %previous.kind, "removed superseded request"),
                Err(KubeError::Api(e)) if e.code == 404 => {}
                Err(e) => {
                    warn!(node = %node_name, error = %e, "failed to remove superseded request");
                }
            }
        }
    }

    merge_requeue(
        &mut requeue,
        step.timeout.and_then(|t| t.to_std().ok()),
    );
    Ok(requeue)
}

/// Recovery path: delete every request object this policy owns for the
/// node and release its lease. Returns whether anything was deleted.
pub async fn clear_node(
    ctx: &Context,
    policy: &HealthCheckPolicy,
    node_name: &str,
) -> Result<bool> {
    let steps = escalation_steps(&policy.spec)?;
    let mut deleted_any = false;

    for step in &steps {
        let api = request_api(&ctx.client, &step.template);
        let Some(obj) = api.get_opt(node_name).await? else {
            continue;
        };
        if obj.metadata.deletion_timestamp.is_some() || !owned_by_policy(&obj, policy) {
            continue;
        }
        match api.delete(node_name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(node = %node_name, kind = %step.template.remediation_kind(),
                    "deleted remediation request for recovered node");
                ctx.emit_event(
                    policy,
                    EventType::Normal,
                    EVENT_REASON_REMEDIATION_REMOVED,
                    format!("Deleted remediation object for node {node_name}"),
                )
                .await;
                deleted_any = true;
            }
            Err(KubeError::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }

    let leases = NodeLeaseManager::new(ctx.client.clone(), &ctx.config);
    leases.release(node_name).await?;
    Ok(deleted_any)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::EscalatingRemediation;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    fn template(name: &str) -> TemplateRef {
        TemplateRef {
            api_version: "self-node-remediation.medik8s.io/v1alpha1".to_string(),
            kind: "SelfNodeRemediationTemplate".to_string(),
            name: name.to_string(),
            namespace: "remediation-system".to_string(),
        }
    }

    fn spec_with_escalation(steps: Vec<EscalatingRemediation>) -> HealthCheckPolicySpec {
        HealthCheckPolicySpec {
            selector: LabelSelector::default(),
            unhealthy_conditions: vec![],
            min_healthy: IntOrString::String("51%".to_string()),
            pause_requests: vec![],
            remediation_template: None,
            escalating_remediations: Some(steps),
        }
    }

    #[test]
    fn test_single_template_is_one_step_without_timeout() {
        let spec = HealthCheckPolicySpec {
            remediation_template: Some(template("snr")),
            escalating_remediations: None,
            ..spec_with_escalation(vec![])
        };
        let steps = escalation_steps(&spec).unwrap();
        assert_eq!(steps.len(), 1);
        assert!(steps[0].timeout.is_none());
        assert_eq!(steps[0].template.name, "snr");
    }

    #[test]
    fn test_escalation_steps_sorted_with_parsed_timeouts() {
        let spec = spec_with_escalation(vec![
            EscalatingRemediation {
                remediation_template: template("slow"),
                order: 5,
                timeout: "15s".to_string(),
            },
            EscalatingRemediation {
                remediation_template: template("fast"),
                order: 0,
                timeout: "5s".to_string(),
            },
        ]);
        let steps = escalation_steps(&spec).unwrap();
        assert_eq!(steps[0].template.name, "fast");
        assert_eq!(steps[0].timeout, Some(chrono::Duration::seconds(5)));
        assert_eq!(steps[1].template.name, "slow");
        assert_eq!(steps[1].timeout, Some(chrono::Duration::seconds(15)));
    }

    #[test]
    fn test_escalation_steps_rejects_empty_spec() {
        let spec = spec_with_escalation(vec![]);
        assert!(escalation_steps(&spec).is_err());
    }

    fn attempt(timed_out: Option<&str>) -> RemediationAttempt {
        RemediationAttempt {
            resource: template("snr").request_resource("worker-1"),
            started_at: rfc3339(Utc::now()),
            timed_out: timed_out.map(String::from),
        }
    }

    #[test]
    fn test_in_flight_index() {
        assert_eq!(in_flight_index(&[]), None);
        assert_eq!(in_flight_index(&[attempt(None)]), Some(0));
        assert_eq!(
            in_flight_index(&[attempt(Some("2026-01-01T00:00:00Z")), attempt(None)]),
            Some(1)
        );
        assert_eq!(
            in_flight_index(&[
                attempt(Some("2026-01-01T00:00:00Z")),
                attempt(Some("2026-01-01T00:05:00Z"))
            ]),
            None
        );
    }

    #[test]
    fn test_stale_decision_boundaries() {
        let now = Utc::now();
        let threshold = chrono::Duration::hours(48);

        assert_eq!(
            stale_decision(now - chrono::Duration::hours(48), now, threshold),
            StaleDecision::Flag
        );
        assert_eq!(
            stale_decision(now - chrono::Duration::hours(49), now, threshold),
            StaleDecision::Flag
        );
        let created = now - chrono::Duration::hours(47);
        assert_eq!(
            stale_decision(created, now, threshold),
            StaleDecision::RequeueAt(created + threshold + chrono::Duration::minutes(1))
        );
    }

    #[test]
    fn test_succeeded_false_since() {
        let data = json!({
            "status": {
                "conditions": [
                    { "type": "Processing", "status": "True" },
                    {
                        "type": "Succeeded",
                        "status": "False",
                        "lastTransitionTime": "2026-05-01T10:00:00Z"
                    }
                ]
            }
        });
        let since = succeeded_false_since(&data).unwrap();
        assert_eq!(rfc3339(since), "2026-05-01T10:00:00Z");

        let succeeded = json!({
            "status": { "conditions": [{ "type": "Succeeded", "status": "True" }] }
        });
        assert!(succeeded_false_since(&succeeded).is_none());
        assert!(succeeded_false_since(&json!({})).is_none());
    }

    #[test]
    fn test_merge_requeue_keeps_earliest() {
        let mut hint = None;
        merge_requeue(&mut hint, None);
        assert_eq!(hint, None);
        merge_requeue(&mut hint, Some(StdDuration::from_secs(60)));
        assert_eq!(hint, Some(StdDuration::from_secs(60)));
        merge_requeue(&mut hint, Some(StdDuration::from_secs(10)));
        assert_eq!(hint, Some(StdDuration::from_secs(10)));
        merge_requeue(&mut hint, Some(StdDuration::from_secs(30)));
        assert_eq!(hint, Some(StdDuration::from_secs(10)));
    }
}
