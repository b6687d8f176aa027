//! Node health evaluation
//!
//! Pure functions over a node's condition list and a policy's unhealthy
//! clauses. A node is unhealthy when any clause matches: the node carries a
//! condition of the clause's type with the clause's status, and that status
//! has held for at least the clause's duration.

use crate::crds::healthcheckpolicy::parse_duration;
use crate::crds::UnhealthyCondition;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::NodeCondition;
use std::collections::HashMap;

fn conditions_by_type(conditions: &[NodeCondition]) -> HashMap<&str, &NodeCondition> {
    conditions.iter().map(|c| (c.type_.as_str(), c)).collect()
}

/// Evaluate a node against the policy's unhealthy clauses.
///
/// A clause whose condition type is absent from the node does not match.
/// Elapsed time exactly equal to the clause duration counts as unhealthy.
#[must_use]
pub fn is_node_healthy(
    checks: &[UnhealthyCondition],
    conditions: &[NodeCondition],
    now: DateTime<Utc>,
) -> bool {
    let by_type = conditions_by_type(conditions);
    for check in checks {
        let Some(condition) = by_type.get(check.condition_type.as_str()) else {
            continue;
        };
        if condition.status != check.status {
            continue;
        }
        let Some(transition) = &condition.last_transition_time else {
            continue;
        };
        let Ok(duration) = parse_duration(&check.duration) else {
            // unparsable durations are rejected at admission; skip the clause
            continue;
        };
        if now - transition.0 >= duration {
            return false;
        }
    }
    true
}

/// For a currently healthy node, the earliest future instant at which some
/// clause would cross its duration threshold if the node's conditions stay
/// as they are. Drives a targeted requeue instead of waiting for the resync.
#[must_use]
pub fn next_unhealthy_transition(
    checks: &[UnhealthyCondition],
    conditions: &[NodeCondition],
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let by_type = conditions_by_type(conditions);
    checks
        .iter()
        .filter_map(|check| {
            let condition = by_type.get(check.condition_type.as_str())?;
            if condition.status != check.status {
                return None;
            }
            let transition = condition.last_transition_time.as_ref()?;
            let duration = parse_duration(&check.duration).ok()?;
            let deadline = transition.0 + duration;
            (deadline > now).then_some(deadline)
        })
        .min()
}

/// Whether a node change is worth reconciling: true iff the multiset of
/// `(type, status)` pairs differs. Ordering, timestamps, reasons and
/// messages are ignored, which suppresses heartbeat-only node updates.
#[must_use]
pub fn conditions_need_reconcile(old: &[NodeCondition], new: &[NodeCondition]) -> bool {
    fn pairs(conditions: &[NodeCondition]) -> Vec<(&str, &str)> {
        let mut pairs: Vec<(&str, &str)> = conditions
            .iter()
            .map(|c| (c.type_.as_str(), c.status.as_str()))
            .collect();
        pairs.sort_unstable();
        pairs
    }
    pairs(old) != pairs(new)
}
