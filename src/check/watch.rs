//! Node-to-policy event mapping
//!
//! Node watch events are translated into reconcile requests for every
//! policy whose selector matches the node. Heartbeat-only node updates
//! (same condition types and statuses, newer timestamps) are suppressed by
//! keeping the last seen condition pairs per node.

use crate::crds::HealthCheckPolicy;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::trace;

/// Whether a label set satisfies a `LabelSelector`. An empty selector
/// matches everything.
#[must_use]
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
    }
    if let Some(expressions) = &selector.match_expressions {
        for requirement in expressions {
            let value = labels.get(&requirement.key);
            let values = requirement.values.as_deref().unwrap_or_default();
            let satisfied = match requirement.operator.as_str() {
                "In" => value.is_some_and(|v| values.iter().any(|allowed| allowed == v)),
                "NotIn" => !value.is_some_and(|v| values.iter().any(|denied| denied == v)),
                "Exists" => value.is_some(),
                "DoesNotExist" => value.is_none(),
                _ => false,
            };
            if !satisfied {
                return false;
            }
        }
    }
    true
}

fn condition_pairs(node: &Node) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default()
        .iter()
        .map(|c| (c.type_.clone(), c.status.clone()))
        .collect();
    pairs.sort_unstable();
    pairs
}

/// Maps node events to the policies that select the node
pub struct NodeMapper {
    policies: Store<HealthCheckPolicy>,
    seen: Mutex<HashMap<String, Vec<(String, String)>>>,
}

impl NodeMapper {
    #[must_use]
    pub fn new(policies: Store<HealthCheckPolicy>) -> Self {
        NodeMapper {
            policies,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record the node's current condition pairs; true when they differ
    /// from what was last seen (or the node is new to us)
    fn conditions_changed(&self, node_name: &str, pairs: Vec<(String, String)>) -> bool {
        let mut seen = self.seen.lock().expect("condition cache poisoned");
        let previous = seen.insert(node_name.to_string(), pairs);
        match previous {
            Some(previous) => previous != seen[node_name],
            None => true,
        }
    }

    /// Reconcile requests for a node event
    #[must_use]
    pub fn map(&self, node: &Node) -> Vec<ObjectRef<HealthCheckPolicy>> {
        let node_name = node.name_any();
        if !self.conditions_changed(&node_name, condition_pairs(node)) {
            trace!(node = %node_name, "node conditions unchanged, suppressing reconcile");
            return vec![];
        }

        let labels = node.metadata.labels.clone().unwrap_or_default();
        self.policies
            .state()
            .iter()
            .filter(|policy| selector_matches(&policy.spec.selector, &labels))
            .map(|policy| ObjectRef::from_obj(&**policy))
            .collect()
    }
}
