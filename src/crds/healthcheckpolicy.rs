//! `HealthCheckPolicy` Custom Resource Definition
//!
//! A `HealthCheckPolicy` declares which nodes to observe, what counts as
//! unhealthy, and which remediation template(s) to instantiate when a node
//! goes bad. The status block is owned exclusively by the reconciler.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Condition type set on the policy while remediation is administratively off
pub const CONDITION_TYPE_DISABLED: &str = "Disabled";

/// Disabled because an external machine health checker is active
pub const REASON_CONFLICTING_MHC: &str = "ConflictingMHC";
/// Disabled because a referenced template object does not exist
pub const REASON_TEMPLATE_NOT_FOUND: &str = "TemplateNotFound";
/// Disabled because a referenced template object is unusable
pub const REASON_TEMPLATE_INVALID: &str = "TemplateInvalid";

fn default_unhealthy_conditions() -> Vec<UnhealthyCondition> {
    vec![
        UnhealthyCondition {
            condition_type: "Ready".to_string(),
            status: "False".to_string(),
            duration: "5m".to_string(),
        },
        UnhealthyCondition {
            condition_type: "Ready".to_string(),
            status: "Unknown".to_string(),
            duration: "5m".to_string(),
        },
    ]
}

fn default_min_healthy() -> IntOrString {
    IntOrString::String("51%".to_string())
}

/// A single "this node is unhealthy" clause. A node matches when its
/// condition of `type` has carried `status` for at least `duration`.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct UnhealthyCondition {
    /// Node condition type to inspect (e.g. "Ready")
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Condition status that indicates trouble: "True", "False" or "Unknown"
    pub status: String,

    /// How long the status must hold before the node counts as unhealthy,
    /// as a duration string ("300s", "5m", "1h30m")
    pub duration: String,
}

/// Reference to a remediation template object
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct TemplateRef {
    /// API version of the template, e.g. "self-node-remediation.medik8s.io/v1alpha1"
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Template kind; must end with the "Template" suffix
    pub kind: String,

    /// Template object name
    pub name: String,

    /// Namespace the template (and the requests produced from it) live in
    pub namespace: String,
}

impl TemplateRef {
    /// API group portion of `apiVersion`
    #[must_use]
    pub fn group(&self) -> &str {
        self.api_version.split_once('/').map_or("", |(g, _)| g)
    }

    /// Version portion of `apiVersion`
    #[must_use]
    pub fn version(&self) -> &str {
        self.api_version
            .split_once('/')
            .map_or(self.api_version.as_str(), |(_, v)| v)
    }
}

/// One step of an ordered escalation sequence
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct EscalatingRemediation {
    /// Template to instantiate for this step
    #[serde(rename = "remediationTemplate")]
    pub remediation_template: TemplateRef,

    /// Position in the sequence; lower orders run first, values are unique
    pub order: i32,

    /// How long this step may run before escalating to the next one,
    /// as a duration string ("5m")
    pub timeout: String,
}

/// `HealthCheckPolicy` CRD watching a set of nodes for failed conditions
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "remediation.platform", version = "v1alpha1", kind = "HealthCheckPolicy")]
#[kube(status = "HealthCheckPolicyStatus")]
#[kube(printcolumn = r#"{"name":"Observed","type":"integer","jsonPath":".status.observedNodes"}"#)]
#[kube(printcolumn = r#"{"name":"Healthy","type":"integer","jsonPath":".status.healthyNodes"}"#)]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct HealthCheckPolicySpec {
    /// Label selector choosing the nodes this policy watches
    #[serde(default)]
    pub selector: LabelSelector,

    /// Clauses that mark a node unhealthy; any single match is enough
    #[serde(
        default = "default_unhealthy_conditions",
        rename = "unhealthyConditions"
    )]
    pub unhealthy_conditions: Vec<UnhealthyCondition>,

    /// Minimum number (or percentage) of selected nodes that must stay
    /// healthy for remediation to be allowed
    #[serde(default = "default_min_healthy", rename = "minHealthy")]
    pub min_healthy: IntOrString,

    /// Opaque pause markers; remediation is suspended while any are present
    #[serde(default, rename = "pauseRequests", skip_serializing_if = "Vec::is_empty")]
    pub pause_requests: Vec<String>,

    /// Single remediation template (mutually exclusive with
    /// `escalatingRemediations`)
    #[serde(
        default,
        rename = "remediationTemplate",
        skip_serializing_if = "Option::is_none"
    )]
    pub remediation_template: Option<TemplateRef>,

    /// Ordered escalation sequence (mutually exclusive with
    /// `remediationTemplate`)
    #[serde(
        default,
        rename = "escalatingRemediations",
        skip_serializing_if = "Option::is_none"
    )]
    pub escalating_remediations: Option<Vec<EscalatingRemediation>>,
}

/// Coarse state of the policy as a whole
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum PolicyPhase {
    /// Remediation is administratively off (conflicting checker, bad template)
    Disabled,
    /// Pause requests are present
    Paused,
    /// Watching nodes, nothing in flight
    Enabled,
    /// At least one remediation attempt is in flight
    Remediating,
}

/// Identity of a request object created for an attempt
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RemediationResource {
    /// API version of the request object
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Kind of the request object (template kind minus the suffix)
    pub kind: String,

    /// Request object name; equals the node name
    pub name: String,

    /// Namespace of the request object
    pub namespace: String,
}

/// One remediation attempt for an unhealthy node
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RemediationAttempt {
    /// The request object driving this attempt
    pub resource: RemediationResource,

    /// When the attempt began (RFC3339)
    #[serde(rename = "startedAt")]
    pub started_at: String,

    /// When the attempt was declared timed out (RFC3339); unset while running
    #[serde(
        default,
        rename = "timedOut",
        skip_serializing_if = "Option::is_none"
    )]
    pub timed_out: Option<String>,
}

/// Per-node remediation record kept while the node is unhealthy
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct UnhealthyNodeStatus {
    /// Node name
    pub name: String,

    /// Attempts made so far, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remediations: Vec<RemediationAttempt>,
}

/// Condition on the policy (status-owned)
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PolicyCondition {
    /// Condition type, e.g. "Disabled"
    #[serde(rename = "type")]
    pub condition_type: String,

    /// "True", "False" or "Unknown"
    pub status: String,

    /// Machine-readable reason for the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last transition time (RFC3339)
    #[serde(
        default,
        rename = "lastTransitionTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_transition_time: Option<String>,
}

/// Status of the `HealthCheckPolicy`; written only by the reconciler.
///
/// Serialized in full on every status write so that removed entries
/// (recovered nodes, finished remediations) actually disappear.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct HealthCheckPolicyStatus {
    /// Number of nodes currently selected by the selector
    #[serde(rename = "observedNodes")]
    pub observed_nodes: Option<i32>,

    /// Number of selected nodes evaluated healthy
    #[serde(rename = "healthyNodes")]
    pub healthy_nodes: Option<i32>,

    /// Request object name -> creation time (RFC3339) for every request
    /// object currently owned by this policy
    #[serde(default, rename = "inFlightRemediations")]
    pub in_flight_remediations: BTreeMap<String, String>,

    /// Remediation records for nodes currently evaluated unhealthy
    #[serde(default, rename = "unhealthyNodes")]
    pub unhealthy_nodes: Vec<UnhealthyNodeStatus>,

    /// Coarse policy phase
    pub phase: Option<PolicyPhase>,

    /// Explanation of the current phase
    pub reason: Option<String>,

    /// Conditions, currently only "Disabled"
    #[serde(default)]
    pub conditions: Vec<PolicyCondition>,
}

impl HealthCheckPolicyStatus {
    /// Look up the remediation record for a node
    #[must_use]
    pub fn node_record(&self, node_name: &str) -> Option<&UnhealthyNodeStatus> {
        self.unhealthy_nodes.iter().find(|n| n.name == node_name)
    }

    /// Whether the given condition type is present with status "True"
    #[must_use]
    pub fn is_condition_true(&self, condition_type: &str) -> bool {
        self.conditions
            .iter()
            .any(|c| c.condition_type == condition_type && c.status == "True")
    }
}

impl HealthCheckPolicySpec {
    /// Every template reference the policy names, in escalation order
    #[must_use]
    pub fn template_refs(&self) -> Vec<&TemplateRef> {
        if let Some(single) = &self.remediation_template {
            return vec![single];
        }
        let mut steps: Vec<&EscalatingRemediation> = self
            .escalating_remediations
            .as_deref()
            .unwrap_or_default()
            .iter()
            .collect();
        steps.sort_by_key(|s| s.order);
        steps.iter().map(|s| &s.remediation_template).collect()
    }

    /// Admission-level validation of the spec.
    ///
    /// The webhook that invokes this is an external collaborator; the rules
    /// live here so they are enforceable and testable without it.
    pub fn validate(&self) -> Result<(), String> {
        match &self.min_healthy {
            IntOrString::Int(n) if *n < 0 => {
                return Err(format!("minHealthy must not be negative, got {n}"));
            }
            IntOrString::String(s) => {
                let pct = parse_percentage(s)?;
                if !(0..=100).contains(&pct) {
                    return Err(format!("minHealthy percentage must be 0-100, got {s}"));
                }
            }
            IntOrString::Int(_) => {}
        }

        let escalating = self.escalating_remediations.as_deref();
        match (&self.remediation_template, escalating) {
            (Some(_), Some(_)) => {
                return Err(
                    "remediationTemplate and escalatingRemediations are mutually exclusive"
                        .to_string(),
                );
            }
            (None, None) => {
                return Err(
                    "one of remediationTemplate or escalatingRemediations is required".to_string(),
                );
            }
            (None, Some(steps)) if steps.is_empty() => {
                return Err("escalatingRemediations must not be empty".to_string());
            }
            _ => {}
        }

        if let Some(steps) = escalating {
            let mut orders: Vec<i32> = steps.iter().map(|s| s.order).collect();
            orders.sort_unstable();
            orders.dedup();
            if orders.len() != steps.len() {
                return Err("escalatingRemediations order values must be unique".to_string());
            }
            for step in steps {
                parse_duration(&step.timeout)
                    .map_err(|e| format!("invalid escalation timeout {:?}: {e}", step.timeout))?;
            }
        }

        for cond in &self.unhealthy_conditions {
            parse_duration(&cond.duration).map_err(|e| {
                format!(
                    "invalid duration {:?} for condition {}: {e}",
                    cond.duration, cond.condition_type
                )
            })?;
        }

        Ok(())
    }
}

/// Parse a percentage string like "51%"
fn parse_percentage(s: &str) -> Result<i64, String> {
    s.strip_suffix('%')
        .ok_or_else(|| format!("expected a percentage like \"51%\", got {s:?}"))?
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("invalid percentage {s:?}: {e}"))
}

/// Compute the scaled minHealthy value against the observed node count.
///
/// Percentages round up, so "51%" of 3 nodes is 2.
pub fn scaled_min_healthy(min_healthy: &IntOrString, observed: usize) -> Result<i32, String> {
    match min_healthy {
        IntOrString::Int(n) => Ok(*n),
        IntOrString::String(s) => {
            let pct = parse_percentage(s)?;
            let observed = i64::try_from(observed).map_err(|e| e.to_string())?;
            let scaled = (pct * observed + 99) / 100;
            i32::try_from(scaled).map_err(|e| e.to_string())
        }
    }
}

/// Parse a Go-style duration string: an optional sequence of
/// `<number><unit>` terms with units `s`, `m` or `h` ("90s", "5m", "1h30m").
pub fn parse_duration(s: &str) -> Result<chrono::Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    let mut total_seconds: i64 = 0;
    let mut digits = String::new();
    let mut saw_term = false;
    for ch in s.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else {
            let value: i64 = digits
                .parse()
                .map_err(|_| format!("invalid duration {s:?}"))?;
            let unit = match ch {
                's' => 1,
                'm' => 60,
                'h' => 3600,
                _ => return Err(format!("invalid duration unit {ch:?} in {s:?}")),
            };
            total_seconds += value * unit;
            digits.clear();
            saw_term = true;
        }
    }
    if !digits.is_empty() || !saw_term {
        return Err(format!("duration {s:?} must end with a unit (s, m, h)"));
    }
    Ok(chrono::Duration::seconds(total_seconds))
}
