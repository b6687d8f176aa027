//! Custom Resource Definitions for the node health-check controller

pub mod healthcheckpolicy;

pub use healthcheckpolicy::{
    EscalatingRemediation, HealthCheckPolicy, HealthCheckPolicySpec, HealthCheckPolicyStatus,
    PolicyCondition, PolicyPhase, RemediationAttempt, RemediationResource, TemplateRef,
    UnhealthyCondition, UnhealthyNodeStatus,
};
