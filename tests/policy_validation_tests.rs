//! Admission-rule tests for `HealthCheckPolicy`
//!
//! Exercises the declarative contract: defaulting of unhealthyConditions
//! and minHealthy, and the validation rules an admission webhook applies
//! through `HealthCheckPolicySpec::validate`.

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use nodehealth::crds::{HealthCheckPolicySpec, TemplateRef};

fn spec_from_yaml(yaml: &str) -> HealthCheckPolicySpec {
    serde_yaml::from_str(yaml).expect("spec should deserialize")
}

fn template_yaml(name: &str) -> String {
    format!(
        r#"
  apiVersion: self-node-remediation.medik8s.io/v1alpha1
  kind: SelfNodeRemediationTemplate
  name: {name}
  namespace: remediation-system
"#
    )
}

#[test]
fn minimal_policy_gets_defaults() {
    let spec = spec_from_yaml(&format!(
        "selector: {{}}\nremediationTemplate:{}",
        template_yaml("snr")
    ));

    assert_eq!(spec.min_healthy, IntOrString::String("51%".to_string()));
    assert_eq!(spec.unhealthy_conditions.len(), 2);
    assert_eq!(spec.unhealthy_conditions[0].condition_type, "Ready");
    assert_eq!(spec.unhealthy_conditions[0].status, "False");
    assert_eq!(spec.unhealthy_conditions[0].duration, "5m");
    assert_eq!(spec.unhealthy_conditions[1].status, "Unknown");
    assert!(spec.pause_requests.is_empty());
    assert!(spec.validate().is_ok());
}

#[test]
fn rejects_min_healthy_above_hundred_percent() {
    let mut spec = spec_from_yaml(&format!(
        "selector: {{}}\nremediationTemplate:{}",
        template_yaml("snr")
    ));
    spec.min_healthy = IntOrString::String("101%".to_string());
    let err = spec.validate().unwrap_err();
    assert!(err.contains("0-100"), "unexpected error: {err}");
}

#[test]
fn rejects_negative_min_healthy() {
    let mut spec = spec_from_yaml(&format!(
        "selector: {{}}\nremediationTemplate:{}",
        template_yaml("snr")
    ));
    spec.min_healthy = IntOrString::Int(-3);
    assert!(spec.validate().is_err());
}

#[test]
fn rejects_both_template_forms() {
    let mut spec = spec_from_yaml(&format!(
        "selector: {{}}\nremediationTemplate:{}",
        template_yaml("single")
    ));
    spec.escalating_remediations = Some(vec![nodehealth::crds::EscalatingRemediation {
        remediation_template: template("escalating"),
        order: 0,
        timeout: "5m".to_string(),
    }]);
    let err = spec.validate().unwrap_err();
    assert!(err.contains("mutually exclusive"), "unexpected error: {err}");
}

#[test]
fn rejects_neither_template_form() {
    let spec = spec_from_yaml("selector: {}");
    let err = spec.validate().unwrap_err();
    assert!(err.contains("required"), "unexpected error: {err}");
}

#[test]
fn rejects_duplicate_escalation_orders() {
    let mut spec = spec_from_yaml("selector: {}");
    spec.escalating_remediations = Some(vec![
        nodehealth::crds::EscalatingRemediation {
            remediation_template: template("a"),
            order: 2,
            timeout: "5m".to_string(),
        },
        nodehealth::crds::EscalatingRemediation {
            remediation_template: template("b"),
            order: 2,
            timeout: "10m".to_string(),
        },
    ]);
    let err = spec.validate().unwrap_err();
    assert!(err.contains("unique"), "unexpected error: {err}");
}

#[test]
fn rejects_unparsable_durations() {
    let mut spec = spec_from_yaml(&format!(
        "selector: {{}}\nremediationTemplate:{}",
        template_yaml("snr")
    ));
    spec.unhealthy_conditions[0].duration = "fivemin".to_string();
    assert!(spec.validate().is_err());
}

#[test]
fn accepts_escalating_sequence() {
    let yaml = r#"
selector:
  matchLabels:
    node-role.kubernetes.io/worker: ""
escalatingRemediations:
  - order: 0
    timeout: 5m
    remediationTemplate:
      apiVersion: self-node-remediation.medik8s.io/v1alpha1
      kind: SelfNodeRemediationTemplate
      name: reboot
      namespace: remediation-system
  - order: 5
    timeout: 15m
    remediationTemplate:
      apiVersion: infrastructure.cluster.x-k8s.io/v1beta1
      kind: Metal3RemediationTemplate
      name: reprovision
      namespace: openshift-machine-api
"#;
    let spec = spec_from_yaml(yaml);
    assert!(spec.validate().is_ok());
    let refs = spec.template_refs();
    assert_eq!(refs.len(), 2);
    assert_eq!(refs[0].name, "reboot");
    assert_eq!(refs[1].name, "reprovision");
}

fn template(name: &str) -> TemplateRef {
    TemplateRef {
        api_version: "self-node-remediation.medik8s.io/v1alpha1".to_string(),
        kind: "SelfNodeRemediationTemplate".to_string(),
        name: name.to_string(),
        namespace: "remediation-system".to_string(),
    }
}
