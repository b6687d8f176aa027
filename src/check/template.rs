//! Remediation request materialisation
//!
//! A remediation request is produced from a user-supplied template object:
//! the template's `spec.template` becomes the request body, the kind loses
//! its `Template` suffix, and the request is named after the unhealthy node.
//! Templates and requests are opaque to this controller beyond a handful of
//! metadata and status paths, so both sides are handled as `DynamicObject`.

use crate::check::types::{Context, Error, Result, CONTROLLER_NAME};
use crate::crds::{HealthCheckPolicy, RemediationResource, TemplateRef};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind};
use kube::{Client, Resource, ResourceExt};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// Suffix a template kind must carry; stripped to obtain the request kind
pub const TEMPLATE_SUFFIX: &str = "Template";

/// Label applied to every request object this controller creates
pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";

/// Node annotation pointing at the backing machine, `<namespace>/<name>`
pub const MACHINE_ANNOTATION: &str = "machine.openshift.io/machine";

/// Template kind that is pinned to the platform machine-api namespace
pub const METAL3_TEMPLATE_KIND: &str = "Metal3RemediationTemplate";

/// The only namespace a Metal3 remediation template may live in
pub const METAL3_NAMESPACE: &str = "openshift-machine-api";

impl TemplateRef {
    /// Kind of the request objects produced from this template
    #[must_use]
    pub fn remediation_kind(&self) -> &str {
        self.kind.strip_suffix(TEMPLATE_SUFFIX).unwrap_or(&self.kind)
    }

    /// `ApiResource` for the template object itself
    #[must_use]
    pub fn template_api_resource(&self) -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk(
            self.group(),
            self.version(),
            &self.kind,
        ))
    }

    /// `ApiResource` for the request objects produced from this template
    #[must_use]
    pub fn request_api_resource(&self) -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk(
            self.group(),
            self.version(),
            self.remediation_kind(),
        ))
    }

    /// Identity of the request object this template produces for a node
    #[must_use]
    pub fn request_resource(&self, node_name: &str) -> RemediationResource {
        RemediationResource {
            api_version: self.api_version.clone(),
            kind: self.remediation_kind().to_string(),
            name: node_name.to_string(),
            namespace: self.namespace.clone(),
        }
    }
}

/// Namespaced API handle for the request objects of a template
#[must_use]
pub fn request_api(client: &Client, template: &TemplateRef) -> Api<DynamicObject> {
    Api::namespaced_with(
        client.clone(),
        &template.namespace,
        &template.request_api_resource(),
    )
}

/// Namespaced API handle for a recorded request resource
#[must_use]
pub fn resource_api(client: &Client, resource: &RemediationResource) -> Api<DynamicObject> {
    let group_version = resource
        .api_version
        .split_once('/')
        .unwrap_or(("", resource.api_version.as_str()));
    let ar = ApiResource::from_gvk(&GroupVersionKind::gvk(
        group_version.0,
        group_version.1,
        &resource.kind,
    ));
    Api::namespaced_with(client.clone(), &resource.namespace, &ar)
}

/// Static checks on a template reference, before touching the cluster.
///
/// Metal3 remediation templates are only honoured from the platform
/// machine-api namespace; anywhere else disables the policy.
pub fn validate_template_ref(template: &TemplateRef) -> Result<()> {
    if !template.kind.ends_with(TEMPLATE_SUFFIX) {
        return Err(Error::TemplateInvalid {
            kind: template.kind.clone(),
            name: template.name.clone(),
            namespace: template.namespace.clone(),
            reason: format!("kind must end with the {TEMPLATE_SUFFIX:?} suffix"),
        });
    }
    if template.kind == METAL3_TEMPLATE_KIND && template.namespace != METAL3_NAMESPACE {
        return Err(Error::TemplateInvalid {
            kind: template.kind.clone(),
            name: template.name.clone(),
            namespace: template.namespace.clone(),
            reason: format!("{METAL3_TEMPLATE_KIND} is only supported in {METAL3_NAMESPACE}"),
        });
    }
    Ok(())
}

/// Fetch the template object behind a reference
pub async fn fetch_template(client: &Client, template: &TemplateRef) -> Result<DynamicObject> {
    let api: Api<DynamicObject> = Api::namespaced_with(
        client.clone(),
        &template.namespace,
        &template.template_api_resource(),
    );
    api.get_opt(&template.name)
        .await?
        .ok_or_else(|| Error::TemplateNotFound {
            kind: template.kind.clone(),
            name: template.name.clone(),
            namespace: template.namespace.clone(),
        })
}

/// Build a request object from a fetched template. Pure: the caller supplies
/// the template body and the owner references to attach.
pub fn instantiate_request(
    template_obj: &DynamicObject,
    template: &TemplateRef,
    node_name: &str,
    owners: Vec<OwnerReference>,
) -> Result<DynamicObject> {
    let body = template_obj
        .data
        .get("spec")
        .and_then(|spec| spec.get("template"))
        .and_then(Value::as_object)
        .ok_or_else(|| Error::TemplateMalformed {
            kind: template.kind.clone(),
            name: template.name.clone(),
            namespace: template.namespace.clone(),
        })?;

    let mut body = body.clone();
    // identity comes from us, never from the template body
    body.remove("apiVersion");
    body.remove("kind");
    body.remove("metadata");

    let mut request = DynamicObject::new(node_name, &template.request_api_resource())
        .within(&template.namespace);
    request.data = Value::Object(body);
    request.metadata.labels = Some(BTreeMap::from([(
        PART_OF_LABEL.to_string(),
        CONTROLLER_NAME.to_string(),
    )]));
    request.metadata.owner_references = Some(owners);
    Ok(request)
}

/// Owner reference pointing at the policy: plain ownership, not a
/// controller reference, and no deletion blocking
#[must_use]
pub fn policy_owner_reference(policy: &HealthCheckPolicy) -> OwnerReference {
    OwnerReference {
        api_version: HealthCheckPolicy::api_version(&()).to_string(),
        kind: HealthCheckPolicy::kind(&()).to_string(),
        name: policy.name_any(),
        uid: policy.meta().uid.clone().unwrap_or_default(),
        controller: Some(false),
        block_owner_deletion: None,
    }
}

/// Resolve the node's backing machine (via the well-known annotation) into
/// an owner reference. Missing or malformed annotations only log; the
/// policy owner is always attached regardless.
pub async fn machine_owner_reference(client: &Client, node: &Node) -> Option<OwnerReference> {
    let annotation = node.annotations().get(MACHINE_ANNOTATION)?;
    let Some((namespace, name)) = annotation.split_once('/') else {
        warn!(
            node = %node.name_any(),
            annotation = %annotation,
            "machine annotation is not <namespace>/<name>, skipping machine owner"
        );
        return None;
    };

    let ar = ApiResource::from_gvk(&GroupVersionKind::gvk(
        "machine.openshift.io",
        "v1beta1",
        "Machine",
    ));
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &ar);
    match api.get_opt(name).await {
        Ok(Some(machine)) => Some(OwnerReference {
            api_version: "machine.openshift.io/v1beta1".to_string(),
            kind: "Machine".to_string(),
            name: name.to_string(),
            uid: machine.metadata.uid.clone().unwrap_or_default(),
            controller: Some(false),
            block_owner_deletion: None,
        }),
        Ok(None) => {
            warn!(node = %node.name_any(), machine = %annotation, "backing machine not found");
            None
        }
        Err(e) => {
            warn!(node = %node.name_any(), error = %e, "failed to fetch backing machine");
            None
        }
    }
}

/// Materialise a request object for a node, or a nameless probe request
/// when `node` is `None` (used by the template-validation gate).
pub async fn build_remediation_request(
    ctx: &Context,
    policy: &HealthCheckPolicy,
    template: &TemplateRef,
    node: Option<&Node>,
) -> Result<DynamicObject> {
    validate_template_ref(template)?;
    let template_obj = fetch_template(&ctx.client, template).await?;

    let mut owners = vec![policy_owner_reference(policy)];
    if let Some(node) = node {
        if template.kind == METAL3_TEMPLATE_KIND {
            if let Some(machine) = machine_owner_reference(&ctx.client, node).await {
                owners.push(machine);
            }
        }
    }

    let node_name = node.map(ResourceExt::name_any).unwrap_or_default();
    instantiate_request(&template_obj, template, &node_name, owners)
}

/// Whether the object carries an owner reference matching the policy.
///
/// Matches on name + kind + apiVersion; UIDs are compared only when both
/// sides carry one (freshly created policies may not be populated yet).
#[must_use]
pub fn owned_by_policy(obj: &DynamicObject, policy: &HealthCheckPolicy) -> bool {
    let policy_uid = policy.meta().uid.as_deref().unwrap_or_default();
    obj.owner_references().iter().any(|owner| {
        owner.name == policy.name_any()
            && owner.kind == HealthCheckPolicy::kind(&())
            && owner.api_version == HealthCheckPolicy::api_version(&())
            && (owner.uid.is_empty() || policy_uid.is_empty() || owner.uid == policy_uid)
    })
}
