//! Typed access to attachment objects and the workload descriptor
//!
//! No retries happen here: `NotFound` is reported distinctly and every other
//! failure is `Unavailable`, so the reconciler can branch on the difference.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use super::NetworkAttachmentSpec;
use crate::crd::{NetworkAttachmentDefinition, NETWORK_ATTACHMENT_CRD_NAME};
use crate::{Error, FIELD_MANAGER};

const NAD_KIND: &str = "NetworkAttachmentDefinition";
const STATEFULSET_KIND: &str = "StatefulSet";

/// The parts of one pod template container the reconcilers inspect
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerView {
    /// Container name
    pub name: String,
    /// `securityContext.capabilities.add`
    pub capabilities_add: Vec<String>,
    /// `securityContext.privileged`
    pub privileged: bool,
    /// Resource requests as quantity strings
    pub requests: BTreeMap<String, String>,
    /// Resource limits as quantity strings
    pub limits: BTreeMap<String, String>,
}

/// Read-only view of the StatefulSet pod template
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkloadDescriptor {
    /// Pod template annotations
    pub annotations: BTreeMap<String, String>,
    /// Pod template containers, in declaration order
    pub containers: Vec<ContainerView>,
}

impl WorkloadDescriptor {
    /// Project a StatefulSet onto the fields the reconcilers compare
    pub fn from_stateful_set(sts: &StatefulSet) -> Self {
        let template = sts.spec.as_ref().map(|s| &s.template);
        let annotations = template
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.annotations.clone())
            .unwrap_or_default();
        let containers = template
            .and_then(|t| t.spec.as_ref())
            .map(|spec| {
                spec.containers
                    .iter()
                    .map(|c| {
                        let security = c.security_context.as_ref();
                        ContainerView {
                            name: c.name.clone(),
                            capabilities_add: security
                                .and_then(|s| s.capabilities.as_ref())
                                .and_then(|caps| caps.add.clone())
                                .unwrap_or_default(),
                            privileged: security.and_then(|s| s.privileged).unwrap_or(false),
                            requests: quantities(
                                c.resources.as_ref().and_then(|r| r.requests.as_ref()),
                            ),
                            limits: quantities(c.resources.as_ref().and_then(|r| r.limits.as_ref())),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            annotations,
            containers,
        }
    }

    /// Look up a container by name
    pub fn container(&self, name: &str) -> Option<&ContainerView> {
        self.containers.iter().find(|c| c.name == name)
    }
}

fn quantities(m: Option<&BTreeMap<String, Quantity>>) -> BTreeMap<String, String> {
    m.map(|m| m.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect())
        .unwrap_or_default()
}

/// Changes to a single container of the pod template
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerPatch {
    /// Container name, the merge key
    pub name: String,
    /// Full desired `capabilities.add` list
    pub capabilities_add: Option<Vec<String>>,
    /// Desired `privileged` flag
    pub privileged: Option<bool>,
    /// Resources set identically in requests and limits
    pub resources: BTreeMap<String, String>,
}

/// A partial update of the StatefulSet pod template
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkloadDescriptorPatch {
    /// Annotations to set on the pod template
    pub annotations: BTreeMap<String, String>,
    /// Per-container changes
    pub containers: Vec<ContainerPatch>,
}

impl WorkloadDescriptorPatch {
    /// Render as a strategic merge patch body.
    ///
    /// Containers merge by name; `capabilities.add` is an atomic list, so the
    /// patch carries the complete desired list.
    pub fn to_strategic_patch(&self) -> Value {
        let mut template = Map::new();
        if !self.annotations.is_empty() {
            template.insert("metadata".into(), json!({ "annotations": self.annotations }));
        }
        if !self.containers.is_empty() {
            let containers: Vec<Value> = self.containers.iter().map(container_patch_body).collect();
            template.insert("spec".into(), json!({ "containers": containers }));
        }
        json!({ "spec": { "template": Value::Object(template) } })
    }
}

fn container_patch_body(patch: &ContainerPatch) -> Value {
    let mut container = Map::new();
    container.insert("name".into(), json!(patch.name));

    let mut security = Map::new();
    if let Some(add) = &patch.capabilities_add {
        security.insert("capabilities".into(), json!({ "add": add }));
    }
    if let Some(privileged) = patch.privileged {
        security.insert("privileged".into(), json!(privileged));
    }
    if !security.is_empty() {
        container.insert("securityContext".into(), Value::Object(security));
    }
    if !patch.resources.is_empty() {
        container.insert(
            "resources".into(),
            json!({ "requests": patch.resources, "limits": patch.resources }),
        );
    }
    Value::Object(container)
}

/// Namespace-scoped CRUD over attachment objects and the workload descriptor
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AttachmentRepository: Send + Sync {
    /// Whether the NetworkAttachmentDefinition API is served (Multus installed)
    async fn attachment_api_available(&self) -> Result<bool, Error>;

    /// Fetch an attachment object; `NotFound` when absent
    async fn get(&self, name: &str) -> Result<NetworkAttachmentDefinition, Error>;

    /// Create an attachment object from its desired spec
    async fn create(&self, spec: &NetworkAttachmentSpec) -> Result<(), Error>;

    /// Delete an attachment object; `NotFound` when absent
    async fn delete(&self, name: &str) -> Result<(), Error>;

    /// Fetch the pod template view of the workload descriptor
    async fn get_workload_descriptor(&self, name: &str) -> Result<WorkloadDescriptor, Error>;

    /// Merge-patch the workload descriptor's pod template
    async fn patch_workload_descriptor(
        &self,
        name: &str,
        patch: &WorkloadDescriptorPatch,
    ) -> Result<(), Error>;
}

/// Real Kubernetes implementation
pub struct KubeAttachmentRepository {
    client: Client,
    namespace: String,
}

impl KubeAttachmentRepository {
    /// Create a repository scoped to `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn attachments(&self) -> Api<NetworkAttachmentDefinition> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn stateful_sets(&self) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl AttachmentRepository for KubeAttachmentRepository {
    async fn attachment_api_available(&self) -> Result<bool, Error> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        match crds.get_opt(NETWORK_ATTACHMENT_CRD_NAME).await {
            Ok(found) => Ok(found.is_some()),
            Err(e) => Err(Error::from_kube(
                "CustomResourceDefinition",
                NETWORK_ATTACHMENT_CRD_NAME,
                "attachment_api_available",
                e,
            )),
        }
    }

    async fn get(&self, name: &str) -> Result<NetworkAttachmentDefinition, Error> {
        self.attachments()
            .get(name)
            .await
            .map_err(|e| Error::from_kube(NAD_KIND, name, "get_attachment", e))
    }

    async fn create(&self, spec: &NetworkAttachmentSpec) -> Result<(), Error> {
        let resource = spec.to_resource();
        self.attachments()
            .create(&PostParams::default(), &resource)
            .await
            .map_err(|e| Error::from_kube(NAD_KIND, &spec.name, "create_attachment", e))?;
        info!(attachment = %spec.name, namespace = %self.namespace, "NetworkAttachmentDefinition created");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        self.attachments()
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_kube(NAD_KIND, name, "delete_attachment", e))?;
        info!(attachment = %name, namespace = %self.namespace, "NetworkAttachmentDefinition deleted");
        Ok(())
    }

    async fn get_workload_descriptor(&self, name: &str) -> Result<WorkloadDescriptor, Error> {
        let sts = self
            .stateful_sets()
            .get(name)
            .await
            .map_err(|e| Error::from_kube(STATEFULSET_KIND, name, "get_workload_descriptor", e))?;
        Ok(WorkloadDescriptor::from_stateful_set(&sts))
    }

    async fn patch_workload_descriptor(
        &self,
        name: &str,
        patch: &WorkloadDescriptorPatch,
    ) -> Result<(), Error> {
        let body = patch.to_strategic_patch();
        debug!(statefulset = %name, patch = %body, "patching workload descriptor");
        self.stateful_sets()
            .patch(
                name,
                &PatchParams {
                    field_manager: Some(FIELD_MANAGER.to_string()),
                    ..Default::default()
                },
                &Patch::Strategic(&body),
            )
            .await
            .map_err(|e| Error::from_kube(STATEFULSET_KIND, name, "patch_workload_descriptor", e))?;
        Ok(())
    }
}
