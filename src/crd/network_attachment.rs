//! Multus NetworkAttachmentDefinition
//!
//! Owned by Multus, not by this operator. The type exists so the attachment
//! repository can create and read the objects with a typed `Api`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Name of the CRD that must exist for Multus to be considered installed
pub const NETWORK_ATTACHMENT_CRD_NAME: &str = "network-attachment-definitions.k8s.cni.cncf.io";

/// Annotation binding a NetworkAttachmentDefinition to a device plugin resource
pub const RESOURCE_NAME_ANNOTATION: &str = "k8s.v1.cni.cncf.io/resourceName";

/// Specification of a NetworkAttachmentDefinition
///
/// `config` is the CNI configuration as a JSON string.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "k8s.cni.cncf.io",
    version = "v1",
    kind = "NetworkAttachmentDefinition",
    plural = "network-attachment-definitions",
    shortname = "net-attach-def",
    derive = "Default",
    namespaced
)]
pub struct NetworkAttachmentDefinitionSpec {
    /// CNI configuration document
    #[serde(default)]
    pub config: String,
}
