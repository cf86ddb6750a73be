//! Secondary networks of the user-plane workload
//!
//! The access (N3) and core (N6) networks are provided by Multus. Each pass
//! recomputes the desired NetworkAttachmentDefinitions and the pod template
//! annotation from configuration; nothing here is persisted independently.

mod dpdk;
mod reconciler;
mod repository;

pub use dpdk::{DpdkDescriptor, DPDK_ACCESS_RESOURCE, DPDK_CORE_RESOURCE};
pub use reconciler::AttachmentReconciler;
pub use repository::{
    AttachmentRepository, ContainerPatch, ContainerView, KubeAttachmentRepository,
    WorkloadDescriptor, WorkloadDescriptorPatch,
};

#[cfg(test)]
pub use repository::MockAttachmentRepository;

use std::collections::BTreeMap;

use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{CniType, IpCidr, MacAddress, UpfConfig, UpfMode};
use crate::crd::{NetworkAttachmentDefinition, NetworkAttachmentDefinitionSpec, RESOURCE_NAME_ANNOTATION};
use crate::{ACCESS_INTERFACE_NAME, CORE_INTERFACE_NAME};

/// Pod template annotation Multus reads the network selection from
pub const NETWORKS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";

/// Capability added to containers that configure routes and firewall rules
pub const NET_ADMIN_CAPABILITY: &str = "NET_ADMIN";

/// NetworkAttachmentDefinition of the access network
pub const ACCESS_NETWORK_NAME: &str = "access-net";

/// NetworkAttachmentDefinition of the core network
pub const CORE_NETWORK_NAME: &str = "core-net";

/// Bridge used by the access network when no host interface is configured
pub const ACCESS_BRIDGE_NAME: &str = "access-br";

/// Bridge used by the core network when no host interface is configured
pub const CORE_BRIDGE_NAME: &str = "core-br";

const CNI_VERSION: &str = "0.3.1";

/// Which secondary network an interface belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterfaceRole {
    /// N3, toward the RAN
    Access,
    /// N6, toward the data network
    Core,
}

impl InterfaceRole {
    /// Interface name inside the pod
    pub fn interface_name(&self) -> &'static str {
        match self {
            Self::Access => ACCESS_INTERFACE_NAME,
            Self::Core => CORE_INTERFACE_NAME,
        }
    }

    /// Name of the attachment object
    pub fn network_name(&self) -> &'static str {
        match self {
            Self::Access => ACCESS_NETWORK_NAME,
            Self::Core => CORE_NETWORK_NAME,
        }
    }

    fn bridge_name(&self) -> &'static str {
        match self {
            Self::Access => ACCESS_BRIDGE_NAME,
            Self::Core => CORE_BRIDGE_NAME,
        }
    }

    fn dpdk_resource(&self) -> &'static str {
        match self {
            Self::Access => DPDK_ACCESS_RESOURCE,
            Self::Core => DPDK_CORE_RESOURCE,
        }
    }
}

/// Desired secondary network attachment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkAttachmentSpec {
    /// Object name
    pub name: String,
    /// Access or core
    pub role: InterfaceRole,
    /// CNI plugin
    pub cni_type: CniType,
    /// Optional MTU, ignored by host-device
    pub mtu: Option<u32>,
    /// Static address; `None` leaves addressing to the pod annotation
    pub address: Option<IpCidr>,
    /// MAC address carried by the annotation
    pub mac: Option<MacAddress>,
    /// Host interface for macvlan (`master`) or host-device (`device`)
    pub host_interface: Option<String>,
    /// Bridge name when no host interface is set
    pub bridge: Option<String>,
    /// Device plugin resource backing the attachment
    pub resource_name: Option<String>,
}

impl NetworkAttachmentSpec {
    /// Attachment for a kernel-mode (`af_packet`) forwarder
    fn kernel(config: &UpfConfig, role: InterfaceRole) -> Self {
        let iface = match role {
            InterfaceRole::Access => &config.access,
            InterfaceRole::Core => &config.core,
        };
        let (host_interface, bridge) = match &iface.host_interface {
            Some(host) => (Some(host.clone()), None),
            None => (None, Some(role.bridge_name().to_string())),
        };
        Self {
            name: role.network_name().to_string(),
            role,
            cni_type: config.cni_type,
            mtu: iface.mtu,
            address: Some(iface.ip),
            mac: None,
            host_interface,
            bridge,
            resource_name: None,
        }
    }

    /// Attachment backed by an SR-IOV VF; addressing moves to the annotation
    fn dpdk(role: InterfaceRole) -> Self {
        Self {
            name: role.network_name().to_string(),
            role,
            cni_type: CniType::Vfioveth,
            mtu: None,
            address: None,
            mac: None,
            host_interface: None,
            bridge: None,
            resource_name: Some(role.dpdk_resource().to_string()),
        }
    }

    /// CNI configuration document of the attachment
    pub fn cni_config(&self) -> serde_json::Value {
        let mut config = json!({
            "cniVersion": CNI_VERSION,
            "ipam": { "type": "static" },
            "capabilities": { "mac": true },
        });

        if self.cni_type != CniType::HostDevice {
            if let Some(mtu) = self.mtu {
                config["mtu"] = json!(mtu);
            }
        }
        if let Some(address) = &self.address {
            config["ipam"]["addresses"] = json!([{ "address": address.to_string() }]);
        }
        match (&self.host_interface, self.cni_type) {
            (Some(host), CniType::Macvlan) => config["master"] = json!(host),
            (Some(host), CniType::HostDevice) => config["device"] = json!(host),
            _ => {}
        }
        if let Some(bridge) = &self.bridge {
            config["bridge"] = json!(bridge);
        }
        config["type"] = json!(self.cni_type.as_str());
        config
    }

    /// The NetworkAttachmentDefinition to create for this spec
    pub fn to_resource(&self) -> NetworkAttachmentDefinition {
        let annotations = self.resource_name.as_ref().map(|resource| {
            BTreeMap::from([(RESOURCE_NAME_ANNOTATION.to_string(), resource.clone())])
        });
        NetworkAttachmentDefinition {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                annotations,
                ..Default::default()
            },
            spec: NetworkAttachmentDefinitionSpec {
                config: self.cni_config().to_string(),
            },
        }
    }
}

/// One entry of the pod's network selection annotation
///
/// Serialized positionally into a JSON list; the order matters when the
/// observed annotation is compared with the desired one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAnnotation {
    /// Attachment object name
    pub name: String,
    /// Interface name inside the pod
    pub interface: String,
    /// MAC address of the interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Addresses with prefix length
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<String>>,
}

/// Serialize annotations the way they are stored on the pod template
pub fn annotation_value(annotations: &[NetworkAnnotation]) -> crate::Result<String> {
    Ok(serde_json::to_string(annotations)?)
}

/// Desired attachment objects, access first
pub fn desired_attachments(config: &UpfConfig) -> Vec<NetworkAttachmentSpec> {
    [InterfaceRole::Access, InterfaceRole::Core]
        .into_iter()
        .map(|role| match config.upf_mode {
            UpfMode::Dpdk => NetworkAttachmentSpec::dpdk(role),
            UpfMode::AfPacket => NetworkAttachmentSpec::kernel(config, role),
        })
        .collect()
}

/// Desired network selection annotation, one entry per interface role
pub fn desired_annotations(config: &UpfConfig) -> Vec<NetworkAnnotation> {
    [
        (InterfaceRole::Access, &config.access),
        (InterfaceRole::Core, &config.core),
    ]
    .into_iter()
    .map(|(role, iface)| {
        let mut annotation = NetworkAnnotation {
            name: role.network_name().to_string(),
            interface: role.interface_name().to_string(),
            mac: None,
            ips: None,
        };
        if config.upf_mode == UpfMode::Dpdk {
            annotation.mac = iface.mac.as_ref().map(|m| m.to_string());
            annotation.ips = Some(vec![iface.ip.to_string()]);
        }
        annotation
    })
    .collect()
}
