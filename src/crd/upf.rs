//! UserPlaneFunction Custom Resource Definition
//!
//! A UserPlaneFunction describes one user-plane instance: the StatefulSet of
//! the same name running the `bessd` forwarder and the `pfcp-agent` sidecar,
//! plus the secondary networks it is attached to.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a UserPlaneFunction
///
/// Values are kept as the user wrote them; [`crate::config::UpfConfig`]
/// validates and types them at the start of every pass.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "sdcore.dev",
    version = "v1alpha1",
    kind = "UserPlaneFunction",
    plural = "userplanefunctions",
    shortname = "upf",
    status = "UserPlaneFunctionStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.upfMode"}"#,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".status.message"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UserPlaneFunctionSpec {
    /// CNI plugin used for the access and core networks
    #[serde(default = "default_cni_type")]
    pub cni_type: String,

    /// Forwarding mode: `af_packet` or `dpdk`
    #[serde(default = "default_upf_mode")]
    pub upf_mode: String,

    /// Data network name
    #[serde(default = "default_dnn")]
    pub dnn: String,

    /// Subnet of the gNodeBs, routed through the access gateway
    #[serde(default = "default_gnb_subnet")]
    pub gnb_subnet: String,

    /// Host interface backing the access network (macvlan / host-device)
    #[serde(default)]
    pub access_interface: String,

    /// MAC address of the access interface, required in DPDK mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_interface_mac_address: Option<String>,

    /// Access (N3) address with prefix length
    #[serde(default = "default_access_ip")]
    pub access_ip: String,

    /// Access network gateway
    #[serde(default = "default_access_gateway_ip")]
    pub access_gateway_ip: String,

    /// MTU of the access interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_interface_mtu_size: Option<u32>,

    /// Host interface backing the core network (macvlan / host-device)
    #[serde(default)]
    pub core_interface: String,

    /// MAC address of the core interface, required in DPDK mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core_interface_mac_address: Option<String>,

    /// Core (N6) address with prefix length
    #[serde(default = "default_core_ip")]
    pub core_ip: String,

    /// Core network gateway, used as the default route
    #[serde(default = "default_core_gateway_ip")]
    pub core_gateway_ip: String,

    /// MTU of the core interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core_interface_mtu_size: Option<u32>,

    /// Hostname advertised for N4 instead of the load balancer's
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_upf_hostname: Option<String>,

    /// Offload checksum computation to the NIC
    #[serde(default = "default_true")]
    pub enable_hw_checksum: bool,
}

fn default_cni_type() -> String {
    "bridge".to_string()
}

fn default_upf_mode() -> String {
    "af_packet".to_string()
}

fn default_dnn() -> String {
    "internet".to_string()
}

fn default_gnb_subnet() -> String {
    "192.168.251.0/24".to_string()
}

fn default_access_ip() -> String {
    "192.168.252.3/24".to_string()
}

fn default_access_gateway_ip() -> String {
    "192.168.252.1".to_string()
}

fn default_core_ip() -> String {
    "192.168.250.3/24".to_string()
}

fn default_core_gateway_ip() -> String {
    "192.168.250.1".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for UserPlaneFunctionSpec {
    fn default() -> Self {
        Self {
            cni_type: default_cni_type(),
            upf_mode: default_upf_mode(),
            dnn: default_dnn(),
            gnb_subnet: default_gnb_subnet(),
            access_interface: String::new(),
            access_interface_mac_address: None,
            access_ip: default_access_ip(),
            access_gateway_ip: default_access_gateway_ip(),
            access_interface_mtu_size: None,
            core_interface: String::new(),
            core_interface_mac_address: None,
            core_ip: default_core_ip(),
            core_gateway_ip: default_core_gateway_ip(),
            core_interface_mtu_size: None,
            external_upf_hostname: None,
            enable_hw_checksum: true,
        }
    }
}

/// Readiness phase of a UserPlaneFunction
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UpfPhase {
    /// No pass has completed yet
    #[default]
    Pending,
    /// A condition only the user can fix
    Blocked,
    /// A dependency is still converging
    Waiting,
    /// Every process is running
    Active,
}

impl std::fmt::Display for UpfPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Blocked => write!(f, "Blocked"),
            Self::Waiting => write!(f, "Waiting"),
            Self::Active => write!(f, "Active"),
        }
    }
}

/// Status for a UserPlaneFunction
///
/// Unset fields serialize as `null` so a merge patch clears what an
/// earlier status published.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserPlaneFunctionStatus {
    /// Aggregated readiness verdict
    #[serde(default)]
    pub phase: UpfPhase,

    /// Human-readable reason for the phase
    #[serde(default)]
    pub message: Option<String>,

    /// Address peers use to reach the access interface
    #[serde(default)]
    pub n3_address: Option<String>,

    /// Hostname control planes use for PFCP
    #[serde(default)]
    pub n4_hostname: Option<String>,

    /// Generation of the spec this status was computed from
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

impl UserPlaneFunctionStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: UpfPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        self.message = if msg.is_empty() { None } else { Some(msg) };
        self
    }

    /// Set the published N3 and N4 endpoints
    pub fn endpoints(mut self, n3_address: impl Into<String>, n4_hostname: impl Into<String>) -> Self {
        self.n3_address = Some(n3_address.into());
        self.n4_hostname = Some(n4_hostname.into());
        self
    }

    /// Set the observed generation
    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    /// Story: an empty spec picks up every documented default
    #[test]
    fn story_empty_spec_uses_defaults() {
        let spec: UserPlaneFunctionSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec, UserPlaneFunctionSpec::default());
        assert_eq!(spec.cni_type, "bridge");
        assert_eq!(spec.upf_mode, "af_packet");
        assert_eq!(spec.dnn, "internet");
        assert_eq!(spec.access_ip, "192.168.252.3/24");
        assert!(spec.enable_hw_checksum);
    }

    #[test]
    fn test_spec_uses_camel_case() {
        let spec: UserPlaneFunctionSpec = serde_json::from_str(
            r#"{"upfMode":"dpdk","accessInterfaceMacAddress":"00:11:22:33:44:55","enableHwChecksum":false}"#,
        )
        .unwrap();
        assert_eq!(spec.upf_mode, "dpdk");
        assert_eq!(
            spec.access_interface_mac_address.as_deref(),
            Some("00:11:22:33:44:55")
        );
        assert!(!spec.enable_hw_checksum);
    }

    #[test]
    fn test_crd_metadata() {
        let crd = UserPlaneFunction::crd();
        assert_eq!(
            crd.metadata.name.as_deref(),
            Some("userplanefunctions.sdcore.dev")
        );
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(
            crd.spec.names.short_names,
            Some(vec!["upf".to_string()])
        );
    }

    #[test]
    fn test_status_builder() {
        let status = UserPlaneFunctionStatus::with_phase(UpfPhase::Waiting)
            .message("Waiting for bessd service to run")
            .endpoints("192.168.252.3", "upf.example.com")
            .observed_generation(Some(3));
        assert_eq!(status.phase, UpfPhase::Waiting);
        assert_eq!(status.n3_address.as_deref(), Some("192.168.252.3"));
        assert_eq!(status.observed_generation, Some(3));

        let active = UserPlaneFunctionStatus::with_phase(UpfPhase::Active).message("");
        assert!(active.message.is_none());
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = UserPlaneFunctionStatus::with_phase(UpfPhase::Active).endpoints("10.0.0.1", "h");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "Active");
        assert_eq!(json["n3Address"], "10.0.0.1");
        assert!(json["message"].is_null());
    }
}
