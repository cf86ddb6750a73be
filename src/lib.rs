//! UPF operator - reconciliation engine for a 5G user-plane function on Kubernetes
//!
//! The operator drives a single user-plane instance (the `bessd` packet
//! forwarder plus its `pfcp-agent` sidecar) toward the state described by a
//! `UserPlaneFunction` custom resource.
//!
//! # Architecture
//!
//! Every reconciliation pass reads current state, compares it against the
//! desired state derived from the resource spec, and only then writes:
//! - Secondary networks are attached first (NetworkAttachmentDefinitions and
//!   the StatefulSet pod template annotation)
//! - The workload container is configured next (config file, routes,
//!   firewall rule, supervision declaration, one-time bootstrap)
//! - The sidecar is configured once the forwarder is running
//! - Readiness is folded into a single status verdict
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (UserPlaneFunction, NetworkAttachmentDefinition)
//! - [`config`] - Validation of the resource spec into typed configuration
//! - [`network`] - Attachment repository and reconciler
//! - [`workload`] - Container gateway, configuration and sidecar reconcilers, bootstrap runner
//! - [`capability`] - CPU and HugePages capability gate
//! - [`service`] - External PFCP LoadBalancer Service
//! - [`status`] - Readiness aggregation
//! - [`controller`] - Controller wiring and the reconciliation pass
//! - [`settings`] - Tunable operator constants
//! - [`retry`] - Deadline-bounded retry helper
//! - [`telemetry`] - Tracing subscriber setup
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod capability;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod network;
pub mod retry;
pub mod service;
pub mod settings;
pub mod status;
pub mod telemetry;
pub mod workload;

#[cfg(test)]
pub(crate) mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Workload layout
// =============================================================================
// Names and paths shared by the reconcilers and the status aggregator. They
// describe the container image layout of the user-plane workload and must
// match the StatefulSet the operator is pointed at.

/// Container running the packet forwarder and the route-control helper
pub const BESSD_CONTAINER_NAME: &str = "bessd";

/// Supervised service name of the packet forwarder
pub const BESSD_SERVICE_NAME: &str = "bessd";

/// Supervised service name of the route-control helper
pub const ROUTECTL_SERVICE_NAME: &str = "routectl";

/// Container and service name of the PFCP agent sidecar
pub const PFCP_AGENT_CONTAINER_NAME: &str = "pfcp-agent";

/// Supervised service name of the PFCP agent
pub const PFCP_AGENT_SERVICE_NAME: &str = "pfcp-agent";

/// Directory of the forwarder configuration (persistent storage mount)
pub const BESSD_CONFIG_DIR: &str = "/etc/bess/conf";

/// Directory where the sidecar reads its copy of the configuration
pub const PFCP_AGENT_CONFIG_DIR: &str = "/tmp/conf";

/// Directory shared between the forwarder and the sidecar
pub const POD_SHARE_PATH: &str = "/pod-share";

/// File name of the rendered configuration document
pub const CONFIG_FILE_NAME: &str = "upf.json";

/// Sentinel created once the bootstrap command succeeded.
///
/// Lives outside the persistent volume so a new container instance runs the
/// bootstrap again.
pub const BOOTSTRAP_MARKER_PATH: &str = "/bessctl_configure_executed";

/// gRPC port of the forwarder, also used by its readiness check
pub const BESSD_PORT: u16 = 10514;

/// PFCP (N4) port exposed by the external service
pub const PFCP_PORT: u16 = 8805;

/// Interface name of the access (N3) network inside the pod
pub const ACCESS_INTERFACE_NAME: &str = "access";

/// Interface name of the core (N6) network inside the pod
pub const CORE_INTERFACE_NAME: &str = "core";

/// Field manager used for all server-side writes
pub const FIELD_MANAGER: &str = "upf-operator";

/// Full path of the forwarder configuration document
pub fn bessd_config_path() -> String {
    format!("{}/{}", BESSD_CONFIG_DIR, CONFIG_FILE_NAME)
}

/// Full path of the sidecar configuration document
pub fn pfcp_agent_config_path() -> String {
    format!("{}/{}", PFCP_AGENT_CONFIG_DIR, CONFIG_FILE_NAME)
}
