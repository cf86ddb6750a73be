//! Workload containers of the user-plane instance
//!
//! Everything that happens inside a running container goes through a
//! [`WorkloadGateway`]:
//! - [`ConfigReconciler`]: configuration document, routes, firewall rule,
//!   supervision declaration and the restart/replace decision of `bessd`
//! - [`BootstrapRunner`]: the one-time pipeline bootstrap
//! - [`SidecarReconciler`]: supervision declaration of `pfcp-agent`

mod bootstrap;
mod config_file;
mod declaration;
mod gateway;
mod reconciler;
mod sidecar;

pub use bootstrap::{
    BootstrapOutcome, BootstrapRunner, BootstrapState, BOOTSTRAP_COMMAND, BOOTSTRAP_MARKER_CONTENT,
};
pub use config_file::{render, stored_hwcksum, ConfigInputs};
pub use declaration::{
    bessd_command, bessd_declaration, bessd_environment, pfcp_agent_declaration, CheckDeclaration,
    ServiceDeclaration, SupervisionDeclaration, TcpCheck, BESSD_LAYER, ONLINE_CHECK,
    PFCP_AGENT_LAYER,
};
pub use gateway::{argv, log_output, ExecOutput, KubeExecGateway, WorkloadGateway};
pub use reconciler::{
    plan, route_facts, ConfigPlan, ConfigReconciler, ConfigReport, Decision, DesiredWorkload,
    ObservedWorkload, RouteFacts,
};
pub use sidecar::SidecarReconciler;

#[cfg(test)]
pub use gateway::MockWorkloadGateway;
