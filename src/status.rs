//! Readiness aggregation
//!
//! [`evaluate`] folds the facts of one pass into a single verdict. Checks run
//! in a fixed priority order and the first failing one wins, so the reported
//! reason is always the most fundamental unmet dependency.

use crate::capability::CapabilityGate;
use crate::crd::{UpfPhase, UserPlaneFunctionStatus};

/// Status message when the attachment CRD is missing
pub const MULTUS_MISSING_MESSAGE: &str = "Multus is not installed or enabled";

/// Facts gathered by a pass, each queried fresh.
///
/// `Default` is "nothing ready yet": a pass that stops gathering at the first
/// unmet fact leaves the rest `false`, which [`evaluate`] never reaches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadinessFacts {
    /// CPU and HugePages requirements
    pub capability: CapabilityGate,
    /// NetworkAttachmentDefinition CRD is installed
    pub multus_available: bool,
    /// Forwarder container supervisor answers
    pub bessd_container_ready: bool,
    /// Attachments and pod template annotation are in place
    pub multus_ready: bool,
    /// Default route via the core gateway exists
    pub default_route: bool,
    /// Route to the gNodeB subnet exists
    pub ran_route: bool,
    /// Persistent configuration directory is mounted
    pub storage_attached: bool,
    /// `bessd` is running
    pub bessd_running: bool,
    /// `routectl` is running
    pub routectl_running: bool,
    /// `pfcp-agent` is running
    pub pfcp_agent_running: bool,
}

impl Default for ReadinessFacts {
    fn default() -> Self {
        Self {
            capability: CapabilityGate::Met,
            multus_available: false,
            bessd_container_ready: false,
            multus_ready: false,
            default_route: false,
            ran_route: false,
            storage_attached: false,
            bessd_running: false,
            routectl_running: false,
            pfcp_agent_running: false,
        }
    }
}

impl ReadinessFacts {
    /// Facts of a fully converged instance
    pub fn all_ready() -> Self {
        Self {
            capability: CapabilityGate::Met,
            multus_available: true,
            bessd_container_ready: true,
            multus_ready: true,
            default_route: true,
            ran_route: true,
            storage_attached: true,
            bessd_running: true,
            routectl_running: true,
            pfcp_agent_running: true,
        }
    }
}

/// Aggregated readiness
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    /// Blocked, Waiting or Active
    pub phase: UpfPhase,
    /// Reason; empty when active
    pub message: String,
}

impl Verdict {
    /// A condition only the user can fix
    pub fn blocked(message: impl Into<String>) -> Self {
        Self {
            phase: UpfPhase::Blocked,
            message: message.into(),
        }
    }

    /// A dependency still converging
    pub fn waiting(message: impl Into<String>) -> Self {
        Self {
            phase: UpfPhase::Waiting,
            message: message.into(),
        }
    }

    /// Everything running
    pub fn active() -> Self {
        Self {
            phase: UpfPhase::Active,
            message: String::new(),
        }
    }

    /// Whether the instance is serving
    pub fn is_active(&self) -> bool {
        self.phase == UpfPhase::Active
    }

    /// Status carrying this verdict
    pub fn into_status(self) -> UserPlaneFunctionStatus {
        UserPlaneFunctionStatus::with_phase(self.phase).message(self.message)
    }
}

/// Fold facts into a verdict
pub fn evaluate(facts: &ReadinessFacts) -> Verdict {
    if let CapabilityGate::Unmet(reason) = &facts.capability {
        return Verdict::blocked(reason.clone());
    }
    if !facts.multus_available {
        return Verdict::blocked(MULTUS_MISSING_MESSAGE);
    }

    let waiting = [
        (facts.bessd_container_ready, "Waiting for bessd container to be ready"),
        (facts.multus_ready, "Waiting for Multus to be ready"),
        (facts.default_route, "Waiting for default route creation"),
        (facts.ran_route, "Waiting for RAN route creation"),
        (facts.storage_attached, "Waiting for storage to be attached"),
        (facts.bessd_running, "Waiting for bessd service to run"),
        (facts.routectl_running, "Waiting for routectl service to run"),
        (facts.pfcp_agent_running, "Waiting for pfcp agent service to run"),
    ];
    waiting
        .iter()
        .find(|(ready, _)| !ready)
        .map(|(_, message)| Verdict::waiting(*message))
        .unwrap_or_else(Verdict::active)
}
