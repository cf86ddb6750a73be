//! PFCP agent sidecar reconciler

use std::sync::Arc;

use tracing::{debug, info};

use super::declaration::{pfcp_agent_declaration, PFCP_AGENT_LAYER};
use super::gateway::WorkloadGateway;
use crate::{Result, PFCP_AGENT_SERVICE_NAME};

/// Keeps the sidecar's declaration current; no files, routes or replacement
pub struct SidecarReconciler {
    gateway: Arc<dyn WorkloadGateway>,
}

impl SidecarReconciler {
    /// Create a reconciler against the sidecar container
    pub fn new(gateway: Arc<dyn WorkloadGateway>) -> Self {
        Self { gateway }
    }

    /// Replace the declaration and restart the agent when the plan differs.
    ///
    /// Returns whether anything was written.
    pub async fn reconcile(&self) -> Result<bool> {
        let desired = pfcp_agent_declaration();
        let observed = self.gateway.get_supervision_declaration().await?;
        if desired.matches(&observed) {
            debug!("pfcp agent declaration up to date");
            return Ok(false);
        }

        self.gateway
            .set_supervision_declaration(PFCP_AGENT_LAYER, &desired)
            .await?;
        self.gateway.restart_service(PFCP_AGENT_SERVICE_NAME).await?;
        info!("Service `pfcp` restarted");
        Ok(true)
    }
}
