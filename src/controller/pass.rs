//! One reconciliation pass over a UserPlaneFunction
//!
//! Steps run in dependency order and stop at the first unmet fact. The facts
//! gathered so far are folded into the verdict, so the reported reason is
//! the first thing still missing.

use std::sync::Arc;

use kube::ResourceExt;
use tracing::{debug, info};

use crate::capability::{CapabilityChecker, CapabilityGate};
use crate::config::{UpfConfig, UpfMode};
use crate::crd::{UserPlaneFunction, UserPlaneFunctionStatus};
use crate::network::{
    desired_annotations, desired_attachments, AttachmentReconciler, AttachmentRepository,
    DpdkDescriptor,
};
use crate::service::{internal_hostname, n4_hostname, ExternalServiceClient};
use crate::settings::OperatorSettings;
use crate::status::{evaluate, ReadinessFacts, Verdict};
use crate::workload::{
    route_facts, ConfigReconciler, Decision, DesiredWorkload, SidecarReconciler, WorkloadGateway,
};
use crate::{
    Error, Result, BESSD_CONFIG_DIR, BESSD_CONTAINER_NAME, BESSD_SERVICE_NAME,
    PFCP_AGENT_SERVICE_NAME, ROUTECTL_SERVICE_NAME,
};

/// Collaborators of one instance
#[derive(Clone)]
pub struct Collaborators {
    /// Attachment objects and the StatefulSet
    pub attachments: Arc<dyn AttachmentRepository>,
    /// Forwarder container
    pub bessd: Arc<dyn WorkloadGateway>,
    /// Sidecar container
    pub pfcp_agent: Arc<dyn WorkloadGateway>,
    /// External PFCP service
    pub service: Arc<dyn ExternalServiceClient>,
    /// CPU and HugePages gate
    pub capability: Arc<CapabilityChecker>,
}

/// Run one pass and return the status it computed
pub async fn run_pass(
    upf: &UserPlaneFunction,
    collaborators: &Collaborators,
    settings: &OperatorSettings,
) -> Result<UserPlaneFunctionStatus> {
    let name = upf.name_any();
    let namespace = upf.namespace().unwrap_or_default();
    let generation = upf.metadata.generation;

    let config = match UpfConfig::from_spec(&upf.spec) {
        Ok(config) => config,
        Err(e @ Error::ConfigInvalid { .. }) => {
            info!(error = %e, "configuration is not valid");
            return Ok(Verdict::blocked(e.to_string())
                .into_status()
                .observed_generation(generation));
        }
        Err(e) => return Err(e),
    };

    let mut pass = Pass {
        name: &name,
        namespace: &namespace,
        config: &config,
        collaborators,
        settings,
        facts: ReadinessFacts::default(),
        n4_hostname: None,
    };
    pass.run().await?;

    let mut status = evaluate(&pass.facts)
        .into_status()
        .observed_generation(generation);
    if let Some(n4) = pass.n4_hostname {
        status = status.endpoints(config.n3_address().to_string(), n4);
    }
    Ok(status)
}

struct Pass<'a> {
    name: &'a str,
    namespace: &'a str,
    config: &'a UpfConfig,
    collaborators: &'a Collaborators,
    settings: &'a OperatorSettings,
    facts: ReadinessFacts,
    n4_hostname: Option<String>,
}

impl Pass<'_> {
    async fn run(&mut self) -> Result<()> {
        let c = self.collaborators;

        self.facts.capability = c
            .capability
            .check(self.config.hugepages_enabled())
            .await?;
        if self.facts.capability != CapabilityGate::Met {
            return Ok(());
        }

        self.facts.multus_available = c.attachments.attachment_api_available().await?;
        if !self.facts.multus_available {
            return Ok(());
        }

        c.service.ensure(self.name).await?;
        let lb_hostname = c.service.hostname(self.name).await?;
        self.n4_hostname = Some(n4_hostname(
            self.config.external_upf_hostname.as_deref(),
            lb_hostname.as_deref(),
            self.name,
            self.namespace,
        ));

        let specs = desired_attachments(self.config);
        let annotations = desired_annotations(self.config);
        let net_admin = [BESSD_CONTAINER_NAME];
        let attachments = AttachmentReconciler::new(c.attachments.clone(), self.name);
        attachments.reconcile(&specs, &annotations, &net_admin).await?;
        if self.config.upf_mode == UpfMode::Dpdk {
            DpdkDescriptor::new(c.attachments.clone(), self.name)
                .ensure(BESSD_CONTAINER_NAME)
                .await?;
        }

        self.facts.bessd_container_ready = c.bessd.can_connect().await;
        if !self.facts.bessd_container_ready {
            return Ok(());
        }
        self.facts.multus_ready = attachments.is_ready(&specs, &annotations, &net_admin).await?;
        if !self.facts.multus_ready {
            return Ok(());
        }

        let desired = DesiredWorkload::from_config(
            self.config,
            internal_hostname(self.name, self.namespace),
        );
        let reconciler = ConfigReconciler::new(c.bessd.clone(), self.settings.clone());
        reconciler.ensure_routes(&desired).await?;
        let routes = route_facts(&reconciler.route_table(&desired).await?, &desired);
        self.facts.default_route = routes.default_route;
        self.facts.ran_route = routes.ran_route;
        if !routes.default_route || !routes.ran_route {
            return Ok(());
        }

        self.facts.storage_attached = c.bessd.exists(BESSD_CONFIG_DIR).await?;
        if !self.facts.storage_attached {
            return Ok(());
        }

        let report = reconciler.reconcile(&desired).await?;
        if report.decision == Decision::Replace {
            info!("instance is being replaced, skipping liveness checks");
            return Ok(());
        }

        self.facts.bessd_running = c.bessd.service_is_running(BESSD_SERVICE_NAME).await;
        if !self.facts.bessd_running {
            return Ok(());
        }
        if c.pfcp_agent.can_connect().await {
            SidecarReconciler::new(c.pfcp_agent.clone()).reconcile().await?;
        } else {
            debug!("pfcp agent container not reachable yet");
        }

        self.facts.routectl_running = c.bessd.service_is_running(ROUTECTL_SERVICE_NAME).await;
        if !self.facts.routectl_running {
            return Ok(());
        }
        self.facts.pfcp_agent_running = c
            .pfcp_agent
            .service_is_running(PFCP_AGENT_SERVICE_NAME)
            .await;
        Ok(())
    }
}
