//! UserPlaneFunction controller
//!
//! The controller runs one pass per event and never overlaps passes for the
//! same object. Deletion is finalizer driven: attachments and the external
//! service are removed before the finalizer is released.

mod pass;

pub use pass::{run_pass, Collaborators};

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::capability::{CapabilityChecker, KubeNodeCapacity, ProcCpuInfo};
use crate::config::UpfConfig;
use crate::crd::{UpfPhase, UserPlaneFunction, UserPlaneFunctionSpec, UserPlaneFunctionStatus};
use crate::network::{desired_attachments, AttachmentReconciler, KubeAttachmentRepository};
use crate::service::KubeExternalService;
use crate::settings::OperatorSettings;
use crate::workload::KubeExecGateway;
use crate::{Error, BESSD_CONTAINER_NAME, FIELD_MANAGER, PFCP_AGENT_CONTAINER_NAME};

/// Finalizer guarding teardown of attachments and the external service
pub const FINALIZER: &str = "sdcore.dev/upf-teardown";

/// Writes to the UserPlaneFunction object itself
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UpfKubeClient: Send + Sync {
    /// Replace the status subresource
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &UserPlaneFunctionStatus,
    ) -> Result<(), Error>;

    /// Add [`FINALIZER`] if missing
    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Remove [`FINALIZER`]
    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Production client over `Api<UserPlaneFunction>`
pub struct KubeUpfClient {
    client: Client,
}

impl KubeUpfClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<UserPlaneFunction> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        self.api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube("UserPlaneFunction", name, "patch_finalizers", e))?;
        Ok(())
    }
}

#[async_trait]
impl UpfKubeClient for KubeUpfClient {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &UserPlaneFunctionStatus,
    ) -> Result<(), Error> {
        let patch = status_patch(status);
        self.api(namespace)
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube("UserPlaneFunction", name, "patch_status", e))?;
        Ok(())
    }

    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let upf = self
            .api(namespace)
            .get(name)
            .await
            .map_err(|e| Error::from_kube("UserPlaneFunction", name, "get", e))?;
        let mut finalizers = upf.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        finalizers.push(FINALIZER.to_string());
        self.set_finalizers(namespace, name, finalizers).await
    }

    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let upf = self
            .api(namespace)
            .get(name)
            .await
            .map_err(|e| Error::from_kube("UserPlaneFunction", name, "get", e))?;
        let finalizers = upf
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != FINALIZER)
            .collect();
        self.set_finalizers(namespace, name, finalizers).await
    }
}

/// Merge patch body replacing the whole status; unset fields are sent as `null`
pub(crate) fn status_patch(status: &UserPlaneFunctionStatus) -> serde_json::Value {
    serde_json::json!({ "status": status })
}

/// Builds the collaborators of one instance
pub trait CollaboratorFactory: Send + Sync {
    /// Collaborators for instance `name` in `namespace`
    fn for_instance(&self, namespace: &str, name: &str) -> Collaborators;
}

/// Collaborators backed by the cluster API and pod exec
pub struct KubeCollaborators {
    client: Client,
    settings: OperatorSettings,
    capability: Arc<CapabilityChecker>,
}

impl KubeCollaborators {
    /// Create a factory sharing one client
    pub fn new(client: Client, settings: OperatorSettings) -> Self {
        let capability = Arc::new(CapabilityChecker::new(
            Arc::new(ProcCpuInfo),
            Arc::new(KubeNodeCapacity::new(client.clone())),
        ));
        Self {
            client,
            settings,
            capability,
        }
    }

    fn gateway(&self, namespace: &str, name: &str, container: &str) -> Arc<KubeExecGateway> {
        Arc::new(KubeExecGateway::new(
            self.client.clone(),
            namespace,
            format!("{}-0", name),
            container,
            self.settings.command_timeout,
        ))
    }
}

impl CollaboratorFactory for KubeCollaborators {
    fn for_instance(&self, namespace: &str, name: &str) -> Collaborators {
        Collaborators {
            attachments: Arc::new(KubeAttachmentRepository::new(self.client.clone(), namespace)),
            bessd: self.gateway(namespace, name, BESSD_CONTAINER_NAME),
            pfcp_agent: self.gateway(namespace, name, PFCP_AGENT_CONTAINER_NAME),
            service: Arc::new(KubeExternalService::new(self.client.clone(), namespace)),
            capability: self.capability.clone(),
        }
    }
}

/// Shared controller state
pub struct Context {
    /// Writes to the UserPlaneFunction object
    pub kube: Arc<dyn UpfKubeClient>,
    /// Per-instance collaborators
    pub collaborators: Arc<dyn CollaboratorFactory>,
    /// Timing and route settings
    pub settings: OperatorSettings,
}

impl Context {
    /// Production context
    pub fn new(client: Client, settings: OperatorSettings) -> Self {
        Self {
            kube: Arc::new(KubeUpfClient::new(client.clone())),
            collaborators: Arc::new(KubeCollaborators::new(client, settings.clone())),
            settings,
        }
    }
}

fn has_finalizer(upf: &UserPlaneFunction) -> bool {
    upf.finalizers().iter().any(|f| f == FINALIZER)
}

/// Reconcile a UserPlaneFunction
#[instrument(skip(upf, ctx), fields(upf = %upf.name_any()))]
pub async fn reconcile(upf: Arc<UserPlaneFunction>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = upf.name_any();
    let namespace = upf.namespace().unwrap_or_default();
    let collaborators = ctx.collaborators.for_instance(&namespace, &name);

    if upf.metadata.deletion_timestamp.is_some() {
        if has_finalizer(&upf) {
            teardown(&upf, &collaborators).await;
            ctx.kube.remove_finalizer(&namespace, &name).await?;
            info!("teardown complete, finalizer removed");
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(&upf) {
        ctx.kube.add_finalizer(&namespace, &name).await?;
        debug!("finalizer added");
    }

    let status = run_pass(&upf, &collaborators, &ctx.settings).await?;
    if upf.status.as_ref() != Some(&status) {
        info!(phase = %status.phase, message = ?status.message, "updating status");
        ctx.kube.patch_status(&namespace, &name, &status).await?;
    } else {
        debug!("status unchanged");
    }

    Ok(match status.phase {
        UpfPhase::Active => Action::requeue(ctx.settings.active_requeue),
        _ => Action::requeue(ctx.settings.waiting_requeue),
    })
}

/// Best-effort removal of everything the operator created for `upf`
async fn teardown(upf: &UserPlaneFunction, collaborators: &Collaborators) {
    let name = upf.name_any();
    let specs = match UpfConfig::from_spec(&upf.spec) {
        Ok(config) => desired_attachments(&config),
        Err(e) => {
            warn!(error = %e, "invalid configuration at teardown, using default attachment names");
            match UpfConfig::from_spec(&UserPlaneFunctionSpec::default()) {
                Ok(config) => desired_attachments(&config),
                Err(_) => Vec::new(),
            }
        }
    };
    AttachmentReconciler::new(collaborators.attachments.clone(), &name)
        .teardown(&specs)
        .await;
    if let Err(e) = collaborators.service.delete(&name).await {
        warn!(error = %e, "failed to delete external service");
    }
}

/// Error policy: log and requeue
pub fn error_policy(upf: Arc<UserPlaneFunction>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        upf = %upf.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    Action::requeue(ctx.settings.error_requeue)
}

/// Watch UserPlaneFunction objects in every namespace until shutdown
pub async fn run_controller(client: Client, settings: OperatorSettings) -> anyhow::Result<()> {
    let upfs: Api<UserPlaneFunction> = Api::all(client.clone());
    let ctx = Arc::new(Context::new(client, settings));

    info!("Starting UserPlaneFunction controller");
    Controller::new(upfs, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => debug!(?action, "reconciliation completed"),
                Err(e) => error!(error = ?e, "reconciliation error"),
            }
        })
        .await;
    info!("UserPlaneFunction controller shutting down");
    Ok(())
}
