//! Attachment reconciler
//!
//! Converges the attachment objects and the workload descriptor's pod
//! template toward the desired networks. Every write is preceded by a read
//! that shows a difference, so a second run with unchanged inputs is a no-op.
//! Attachment objects are never updated in place once they exist.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{
    annotation_value, AttachmentRepository, ContainerPatch, NetworkAnnotation,
    NetworkAttachmentSpec, WorkloadDescriptor, WorkloadDescriptorPatch, NETWORKS_ANNOTATION,
    NET_ADMIN_CAPABILITY,
};
use crate::{Error, Result};

/// Drives attachments and the descriptor annotation for one workload
pub struct AttachmentReconciler {
    repo: Arc<dyn AttachmentRepository>,
    workload_name: String,
}

impl AttachmentReconciler {
    /// Create a reconciler for the StatefulSet `workload_name`
    pub fn new(repo: Arc<dyn AttachmentRepository>, workload_name: impl Into<String>) -> Self {
        Self {
            repo,
            workload_name: workload_name.into(),
        }
    }

    /// Create missing attachments, then patch the descriptor if it differs.
    ///
    /// Any failure other than `NotFound` on lookup ends the pass.
    pub async fn reconcile(
        &self,
        specs: &[NetworkAttachmentSpec],
        annotations: &[NetworkAnnotation],
        net_admin_containers: &[&str],
    ) -> Result<()> {
        for spec in specs {
            match self.repo.get(&spec.name).await {
                Ok(_) => debug!(attachment = %spec.name, "attachment already exists"),
                Err(e) if e.is_not_found() => {
                    info!(attachment = %spec.name, "creating attachment");
                    self.repo.create(spec).await?;
                }
                Err(e) => return Err(e),
            }
        }

        if annotations.is_empty() {
            info!("no network annotations requested, leaving workload descriptor untouched");
            return Ok(());
        }

        let descriptor = self.repo.get_workload_descriptor(&self.workload_name).await?;
        match descriptor_patch(&descriptor, annotations, net_admin_containers)? {
            Some(patch) => {
                info!(workload = %self.workload_name, "patching network annotation and capabilities");
                self.repo
                    .patch_workload_descriptor(&self.workload_name, &patch)
                    .await
            }
            None => {
                debug!(workload = %self.workload_name, "workload descriptor already attached");
                Ok(())
            }
        }
    }

    /// Whether every attachment exists and the descriptor carries the annotation
    pub async fn is_ready(
        &self,
        specs: &[NetworkAttachmentSpec],
        annotations: &[NetworkAnnotation],
        net_admin_containers: &[&str],
    ) -> Result<bool> {
        for spec in specs {
            match self.repo.get(&spec.name).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        if annotations.is_empty() {
            return Ok(true);
        }
        let descriptor = self.repo.get_workload_descriptor(&self.workload_name).await?;
        Ok(descriptor_patch(&descriptor, annotations, net_admin_containers)?.is_none())
    }

    /// Best-effort deletion of the attachments.
    ///
    /// Missing objects are skipped and failures are logged; the names are
    /// stable so leftovers get reused on the next install.
    pub async fn teardown(&self, specs: &[NetworkAttachmentSpec]) {
        for spec in specs {
            match self.repo.get(&spec.name).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    debug!(attachment = %spec.name, "attachment already absent");
                    continue;
                }
                Err(e) => {
                    warn!(attachment = %spec.name, error = %e, "failed to look up attachment during teardown");
                    continue;
                }
            }
            match self.repo.delete(&spec.name).await {
                Ok(()) => info!(attachment = %spec.name, "attachment deleted"),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(attachment = %spec.name, error = %e, "failed to delete attachment during teardown")
                }
            }
        }
    }
}

/// Compute the patch that brings `descriptor` in line, or `None` if it already is.
///
/// The observed annotation is compared as parsed JSON so formatting
/// differences do not trigger a write.
pub(crate) fn descriptor_patch(
    descriptor: &WorkloadDescriptor,
    annotations: &[NetworkAnnotation],
    net_admin_containers: &[&str],
) -> Result<Option<WorkloadDescriptorPatch>> {
    let desired_value = annotation_value(annotations)?;
    let desired_json = serde_json::to_value(annotations)?;
    let annotation_matches = descriptor
        .annotations
        .get(NETWORKS_ANNOTATION)
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
        .is_some_and(|observed| observed == desired_json);

    let mut containers = Vec::new();
    for name in net_admin_containers {
        let view = descriptor.container(name).ok_or_else(|| {
            Error::internal_with_context(
                "network",
                format!("container {} not found in workload descriptor", name),
            )
        })?;
        if !view.capabilities_add.iter().any(|cap| cap == NET_ADMIN_CAPABILITY) {
            let mut add = view.capabilities_add.clone();
            add.push(NET_ADMIN_CAPABILITY.to_string());
            containers.push(ContainerPatch {
                name: name.to_string(),
                capabilities_add: Some(add),
                ..Default::default()
            });
        }
    }

    if annotation_matches && containers.is_empty() {
        return Ok(None);
    }

    Ok(Some(WorkloadDescriptorPatch {
        annotations: [(NETWORKS_ANNOTATION.to_string(), desired_value)].into(),
        containers,
    }))
}
