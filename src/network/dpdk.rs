//! DPDK requirements on the workload descriptor
//!
//! In DPDK mode the forwarder container binds SR-IOV virtual functions, so it
//! must run privileged and request one VF from each device plugin pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::{AttachmentRepository, ContainerPatch, ContainerView, WorkloadDescriptorPatch};
use crate::{Error, Result};

/// Device plugin resource backing the access interface
pub const DPDK_ACCESS_RESOURCE: &str = "intel.com/intel_sriov_vfio_access";

/// Device plugin resource backing the core interface
pub const DPDK_CORE_RESOURCE: &str = "intel.com/intel_sriov_vfio_core";

const VF_COUNT: &str = "1";

/// Checks and applies the DPDK container settings on the StatefulSet
pub struct DpdkDescriptor {
    repo: Arc<dyn AttachmentRepository>,
    workload_name: String,
}

impl DpdkDescriptor {
    /// Create a checker for the StatefulSet `workload_name`
    pub fn new(repo: Arc<dyn AttachmentRepository>, workload_name: impl Into<String>) -> Self {
        Self {
            repo,
            workload_name: workload_name.into(),
        }
    }

    /// Patch `container` for DPDK unless it is already configured
    pub async fn ensure(&self, container: &str) -> Result<()> {
        let descriptor = self.repo.get_workload_descriptor(&self.workload_name).await?;
        let view = descriptor.container(container).ok_or_else(|| {
            Error::internal_with_context(
                "dpdk",
                format!(
                    "container {} not found in StatefulSet {}",
                    container, self.workload_name
                ),
            )
        })?;

        match dpdk_patch(view) {
            None => {
                debug!(container = %container, "container already configured for DPDK");
                Ok(())
            }
            Some(patch) => {
                self.repo
                    .patch_workload_descriptor(
                        &self.workload_name,
                        &WorkloadDescriptorPatch {
                            annotations: BTreeMap::new(),
                            containers: vec![patch],
                        },
                    )
                    .await?;
                info!(container = %container, "container configured for DPDK");
                Ok(())
            }
        }
    }
}

fn required_resources() -> BTreeMap<String, String> {
    [DPDK_ACCESS_RESOURCE, DPDK_CORE_RESOURCE]
        .into_iter()
        .map(|r| (r.to_string(), VF_COUNT.to_string()))
        .collect()
}

/// The container patch needed for DPDK, or `None` when nothing is missing
pub(crate) fn dpdk_patch(view: &ContainerView) -> Option<ContainerPatch> {
    let resources = required_resources();
    let applied = |current: &BTreeMap<String, String>| {
        resources
            .iter()
            .all(|(name, count)| current.get(name) == Some(count))
    };

    if view.privileged && applied(&view.requests) && applied(&view.limits) {
        return None;
    }
    Some(ContainerPatch {
        name: view.name.clone(),
        capabilities_add: None,
        privileged: Some(true),
        resources,
    })
}
