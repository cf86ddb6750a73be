//! Custom Resource Definitions for the UPF operator
//!
//! `UserPlaneFunction` is owned by this operator; `NetworkAttachmentDefinition`
//! belongs to Multus and is only created and read here.

mod network_attachment;
mod upf;

pub use network_attachment::{
    NetworkAttachmentDefinition, NetworkAttachmentDefinitionSpec, NETWORK_ATTACHMENT_CRD_NAME,
    RESOURCE_NAME_ANNOTATION,
};
pub use upf::{UpfPhase, UserPlaneFunction, UserPlaneFunctionSpec, UserPlaneFunctionStatus};
