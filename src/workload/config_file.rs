//! The forwarder configuration document (`upf.json`)
//!
//! Rendering is a pure function of [`ConfigInputs`]. The stored document is
//! only ever compared byte-for-byte, except for `hwcksum`, which is read back
//! to decide whether the instance must be replaced.

use minijinja::{context, AutoEscape, Environment, UndefinedBehavior};
use serde::Deserialize;

use crate::config::UpfMode;
use crate::Result;

const TEMPLATE_NAME: &str = "upf.json.j2";
const TEMPLATE: &str = include_str!("../../templates/upf.json.j2");

/// Everything the rendered document depends on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigInputs {
    /// Cluster-internal hostname of the PFCP service
    pub upf_hostname: String,
    /// Forwarder mode
    pub mode: UpfMode,
    /// Access interface name inside the pod
    pub access_interface_name: String,
    /// Core interface name inside the pod
    pub core_interface_name: String,
    /// Core address without prefix, used for masquerading
    pub core_ip_address: String,
    /// Data network name
    pub dnn: String,
    /// Directory shared with the sidecar
    pub pod_share_path: String,
    /// Hardware checksum offload
    pub enable_hw_checksum: bool,
}

/// Render the configuration document
pub fn render(inputs: &ConfigInputs) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_auto_escape_callback(|_| AutoEscape::None);
    env.set_keep_trailing_newline(true);
    env.add_template(TEMPLATE_NAME, TEMPLATE)?;

    let rendered = env.get_template(TEMPLATE_NAME)?.render(context! {
        upf_hostname => inputs.upf_hostname,
        mode => inputs.mode.as_str(),
        access_interface_name => inputs.access_interface_name,
        core_interface_name => inputs.core_interface_name,
        core_ip_address => inputs.core_ip_address,
        dnn => inputs.dnn,
        pod_share_path => inputs.pod_share_path,
        hwcksum => if inputs.enable_hw_checksum { "true" } else { "false" },
    })?;
    Ok(rendered)
}

#[derive(Deserialize)]
struct StoredChecksum {
    hwcksum: Option<bool>,
}

/// Read `hwcksum` from a stored document.
///
/// Unparsable documents and a missing field both yield `None`.
pub fn stored_hwcksum(content: &[u8]) -> Option<bool> {
    serde_json::from_slice::<StoredChecksum>(content)
        .ok()
        .and_then(|doc| doc.hwcksum)
}
