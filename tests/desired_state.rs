//! Integration tests for desired-state derivation
//!
//! These tests tell the story of what the operator wants a user plane to look
//! like for a given spec, before it talks to any cluster: which attachments
//! it creates, what document the forwarder reads, and when a running
//! instance has to be restarted or replaced.

use upf_operator::config::UpfConfig;
use upf_operator::crd::UserPlaneFunctionSpec;
use upf_operator::network::{annotation_value, desired_annotations, desired_attachments};
use upf_operator::workload::{plan, render, Decision, DesiredWorkload, ObservedWorkload};

// =============================================================================
// Test Fixtures
// =============================================================================

const UPF_HOSTNAME: &str = "upf-external.sdcore.svc.cluster.local";

fn config(spec: UserPlaneFunctionSpec) -> UpfConfig {
    UpfConfig::from_spec(&spec).expect("spec is valid")
}

fn dpdk_spec() -> UserPlaneFunctionSpec {
    UserPlaneFunctionSpec {
        upf_mode: "dpdk".to_string(),
        access_interface_mac_address: Some("00:11:22:33:44:aa".to_string()),
        core_interface_mac_address: Some("00:11:22:33:44:bb".to_string()),
        ..Default::default()
    }
}

/// Observed state of an instance that already converged on `desired`
fn converged(desired: &DesiredWorkload) -> ObservedWorkload {
    ObservedWorkload {
        stored_config: Some(render(&desired.config).expect("renders").into_bytes()),
        declaration: desired.declaration(),
    }
}

// =============================================================================
// Attachment Stories
// =============================================================================

/// Story: a kernel-mode instance gets two bridge attachments with static addresses
#[test]
fn story_af_packet_attachments() {
    let config = config(UserPlaneFunctionSpec::default());
    let attachments = desired_attachments(&config);

    let names: Vec<_> = attachments.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["access-net", "core-net"]);

    let access = attachments[0].cni_config();
    assert_eq!(access["type"], "bridge");
    assert_eq!(access["bridge"], "access-br");
    assert_eq!(access["ipam"]["addresses"][0]["address"], "192.168.252.3/24");

    let annotation = annotation_value(&desired_annotations(&config)).expect("serializes");
    assert_eq!(
        annotation,
        r#"[{"name":"access-net","interface":"access"},{"name":"core-net","interface":"core"}]"#
    );
}

/// Story: DPDK moves addressing into the pod annotation and asks for VF resources
#[test]
fn story_dpdk_attachments() {
    let config = config(dpdk_spec());

    for attachment in desired_attachments(&config) {
        assert!(attachment.resource_name.is_some(), "{}", attachment.name);
        assert!(attachment.cni_config()["ipam"].get("addresses").is_none());
    }

    let annotations = desired_annotations(&config);
    assert_eq!(annotations[0].mac.as_deref(), Some("00:11:22:33:44:aa"));
    assert_eq!(
        annotations[1].ips.as_deref(),
        Some(&["192.168.250.3/24".to_string()][..])
    );
}

// =============================================================================
// Configuration Stories
// =============================================================================

/// Story: the rendered document carries the data network and the masquerade address
#[test]
fn story_rendered_document() {
    let desired = DesiredWorkload::from_config(&config(UserPlaneFunctionSpec::default()), UPF_HOSTNAME);
    let rendered = render(&desired.config).expect("renders");
    let doc: serde_json::Value = serde_json::from_str(&rendered).expect("valid JSON");

    assert_eq!(doc["cpiface"]["dnn"], "internet");
    assert_eq!(doc["cpiface"]["hostname"], UPF_HOSTNAME);
    assert_eq!(doc["core"]["ip_masquerade"], "192.168.250.3");
    assert_eq!(doc["mode"], "af_packet");
    assert_eq!(doc["hwcksum"], true);
}

/// Story: a first install writes everything and restarts
#[test]
fn story_first_install_restarts() {
    let desired = DesiredWorkload::from_config(&config(UserPlaneFunctionSpec::default()), UPF_HOSTNAME);
    let rendered = render(&desired.config).expect("renders");
    let plan = plan(&desired, rendered, &ObservedWorkload::default());

    assert!(plan.write_config);
    assert!(plan.replace_declaration);
    assert_eq!(plan.decision, Decision::Restart);
}

/// Story: re-running on a converged instance changes nothing
#[test]
fn story_converged_instance_is_left_alone() {
    let desired = DesiredWorkload::from_config(&config(dpdk_spec()), UPF_HOSTNAME);
    let observed = converged(&desired);
    let rendered = render(&desired.config).expect("renders");
    let plan = plan(&desired, rendered, &observed);

    assert!(!plan.write_config);
    assert!(!plan.replace_declaration);
    assert_eq!(plan.decision, Decision::NoAction);
}

/// Story: turning checksum offload off needs a fresh instance
#[test]
fn story_checksum_change_replaces_instance() {
    let before = DesiredWorkload::from_config(&config(UserPlaneFunctionSpec::default()), UPF_HOSTNAME);
    let observed = converged(&before);

    let after = DesiredWorkload::from_config(
        &config(UserPlaneFunctionSpec {
            enable_hw_checksum: false,
            ..Default::default()
        }),
        UPF_HOSTNAME,
    );
    let rendered = render(&after.config).expect("renders");
    let plan = plan(&after, rendered, &observed);

    assert!(plan.write_config);
    assert_eq!(plan.decision, Decision::Replace);
}

/// Story: a new data network name only needs a restart
#[test]
fn story_dnn_change_restarts() {
    let before = DesiredWorkload::from_config(&config(UserPlaneFunctionSpec::default()), UPF_HOSTNAME);
    let observed = converged(&before);

    let after = DesiredWorkload::from_config(
        &config(UserPlaneFunctionSpec {
            dnn: "enterprise".to_string(),
            ..Default::default()
        }),
        UPF_HOSTNAME,
    );
    let rendered = render(&after.config).expect("renders");
    assert_eq!(plan(&after, rendered, &observed).decision, Decision::Restart);
}
