//! Integration tests for spec validation
//!
//! These tests tell the story of a user editing a UserPlaneFunction: which
//! mistakes block reconciliation, and what message they read back in the
//! status when they get it wrong.

use upf_operator::config::{CniType, UpfConfig, UpfMode};
use upf_operator::crd::UserPlaneFunctionSpec;
use upf_operator::Error;

// =============================================================================
// Test Fixtures
// =============================================================================

fn macvlan_spec() -> UserPlaneFunctionSpec {
    UserPlaneFunctionSpec {
        cni_type: "macvlan".to_string(),
        access_interface: "enp3s0".to_string(),
        core_interface: "enp4s0".to_string(),
        access_interface_mtu_size: Some(9000),
        external_upf_hostname: Some("upf.example.com".to_string()),
        ..Default::default()
    }
}

// =============================================================================
// Accepted Specs
// =============================================================================

/// Story: an operator wiring the UPF onto host NICs with jumbo frames
#[test]
fn story_macvlan_on_host_interfaces() {
    let config = UpfConfig::from_spec(&macvlan_spec()).expect("spec is valid");

    assert_eq!(config.cni_type, CniType::Macvlan);
    assert_eq!(config.upf_mode, UpfMode::AfPacket);
    assert_eq!(config.access.host_interface.as_deref(), Some("enp3s0"));
    assert_eq!(config.access.mtu, Some(9000));
    assert_eq!(config.core.mtu, None);
    assert_eq!(config.external_upf_hostname.as_deref(), Some("upf.example.com"));
}

/// Story: blank optional strings count as unset
#[test]
fn story_blank_optional_fields_are_ignored() {
    let spec = UserPlaneFunctionSpec {
        access_interface: "  ".to_string(),
        access_interface_mac_address: Some(String::new()),
        external_upf_hostname: Some(" ".to_string()),
        ..Default::default()
    };
    let config = UpfConfig::from_spec(&spec).expect("spec is valid");

    assert!(config.access.host_interface.is_none());
    assert!(config.access.mac.is_none());
    assert!(config.external_upf_hostname.is_none());
}

// =============================================================================
// Rejected Specs
// =============================================================================

/// Story: switching to DPDK without MAC addresses is rejected with a readable message
#[test]
fn story_dpdk_without_macs_is_blocked() {
    let spec = UserPlaneFunctionSpec {
        upf_mode: "dpdk".to_string(),
        ..Default::default()
    };
    let err = UpfConfig::from_spec(&spec).unwrap_err();

    assert!(!err.is_retryable());
    assert_eq!(
        err.to_string(),
        "The following configurations are not valid: ['accessInterfaceMacAddress', 'coreInterfaceMacAddress']"
    );
}

/// Story: a typo in the gateway and an unknown mode are both reported
#[test]
fn story_every_bad_field_is_listed() {
    let spec = UserPlaneFunctionSpec {
        upf_mode: "kernel".to_string(),
        core_gateway_ip: "192.168.250".to_string(),
        ..Default::default()
    };

    match UpfConfig::from_spec(&spec) {
        Err(Error::ConfigInvalid { fields }) => {
            assert_eq!(fields, vec!["coreGatewayIp", "upfMode"]);
        }
        other => panic!("expected ConfigInvalid, got {:?}", other),
    }
}
