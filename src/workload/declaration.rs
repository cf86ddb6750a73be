//! Process supervision declarations
//!
//! A declaration is the Pebble layer a container's supervisor runs: named
//! services plus health checks. Observed and desired declarations are
//! compared on services and checks only; summaries are not part of the plan
//! Pebble reports back.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    bessd_config_path, pfcp_agent_config_path, ACCESS_INTERFACE_NAME, BESSD_PORT,
    BESSD_SERVICE_NAME, CORE_INTERFACE_NAME, PFCP_AGENT_SERVICE_NAME, ROUTECTL_SERVICE_NAME,
};

/// Layer label of the forwarder container declaration
pub const BESSD_LAYER: &str = "bessd";

/// Layer label of the sidecar declaration
pub const PFCP_AGENT_LAYER: &str = "pfcp";

/// Name of the forwarder readiness check
pub const ONLINE_CHECK: &str = "online";

const OVERRIDE_REPLACE: &str = "replace";
const STARTUP_ENABLED: &str = "enabled";

/// One supervised service
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDeclaration {
    /// How the layer combines with earlier ones
    #[serde(rename = "override", default)]
    pub override_: String,
    /// `enabled` starts the service with the supervisor
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub startup: String,
    /// Command line
    #[serde(default)]
    pub command: String,
    /// Environment of the process
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
}

/// TCP probe target
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpCheck {
    /// Port that must accept connections
    pub port: u16,
}

/// One health check
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckDeclaration {
    /// How the layer combines with earlier ones
    #[serde(rename = "override", default)]
    pub override_: String,
    /// `alive` or `ready`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    /// TCP probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpCheck>,
}

/// A Pebble layer or plan
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisionDeclaration {
    /// Short description, layers only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Long description, layers only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Services by name
    #[serde(default)]
    pub services: BTreeMap<String, ServiceDeclaration>,
    /// Checks by name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub checks: BTreeMap<String, CheckDeclaration>,
}

impl SupervisionDeclaration {
    /// Whether `observed` runs exactly these services and checks
    pub fn matches(&self, observed: &SupervisionDeclaration) -> bool {
        self.services == observed.services && self.checks == observed.checks
    }

    /// Parse supervisor YAML output; an empty document is an empty plan
    pub fn from_yaml(yaml: &str) -> crate::Result<Self> {
        if yaml.trim().is_empty() || yaml.trim() == "{}" {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Serialize as a layer file
    pub fn to_yaml(&self) -> crate::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

fn service(command: String, environment: BTreeMap<String, String>) -> ServiceDeclaration {
    ServiceDeclaration {
        override_: OVERRIDE_REPLACE.to_string(),
        startup: STARTUP_ENABLED.to_string(),
        command,
        environment,
    }
}

/// Environment of the forwarder and of its bootstrap command
pub fn bessd_environment() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("CONF_FILE".to_string(), bessd_config_path()),
        ("PYTHONPATH".to_string(), "/opt/bess".to_string()),
    ])
}

fn routectl_environment() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("PYTHONPATH".to_string(), "/opt/bess".to_string()),
        ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
    ])
}

/// Forwarder start command; `-m 0` disables HugePages
pub fn bessd_command(hugepages_enabled: bool) -> String {
    let mut command = format!("/bin/bessd -f -grpc-url=0.0.0.0:{}", BESSD_PORT);
    if !hugepages_enabled {
        command.push_str(" -m 0");
    }
    command
}

/// Desired declaration of the forwarder container: route control and bessd
pub fn bessd_declaration(hugepages_enabled: bool) -> SupervisionDeclaration {
    SupervisionDeclaration {
        summary: Some("bessd layer".to_string()),
        description: Some("pebble config layer for bessd".to_string()),
        services: BTreeMap::from([
            (
                ROUTECTL_SERVICE_NAME.to_string(),
                service(
                    format!(
                        "/opt/bess/bessctl/conf/route_control.py -i {} {}",
                        ACCESS_INTERFACE_NAME, CORE_INTERFACE_NAME
                    ),
                    routectl_environment(),
                ),
            ),
            (
                BESSD_SERVICE_NAME.to_string(),
                service(bessd_command(hugepages_enabled), bessd_environment()),
            ),
        ]),
        checks: BTreeMap::from([(
            ONLINE_CHECK.to_string(),
            CheckDeclaration {
                override_: OVERRIDE_REPLACE.to_string(),
                level: Some("ready".to_string()),
                tcp: Some(TcpCheck { port: BESSD_PORT }),
            },
        )]),
    }
}

/// Desired declaration of the sidecar container
pub fn pfcp_agent_declaration() -> SupervisionDeclaration {
    SupervisionDeclaration {
        summary: Some("pfcp agent layer".to_string()),
        description: Some("pebble config layer for pfcp agent".to_string()),
        services: BTreeMap::from([(
            PFCP_AGENT_SERVICE_NAME.to_string(),
            service(
                format!("pfcpiface -config {}", pfcp_agent_config_path()),
                BTreeMap::new(),
            ),
        )]),
        checks: BTreeMap::new(),
    }
}
