//! Configuration reconciler of the forwarder container
//!
//! A pass observes the stored document and the supervisor plan, computes a
//! [`ConfigPlan`] before touching anything, then applies it:
//! document, routes, firewall rule, declaration, and finally the single
//! [`Decision`] (nothing, restart, or replace the instance).

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::bootstrap::{BootstrapOutcome, BootstrapRunner};
use super::config_file::{self, ConfigInputs};
use super::declaration::{bessd_declaration, SupervisionDeclaration, BESSD_LAYER};
use super::gateway::{argv, WorkloadGateway};
use crate::config::{IpCidr, UpfConfig};
use crate::retry::RetryConfig;
use crate::settings::OperatorSettings;
use crate::{
    bessd_config_path, Result, ACCESS_INTERFACE_NAME, BESSD_SERVICE_NAME, CORE_INTERFACE_NAME,
    POD_SHARE_PATH, ROUTECTL_SERVICE_NAME,
};

const IPTABLES: &str = "iptables-legacy";
const ICMP_DROP_RULE: &str = "OUTPUT -p icmp --icmp-type port-unreachable -j DROP";

/// What the pass does to the running processes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Configuration already in effect
    NoAction,
    /// Restart route control, then the forwarder
    Restart,
    /// Delete the instance; required when `hwcksum` changes
    Replace,
}

/// Desired state of the forwarder container
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredWorkload {
    /// Inputs of the configuration document
    pub config: ConfigInputs,
    /// Next hop of the default route
    pub core_gateway: IpAddr,
    /// Next hop toward the gNodeBs
    pub access_gateway: IpAddr,
    /// gNodeB subnet
    pub gnb_subnet: IpCidr,
    /// Whether the forwarder runs on HugePages
    pub hugepages_enabled: bool,
}

impl DesiredWorkload {
    /// Derive the desired container state from validated configuration
    pub fn from_config(config: &UpfConfig, upf_hostname: impl Into<String>) -> Self {
        Self {
            config: ConfigInputs {
                upf_hostname: upf_hostname.into(),
                mode: config.upf_mode,
                access_interface_name: ACCESS_INTERFACE_NAME.to_string(),
                core_interface_name: CORE_INTERFACE_NAME.to_string(),
                core_ip_address: config.core.ip.address().to_string(),
                dnn: config.dnn.clone(),
                pod_share_path: POD_SHARE_PATH.to_string(),
                enable_hw_checksum: config.enable_hw_checksum,
            },
            core_gateway: config.core.gateway,
            access_gateway: config.access.gateway,
            gnb_subnet: config.gnb_subnet,
            hugepages_enabled: config.hugepages_enabled(),
        }
    }

    /// The declaration the forwarder container should run
    pub fn declaration(&self) -> SupervisionDeclaration {
        bessd_declaration(self.hugepages_enabled)
    }
}

/// Observed state relevant to the plan
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObservedWorkload {
    /// Stored document, `None` when absent or unreadable
    pub stored_config: Option<Vec<u8>>,
    /// Current supervisor plan
    pub declaration: SupervisionDeclaration,
}

/// Everything a pass will write, computed before any side effect
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigPlan {
    /// Document to store
    pub rendered: String,
    /// Whether the stored document must be written
    pub write_config: bool,
    /// Whether the supervisor declaration must be replaced
    pub replace_declaration: bool,
    /// Action on the running processes
    pub decision: Decision,
}

/// Compute the plan for a pass.
///
/// `hwcksum` is read from the document stored before this pass; a changed
/// value needs a new instance because offload state binds at process start.
/// A missing document is a first install, not a change.
pub fn plan(desired: &DesiredWorkload, rendered: String, observed: &ObservedWorkload) -> ConfigPlan {
    let write_config = observed
        .stored_config
        .as_deref()
        .map_or(true, |stored| stored != rendered.as_bytes());
    let checksum_changed = observed
        .stored_config
        .as_deref()
        .and_then(config_file::stored_hwcksum)
        .is_some_and(|stored| stored != desired.config.enable_hw_checksum);
    let replace_declaration = !desired.declaration().matches(&observed.declaration);

    let decision = if checksum_changed {
        Decision::Replace
    } else if write_config || replace_declaration {
        Decision::Restart
    } else {
        Decision::NoAction
    };

    ConfigPlan {
        rendered,
        write_config,
        replace_declaration,
        decision,
    }
}

/// Route facts read from `ip route show`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouteFacts {
    /// Default route via the core gateway exists
    pub default_route: bool,
    /// Route to the gNodeB subnet via the access gateway exists
    pub ran_route: bool,
}

/// Parse `ip route show` output.
///
/// Destinations are compared as networks: the kernel prints host routes
/// without a prefix length, which reads as a full-length prefix.
pub fn route_facts(routes: &str, desired: &DesiredWorkload) -> RouteFacts {
    let subnet = desired.gnb_subnet.network();
    let mut facts = RouteFacts::default();
    for line in routes.lines() {
        let Some((dst, via)) = parse_route(line) else {
            continue;
        };
        match dst {
            RouteDestination::Default => facts.default_route |= via == desired.core_gateway,
            RouteDestination::Prefix(cidr) => {
                facts.ran_route |= cidr.network() == subnet && via == desired.access_gateway
            }
        }
    }
    facts
}

enum RouteDestination {
    Default,
    Prefix(IpCidr),
}

/// `<dst> via <gateway> ...`; lines without a gateway are skipped
fn parse_route(line: &str) -> Option<(RouteDestination, IpAddr)> {
    let mut tokens = line.split_whitespace();
    let dst = match tokens.next()? {
        "default" => RouteDestination::Default,
        prefix => RouteDestination::Prefix(prefix.parse().ok()?),
    };
    if tokens.next()? != "via" {
        return None;
    }
    let via = tokens.next()?.parse().ok()?;
    Some((dst, via))
}

/// `ip route show` for each address family the routes use
fn route_show_commands(desired: &DesiredWorkload) -> Vec<&'static str> {
    let families = [desired.core_gateway.is_ipv4(), desired.gnb_subnet.address().is_ipv4()];
    let mut commands = Vec::new();
    if families.contains(&true) {
        commands.push("ip -4 route show");
    }
    if families.contains(&false) {
        commands.push("ip -6 route show");
    }
    commands
}

/// Result of a configuration pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfigReport {
    /// Action taken on the processes
    pub decision: Decision,
    /// Bootstrap result, `None` when the instance is being replaced
    pub bootstrap: Option<BootstrapOutcome>,
}

/// Converges the forwarder container toward [`DesiredWorkload`]
pub struct ConfigReconciler {
    gateway: Arc<dyn WorkloadGateway>,
    settings: OperatorSettings,
}

impl ConfigReconciler {
    /// Create a reconciler against the forwarder container
    pub fn new(gateway: Arc<dyn WorkloadGateway>, settings: OperatorSettings) -> Self {
        Self { gateway, settings }
    }

    /// Run one configuration pass, including the bootstrap step
    pub async fn reconcile(&self, desired: &DesiredWorkload) -> Result<ConfigReport> {
        let rendered = config_file::render(&desired.config)?;
        let observed = self.observe().await?;
        let plan = plan(desired, rendered, &observed);
        debug!(
            write_config = plan.write_config,
            replace_declaration = plan.replace_declaration,
            decision = ?plan.decision,
            "configuration plan"
        );

        if plan.write_config {
            self.gateway
                .push(&bessd_config_path(), plan.rendered.as_bytes())
                .await?;
            info!("Pushed {} config file", bessd_config_path());
        }
        self.ensure_routes(desired).await?;
        self.ensure_firewall_rule().await?;
        if plan.replace_declaration {
            self.gateway
                .set_supervision_declaration(BESSD_LAYER, &desired.declaration())
                .await?;
        }

        match plan.decision {
            Decision::Replace => {
                warn!("Recreating pod after changing hardware checksum offloading config");
                self.gateway.replace_instance().await?;
                return Ok(ConfigReport {
                    decision: plan.decision,
                    bootstrap: None,
                });
            }
            Decision::Restart => {
                self.gateway.restart_service(ROUTECTL_SERVICE_NAME).await?;
                self.gateway.restart_service(BESSD_SERVICE_NAME).await?;
            }
            Decision::NoAction => {}
        }

        let bootstrap = BootstrapRunner::new(
            self.gateway.clone(),
            RetryConfig::new(
                self.settings.bootstrap_retry_interval,
                self.settings.bootstrap_budget,
            ),
            self.settings.command_timeout,
        )
        .run()
        .await?;

        Ok(ConfigReport {
            decision: plan.decision,
            bootstrap: Some(bootstrap),
        })
    }

    async fn observe(&self) -> Result<ObservedWorkload> {
        let path = bessd_config_path();
        let stored_config = if self.gateway.exists(&path).await? {
            match self.gateway.pull(&path).await {
                Ok(content) => Some(content),
                Err(e) if e.is_not_found() || e.is_command_failure() => None,
                Err(e) => return Err(e),
            }
        } else {
            None
        };
        let declaration = self.gateway.get_supervision_declaration().await?;
        Ok(ObservedWorkload {
            stored_config,
            declaration,
        })
    }

    /// Read the routing tables of the container for the families `desired` uses
    pub async fn route_table(&self, desired: &DesiredWorkload) -> Result<String> {
        let mut table = String::new();
        for command in route_show_commands(desired) {
            let output = self
                .gateway
                .exec(&argv(command), &Default::default(), self.settings.command_timeout)
                .await?;
            table.push_str(&output.stdout);
        }
        Ok(table)
    }

    /// Ensure both routes exist; each `replace` runs only when the route is missing
    pub async fn ensure_routes(&self, desired: &DesiredWorkload) -> Result<()> {
        let facts = route_facts(&self.route_table(desired).await?, desired);
        if !facts.default_route {
            self.run(&format!(
                "ip route replace default via {} metric {}",
                desired.core_gateway, self.settings.route_metric
            ))
            .await?;
            info!("Default core network route created");
        }
        if !facts.ran_route {
            self.run(&format!(
                "ip route replace {} via {}",
                desired.gnb_subnet.network(),
                desired.access_gateway
            ))
            .await?;
            info!("Route to gnb-subnet created");
        }
        Ok(())
    }

    /// Ensure the ICMP port-unreachable drop rule exists
    pub async fn ensure_firewall_rule(&self) -> Result<()> {
        match self
            .run(&format!("{} --check {}", IPTABLES, ICMP_DROP_RULE))
            .await
        {
            Ok(()) => {
                debug!("iptables rule already present");
                Ok(())
            }
            Err(e) if e.is_command_failure() => {
                self.run(&format!("{} -I {}", IPTABLES, ICMP_DROP_RULE))
                    .await?;
                info!("Iptables rule for ICMP created");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn run(&self, command: &str) -> Result<()> {
        self.gateway
            .exec(&argv(command), &Default::default(), self.settings.command_timeout)
            .await?;
        Ok(())
    }
}
