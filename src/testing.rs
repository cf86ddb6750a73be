//! In-memory collaborators for multi-pass tests
//!
//! Mocks fit single interactions; these fakes keep state across passes and
//! count every write so idempotence can be asserted directly.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::capability::{CapabilityChecker, CpuInfoSource, NodeCapacitySource};
use crate::config::IpCidr;
use crate::crd::NetworkAttachmentDefinition;
use crate::network::{
    AttachmentRepository, ContainerView, NetworkAttachmentSpec, WorkloadDescriptor,
    WorkloadDescriptorPatch,
};
use crate::service::ExternalServiceClient;
use crate::workload::{ExecOutput, SupervisionDeclaration, WorkloadGateway, BOOTSTRAP_COMMAND};
use crate::{Error, BOOTSTRAP_MARKER_PATH};

// =============================================================================
// Attachments
// =============================================================================

#[derive(Default)]
struct AttachmentState {
    api_available: bool,
    attachments: BTreeMap<String, NetworkAttachmentDefinition>,
    workload_name: String,
    descriptor: WorkloadDescriptor,
    writes: usize,
}

/// Attachment objects and one StatefulSet held in memory
pub struct FakeAttachmentRepository {
    state: Mutex<AttachmentState>,
}

impl FakeAttachmentRepository {
    /// A cluster with Multus and the StatefulSet `name` running `containers`
    pub fn with_workload(name: &str, containers: &[&str]) -> Self {
        Self {
            state: Mutex::new(AttachmentState {
                api_available: true,
                workload_name: name.to_string(),
                descriptor: WorkloadDescriptor {
                    annotations: BTreeMap::new(),
                    containers: containers
                        .iter()
                        .map(|c| ContainerView {
                            name: c.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                },
                ..Default::default()
            }),
        }
    }

    /// Writes performed so far
    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    /// Seed an attachment without counting a write
    pub fn insert_attachment(&self, name: &str) {
        let nad = NetworkAttachmentDefinition::new(name, Default::default());
        self.state
            .lock()
            .unwrap()
            .attachments
            .insert(name.to_string(), nad);
    }

    /// Names of existing attachments
    pub fn attachment_names(&self) -> Vec<String> {
        self.state.lock().unwrap().attachments.keys().cloned().collect()
    }

    /// Current descriptor
    pub fn descriptor(&self) -> WorkloadDescriptor {
        self.state.lock().unwrap().descriptor.clone()
    }

    /// Toggle whether the attachment CRD is installed
    pub fn set_api_available(&self, available: bool) {
        self.state.lock().unwrap().api_available = available;
    }
}

#[async_trait]
impl AttachmentRepository for FakeAttachmentRepository {
    async fn attachment_api_available(&self) -> Result<bool, Error> {
        Ok(self.state.lock().unwrap().api_available)
    }

    async fn get(&self, name: &str) -> Result<NetworkAttachmentDefinition, Error> {
        self.state
            .lock()
            .unwrap()
            .attachments
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("NetworkAttachmentDefinition", name))
    }

    async fn create(&self, spec: &NetworkAttachmentSpec) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.attachments.insert(spec.name.clone(), spec.to_resource());
        state.writes += 1;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state
            .attachments
            .remove(name)
            .ok_or_else(|| Error::not_found("NetworkAttachmentDefinition", name))?;
        state.writes += 1;
        Ok(())
    }

    async fn get_workload_descriptor(&self, name: &str) -> Result<WorkloadDescriptor, Error> {
        let state = self.state.lock().unwrap();
        if state.workload_name != name {
            return Err(Error::not_found("StatefulSet", name));
        }
        Ok(state.descriptor.clone())
    }

    async fn patch_workload_descriptor(
        &self,
        name: &str,
        patch: &WorkloadDescriptorPatch,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.workload_name != name {
            return Err(Error::not_found("StatefulSet", name));
        }
        state.writes += 1;
        let descriptor = &mut state.descriptor;
        descriptor.annotations.extend(patch.annotations.clone());
        for change in &patch.containers {
            let Some(container) = descriptor
                .containers
                .iter_mut()
                .find(|c| c.name == change.name)
            else {
                continue;
            };
            if let Some(add) = &change.capabilities_add {
                container.capabilities_add = add.clone();
            }
            if let Some(privileged) = change.privileged {
                container.privileged = privileged;
            }
            container.requests.extend(change.resources.clone());
            container.limits.extend(change.resources.clone());
        }
        Ok(())
    }
}

// =============================================================================
// Workload container
// =============================================================================

#[derive(Default)]
struct ContainerState {
    reachable: bool,
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    routes: Vec<String>,
    firewall_rules: usize,
    plan: SupervisionDeclaration,
    running: BTreeSet<String>,
    restarts: Vec<String>,
    replacements: usize,
    commands: Vec<String>,
    fail_pulls: bool,
    writes: usize,
}

/// A container with a filesystem, routing table, firewall and supervisor
pub struct FakeWorkloadGateway {
    state: Mutex<ContainerState>,
}

impl Default for FakeWorkloadGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeWorkloadGateway {
    /// A reachable, empty container
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ContainerState {
                reachable: true,
                ..Default::default()
            }),
        }
    }

    /// Mark a directory as mounted
    pub fn add_dir(&self, path: &str) {
        self.state.lock().unwrap().dirs.insert(path.to_string());
    }

    /// Seed a file without counting a write
    pub fn put_file(&self, path: &str, content: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), content.to_vec());
    }

    /// Seed the supervisor plan without counting a write
    pub fn set_plan(&self, plan: SupervisionDeclaration) {
        self.state.lock().unwrap().plan = plan;
    }

    /// Make every pull fail as an unreadable file would
    pub fn fail_pulls(&self) {
        self.state.lock().unwrap().fail_pulls = true;
    }

    /// Toggle whether the supervisor answers
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unwrap().reachable = reachable;
    }

    /// Whether `path` holds a file
    pub fn has_file(&self, path: &str) -> bool {
        self.state.lock().unwrap().files.contains_key(path)
    }

    /// Content of a file
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    /// Routing table lines
    pub fn routes(&self) -> Vec<String> {
        self.state.lock().unwrap().routes.clone()
    }

    /// Number of firewall rules inserted
    pub fn firewall_rules(&self) -> usize {
        self.state.lock().unwrap().firewall_rules
    }

    /// Services restarted, in order
    pub fn restarts(&self) -> Vec<String> {
        self.state.lock().unwrap().restarts.clone()
    }

    /// Instance replacements requested
    pub fn replacements(&self) -> usize {
        self.state.lock().unwrap().replacements
    }

    /// Executed commands equal to `command`
    pub fn commands_matching(&self, command: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|c| c.as_str() == command)
            .count()
    }

    /// Current supervisor plan
    pub fn plan(&self) -> SupervisionDeclaration {
        self.state.lock().unwrap().plan.clone()
    }

    /// Writes performed so far
    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }
}

fn failed(command: &str) -> Error {
    Error::command_failed(command, Some(1), "")
}

/// Destination as `ip route show` prints it: host routes carry no prefix
fn kernel_destination(dst: &str) -> String {
    match dst.parse::<IpCidr>() {
        Ok(cidr) if cidr.prefix() == if cidr.address().is_ipv4() { 32 } else { 128 } => {
            cidr.address().to_string()
        }
        Ok(cidr) => cidr.network().to_string(),
        Err(_) => dst.to_string(),
    }
}

/// `-4` or `-6`, from the gateway of a stored route line
fn route_family(line: &str) -> Option<&'static str> {
    let gateway: IpAddr = line.split_whitespace().nth(2)?.parse().ok()?;
    Some(if gateway.is_ipv4() { "-4" } else { "-6" })
}

impl ContainerState {
    fn run(&mut self, command: &str) -> Result<ExecOutput, Error> {
        let tokens: Vec<&str> = command.split_whitespace().collect();
        match tokens.as_slice() {
            ["ip", family @ ("-4" | "-6"), "route", "show"] => Ok(ExecOutput {
                stdout: self
                    .routes
                    .iter()
                    .filter(|r| route_family(r) == Some(*family))
                    .map(|r| format!("{}\n", r))
                    .collect(),
                ..Default::default()
            }),
            ["ip", "route", "replace", dst, "via", gw, rest @ ..] => {
                let dst = kernel_destination(dst);
                let line = std::iter::once(format!("{} via {}", dst, gw))
                    .chain(rest.iter().map(|s| s.to_string()))
                    .collect::<Vec<_>>()
                    .join(" ");
                self.routes
                    .retain(|r| r.split_whitespace().next() != Some(dst.as_str()));
                self.routes.push(line);
                self.writes += 1;
                Ok(ExecOutput::default())
            }
            ["iptables-legacy", "--check", ..] if self.firewall_rules > 0 => Ok(ExecOutput::default()),
            ["iptables-legacy", "--check", ..] => Err(failed(command)),
            ["iptables-legacy", "-I", ..] => {
                self.firewall_rules += 1;
                self.writes += 1;
                Ok(ExecOutput::default())
            }
            _ if command == BOOTSTRAP_COMMAND => {
                self.writes += 1;
                Ok(ExecOutput::default())
            }
            _ => Ok(ExecOutput::default()),
        }
    }
}

#[async_trait]
impl WorkloadGateway for FakeWorkloadGateway {
    async fn can_connect(&self) -> bool {
        self.state.lock().unwrap().reachable
    }

    async fn exists(&self, path: &str) -> Result<bool, Error> {
        let state = self.state.lock().unwrap();
        Ok(state.files.contains_key(path) || state.dirs.contains(path))
    }

    async fn pull(&self, path: &str) -> Result<Vec<u8>, Error> {
        let state = self.state.lock().unwrap();
        if state.fail_pulls {
            return Err(failed(&format!("cat {}", path)));
        }
        state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| Error::not_found("File", path))
    }

    async fn push(&self, path: &str, content: &[u8]) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.files.insert(path.to_string(), content.to_vec());
        state.writes += 1;
        Ok(())
    }

    async fn exec(
        &self,
        command: &[String],
        _environment: &BTreeMap<String, String>,
        _timeout: Duration,
    ) -> Result<ExecOutput, Error> {
        let command = command.join(" ");
        let mut state = self.state.lock().unwrap();
        state.commands.push(command.clone());
        state.run(&command)
    }

    async fn get_supervision_declaration(&self) -> Result<SupervisionDeclaration, Error> {
        Ok(self.state.lock().unwrap().plan.clone())
    }

    async fn set_supervision_declaration(
        &self,
        _label: &str,
        declaration: &SupervisionDeclaration,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.plan.services.extend(declaration.services.clone());
        state.plan.checks.extend(declaration.checks.clone());
        state.writes += 1;
        Ok(())
    }

    async fn restart_service(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if !state.plan.services.contains_key(name) {
            return Err(failed(&format!("pebble restart {}", name)));
        }
        state.restarts.push(name.to_string());
        state.running.insert(name.to_string());
        state.writes += 1;
        Ok(())
    }

    async fn service_is_running(&self, name: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.reachable && state.running.contains(name)
    }

    async fn replace_instance(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.replacements += 1;
        state.running.clear();
        state.files.remove(BOOTSTRAP_MARKER_PATH);
        state.writes += 1;
        Ok(())
    }
}

// =============================================================================
// Service and capability
// =============================================================================

/// External services held in memory
#[derive(Default)]
pub struct FakeExternalService {
    services: Mutex<BTreeSet<String>>,
    writes: Mutex<usize>,
}

impl FakeExternalService {
    /// Writes performed so far
    pub fn writes(&self) -> usize {
        *self.writes.lock().unwrap()
    }

    /// Whether the service of `instance` exists
    pub fn exists(&self, instance: &str) -> bool {
        self.services.lock().unwrap().contains(instance)
    }
}

#[async_trait]
impl ExternalServiceClient for FakeExternalService {
    async fn ensure(&self, instance: &str) -> Result<(), Error> {
        if self.services.lock().unwrap().insert(instance.to_string()) {
            *self.writes.lock().unwrap() += 1;
        }
        Ok(())
    }

    async fn delete(&self, instance: &str) -> Result<(), Error> {
        if self.services.lock().unwrap().remove(instance) {
            *self.writes.lock().unwrap() += 1;
        }
        Ok(())
    }

    async fn hostname(&self, _instance: &str) -> Result<Option<String>, Error> {
        Ok(None)
    }
}

/// Fixed CPU flags
pub struct StaticCpuInfo(pub Vec<String>);

#[async_trait]
impl CpuInfoSource for StaticCpuInfo {
    async fn cpu_flags(&self) -> Result<Vec<String>, Error> {
        Ok(self.0.clone())
    }
}

/// Fixed node capacity
pub struct StaticNodeCapacity(pub Vec<Option<String>>);

#[async_trait]
impl NodeCapacitySource for StaticNodeCapacity {
    async fn hugepages_allocatable(&self) -> Result<Vec<Option<String>>, Error> {
        Ok(self.0.clone())
    }
}

/// A capability checker on a compatible CPU with one well-provisioned node
pub fn compatible_capability() -> Arc<CapabilityChecker> {
    Arc::new(CapabilityChecker::new(
        Arc::new(StaticCpuInfo(
            ["avx2", "rdrand", "pdpe1gb"].iter().map(|f| f.to_string()).collect(),
        )),
        Arc::new(StaticNodeCapacity(vec![Some("2Gi".to_string())])),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{run_pass, Collaborators};
    use crate::crd::{UpfPhase, UserPlaneFunction, UserPlaneFunctionSpec};
    use crate::settings::OperatorSettings;
    use crate::workload::{pfcp_agent_declaration, stored_hwcksum};
    use crate::{
        bessd_config_path, BESSD_CONFIG_DIR, BESSD_SERVICE_NAME, ROUTECTL_SERVICE_NAME,
    };
    use kube::api::ObjectMeta;

    struct Cluster {
        attachments: Arc<FakeAttachmentRepository>,
        bessd: Arc<FakeWorkloadGateway>,
        pfcp_agent: Arc<FakeWorkloadGateway>,
        service: Arc<FakeExternalService>,
    }

    impl Cluster {
        fn new() -> Self {
            let bessd = Arc::new(FakeWorkloadGateway::new());
            bessd.add_dir(BESSD_CONFIG_DIR);
            let pfcp_agent = Arc::new(FakeWorkloadGateway::new());
            Self {
                attachments: Arc::new(FakeAttachmentRepository::with_workload(
                    "upf",
                    &["bessd", "pfcp-agent"],
                )),
                bessd,
                pfcp_agent,
                service: Arc::new(FakeExternalService::default()),
            }
        }

        fn collaborators(&self) -> Collaborators {
            Collaborators {
                attachments: self.attachments.clone(),
                bessd: self.bessd.clone(),
                pfcp_agent: self.pfcp_agent.clone(),
                service: self.service.clone(),
                capability: compatible_capability(),
            }
        }

        fn writes(&self) -> usize {
            self.attachments.writes()
                + self.bessd.writes()
                + self.pfcp_agent.writes()
                + self.service.writes()
        }
    }

    fn upf(spec: UserPlaneFunctionSpec) -> UserPlaneFunction {
        let mut upf = UserPlaneFunction::new("upf", spec);
        upf.metadata = ObjectMeta {
            name: Some("upf".to_string()),
            namespace: Some("sdcore".to_string()),
            generation: Some(1),
            ..Default::default()
        };
        upf
    }

    fn normal_without_checksum() -> UserPlaneFunctionSpec {
        UserPlaneFunctionSpec {
            enable_hw_checksum: false,
            ..Default::default()
        }
    }

    // =========================================================================
    // End-to-end passes
    // =========================================================================

    /// Story: a fresh instance converges in one pass and the second pass writes nothing
    #[tokio::test]
    async fn story_fresh_instance_converges_then_idles() {
        let cluster = Cluster::new();
        let upf = upf(normal_without_checksum());
        let settings = OperatorSettings::default();

        let first = run_pass(&upf, &cluster.collaborators(), &settings)
            .await
            .unwrap();

        assert_eq!(first.phase, UpfPhase::Active);
        assert_eq!(first.n3_address.as_deref(), Some("192.168.252.3"));
        assert_eq!(
            first.n4_hostname.as_deref(),
            Some("upf-external.sdcore.svc.cluster.local")
        );
        let stored = cluster.bessd.file(&bessd_config_path()).unwrap();
        assert_eq!(stored_hwcksum(&stored), Some(false));
        assert_eq!(cluster.bessd.routes().len(), 2);
        assert_eq!(cluster.bessd.firewall_rules(), 1);
        assert_eq!(
            cluster.bessd.restarts(),
            vec![ROUTECTL_SERVICE_NAME.to_string(), BESSD_SERVICE_NAME.to_string()]
        );
        assert_eq!(cluster.bessd.commands_matching(BOOTSTRAP_COMMAND), 1);
        assert!(cluster.bessd.has_file(BOOTSTRAP_MARKER_PATH));
        assert!(pfcp_agent_declaration().matches(&cluster.pfcp_agent.plan()));
        assert_eq!(cluster.attachments.attachment_names(), vec!["access-net", "core-net"]);
        assert!(cluster.service.exists("upf"));

        let writes_after_first = cluster.writes();
        let second = run_pass(&upf, &cluster.collaborators(), &settings)
            .await
            .unwrap();

        assert_eq!(second, first);
        assert_eq!(cluster.writes(), writes_after_first, "second pass must not write");
        assert_eq!(cluster.bessd.commands_matching(BOOTSTRAP_COMMAND), 1);
    }

    /// Story: flipping checksum offload replaces the instance instead of restarting it
    #[tokio::test]
    async fn story_checksum_flip_replaces_instance() {
        let cluster = Cluster::new();
        let settings = OperatorSettings::default();
        run_pass(&upf(normal_without_checksum()), &cluster.collaborators(), &settings)
            .await
            .unwrap();
        let restarts_before = cluster.bessd.restarts().len();

        let status = run_pass(
            &upf(UserPlaneFunctionSpec::default()),
            &cluster.collaborators(),
            &settings,
        )
        .await
        .unwrap();

        assert_eq!(cluster.bessd.replacements(), 1);
        assert_eq!(cluster.bessd.restarts().len(), restarts_before);
        assert_eq!(status.phase, UpfPhase::Waiting);
        assert_eq!(
            status.message.as_deref(),
            Some("Waiting for bessd service to run")
        );
    }

    /// Story: without storage nothing is written inside the container beyond networking
    #[tokio::test]
    async fn story_missing_storage_waits() {
        let cluster = Cluster::new();
        let bessd = Arc::new(FakeWorkloadGateway::new());
        let collaborators = Collaborators {
            bessd: bessd.clone(),
            ..cluster.collaborators()
        };

        let status = run_pass(&upf(normal_without_checksum()), &collaborators, &OperatorSettings::default())
            .await
            .unwrap();

        assert_eq!(status.phase, UpfPhase::Waiting);
        assert_eq!(
            status.message.as_deref(),
            Some("Waiting for storage to be attached")
        );
        assert!(!bessd.has_file(&bessd_config_path()));
        assert!(bessd.restarts().is_empty());
    }

    #[tokio::test]
    async fn test_missing_multus_blocks_before_any_write() {
        let cluster = Cluster::new();
        cluster.attachments.set_api_available(false);

        let status = run_pass(
            &upf(normal_without_checksum()),
            &cluster.collaborators(),
            &OperatorSettings::default(),
        )
        .await
        .unwrap();

        assert_eq!(status.phase, UpfPhase::Blocked);
        assert_eq!(
            status.message.as_deref(),
            Some("Multus is not installed or enabled")
        );
        assert_eq!(cluster.writes(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_container_waits() {
        let cluster = Cluster::new();
        cluster.bessd.set_reachable(false);

        let status = run_pass(
            &upf(normal_without_checksum()),
            &cluster.collaborators(),
            &OperatorSettings::default(),
        )
        .await
        .unwrap();

        assert_eq!(
            status.message.as_deref(),
            Some("Waiting for bessd container to be ready")
        );
        assert_eq!(cluster.bessd.writes(), 0);
    }

    #[tokio::test]
    async fn test_dpdk_descriptor_is_patched() {
        let cluster = Cluster::new();
        let spec = UserPlaneFunctionSpec {
            upf_mode: "dpdk".to_string(),
            cni_type: "vfioveth".to_string(),
            access_interface_mac_address: Some("00:11:22:33:44:55".to_string()),
            core_interface_mac_address: Some("00:11:22:33:44:66".to_string()),
            ..Default::default()
        };

        run_pass(&upf(spec), &cluster.collaborators(), &OperatorSettings::default())
            .await
            .unwrap();

        let descriptor = cluster.attachments.descriptor();
        let bessd = descriptor.container("bessd").unwrap();
        assert!(bessd.privileged);
        assert_eq!(
            bessd.requests.get("intel.com/intel_sriov_vfio_access").map(String::as_str),
            Some("1")
        );
    }
}
