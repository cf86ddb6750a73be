//! CPU and HugePages capability gate
//!
//! The forwarder needs AVX2 and RDRAND. DPDK mode also needs 1Gi page
//! support on the CPU and at least 2Gi of `hugepages-1Gi` allocatable on
//! every node. An unmet gate blocks the instance; it is never retried
//! within a pass.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::{debug, error};

#[cfg(test)]
use mockall::automock;

use crate::settings::REQUIRED_HUGEPAGES_BYTES;
use crate::{Error, Result};

/// CPU flags required in every mode
pub const REQUIRED_CPU_FLAGS: &[&str] = &["avx2", "rdrand"];

/// Additional CPU flags required when HugePages are used
pub const REQUIRED_HUGEPAGES_CPU_FLAGS: &[&str] = &["pdpe1gb"];

/// Allocatable resource holding 1Gi pages
pub const HUGEPAGES_RESOURCE: &str = "hugepages-1Gi";

/// Status message for a CPU lacking required flags
pub const CPU_INCOMPATIBLE_MESSAGE: &str = "CPU is not compatible, see logs for more details";

/// Status message for nodes lacking HugePages
pub const HUGEPAGES_UNAVAILABLE_MESSAGE: &str = "Not enough HugePages available";

const CPUINFO_PATH: &str = "/proc/cpuinfo";

/// Outcome of the capability gate
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CapabilityGate {
    /// Every requirement holds
    Met,
    /// A requirement does not hold; the reason is user facing
    Unmet(String),
}

/// Source of the CPU flag list
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CpuInfoSource: Send + Sync {
    /// Flags the CPU advertises
    async fn cpu_flags(&self) -> Result<Vec<String>>;
}

/// Source of per-node allocatable HugePages
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeCapacitySource: Send + Sync {
    /// `hugepages-1Gi` allocatable of each node; `None` when a node has none
    async fn hugepages_allocatable(&self) -> Result<Vec<Option<String>>>;
}

/// Reads `/proc/cpuinfo` of the host the operator runs on
#[derive(Clone, Debug, Default)]
pub struct ProcCpuInfo;

#[async_trait]
impl CpuInfoSource for ProcCpuInfo {
    async fn cpu_flags(&self) -> Result<Vec<String>> {
        let content = tokio::fs::read_to_string(CPUINFO_PATH)
            .await
            .map_err(|e| Error::unavailable_with_context("cpuinfo", e.to_string()))?;
        Ok(parse_cpu_flags(&content))
    }
}

/// Lists cluster nodes through the API
pub struct KubeNodeCapacity {
    nodes: Api<Node>,
}

impl KubeNodeCapacity {
    /// Create a source over all cluster nodes
    pub fn new(client: Client) -> Self {
        Self {
            nodes: Api::all(client),
        }
    }
}

#[async_trait]
impl NodeCapacitySource for KubeNodeCapacity {
    async fn hugepages_allocatable(&self) -> Result<Vec<Option<String>>> {
        let nodes = self
            .nodes
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::from_kube("Node", "*", "list", e))?;
        Ok(nodes
            .items
            .iter()
            .map(|node| {
                node.status
                    .as_ref()
                    .and_then(|s| s.allocatable.as_ref())
                    .and_then(|a| a.get(HUGEPAGES_RESOURCE))
                    .map(|q| q.0.clone())
            })
            .collect())
    }
}

/// Flags of the first `flags` line of cpuinfo
pub fn parse_cpu_flags(cpuinfo: &str) -> Vec<String> {
    cpuinfo
        .lines()
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim() == "flags").then(|| value.split_whitespace().map(str::to_string).collect())
        })
        .unwrap_or_default()
}

/// Parse a Kubernetes quantity into bytes.
///
/// Binary (`Ki`..`Ei`) and decimal (`k`..`E`) suffixes are supported;
/// fractional values are not.
pub fn quantity_bytes(quantity: &str) -> Option<u128> {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(quantity.len());
    let (digits, suffix) = quantity.split_at(split);
    let value: u128 = digits.parse().ok()?;
    let multiplier: u128 = match suffix {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

/// Whether every node exposes the required HugePages; an empty list fails
pub fn hugepages_available(allocatable: &[Option<String>]) -> bool {
    !allocatable.is_empty()
        && allocatable.iter().all(|q| {
            q.as_deref()
                .and_then(quantity_bytes)
                .is_some_and(|bytes| bytes >= REQUIRED_HUGEPAGES_BYTES as u128)
        })
}

/// Flags from `required` the CPU lacks
pub fn missing_flags<'a>(flags: &[String], required: &[&'a str]) -> Vec<&'a str> {
    required
        .iter()
        .copied()
        .filter(|req| !flags.iter().any(|f| f == req))
        .collect()
}

/// Evaluates the capability gate
pub struct CapabilityChecker {
    cpu: Arc<dyn CpuInfoSource>,
    nodes: Arc<dyn NodeCapacitySource>,
}

impl CapabilityChecker {
    /// Create a checker over the given sources
    pub fn new(cpu: Arc<dyn CpuInfoSource>, nodes: Arc<dyn NodeCapacitySource>) -> Self {
        Self { cpu, nodes }
    }

    /// Check the gate. Node capacity is only read when HugePages are in use.
    pub async fn check(&self, hugepages_enabled: bool) -> Result<CapabilityGate> {
        let flags = self.cpu.cpu_flags().await?;
        let mut required = REQUIRED_CPU_FLAGS.to_vec();
        if hugepages_enabled {
            required.extend_from_slice(REQUIRED_HUGEPAGES_CPU_FLAGS);
        }
        let missing = missing_flags(&flags, &required);
        if !missing.is_empty() {
            error!(
                required = %required.join(", "),
                missing = %missing.join(", "),
                "Please use a CPU that has the following capabilities"
            );
            return Ok(CapabilityGate::Unmet(CPU_INCOMPATIBLE_MESSAGE.to_string()));
        }

        if hugepages_enabled {
            let allocatable = self.nodes.hugepages_allocatable().await?;
            if !hugepages_available(&allocatable) {
                debug!(?allocatable, "nodes lack {}", HUGEPAGES_RESOURCE);
                return Ok(CapabilityGate::Unmet(HUGEPAGES_UNAVAILABLE_MESSAGE.to_string()));
            }
        }
        Ok(CapabilityGate::Met)
    }
}
