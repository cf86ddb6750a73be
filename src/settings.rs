//! Tunable operator constants
//!
//! Every number that shapes the reconciliation timing lives here rather than
//! inline, so tests can shrink intervals and budgets.

use std::time::Duration;

/// Interval between bootstrap command attempts
pub const BOOTSTRAP_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Total wall-clock budget for the bootstrap command, measured from the first attempt
pub const BOOTSTRAP_BUDGET: Duration = Duration::from_secs(300);

/// Timeout for a single command executed inside the workload
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Metric of the default route toward the core gateway
pub const DEFAULT_ROUTE_METRIC: u32 = 110;

/// Requeue interval after a pass that reached `Active`
pub const ACTIVE_REQUEUE: Duration = Duration::from_secs(300);

/// Requeue interval after a pass that ended `Waiting`
pub const WAITING_REQUEUE: Duration = Duration::from_secs(10);

/// Requeue interval after a failed pass
pub const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Minimum `hugepages-1Gi` every node must expose in DPDK mode, in bytes
pub const REQUIRED_HUGEPAGES_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Runtime settings threaded through the reconcilers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorSettings {
    /// Interval between bootstrap attempts
    pub bootstrap_retry_interval: Duration,
    /// Total bootstrap budget
    pub bootstrap_budget: Duration,
    /// Per-command timeout
    pub command_timeout: Duration,
    /// Default route metric
    pub route_metric: u32,
    /// Requeue after `Active`
    pub active_requeue: Duration,
    /// Requeue after `Waiting` or `Blocked`
    pub waiting_requeue: Duration,
    /// Requeue after an error
    pub error_requeue: Duration,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            bootstrap_retry_interval: BOOTSTRAP_RETRY_INTERVAL,
            bootstrap_budget: BOOTSTRAP_BUDGET,
            command_timeout: COMMAND_TIMEOUT,
            route_metric: DEFAULT_ROUTE_METRIC,
            active_requeue: ACTIVE_REQUEUE,
            waiting_requeue: WAITING_REQUEUE,
            error_requeue: ERROR_REQUEUE,
        }
    }
}
