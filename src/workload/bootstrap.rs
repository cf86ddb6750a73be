//! One-time bootstrap of the forwarder pipeline
//!
//! `bessctl run up4` loads the forwarding pipeline into a running `bessd`.
//! It must succeed once per container lifetime; the marker file outside the
//! persistent volume records that it did. A fresh container has no marker
//! and bootstraps again.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::declaration::bessd_environment;
use super::gateway::{argv, WorkloadGateway};
use crate::retry::{retry_until_deadline, RetryConfig};
use crate::{Error, Result, BOOTSTRAP_MARKER_PATH};

/// Command that configures the forwarder pipeline
pub const BOOTSTRAP_COMMAND: &str = "/opt/bess/bessctl/bessctl run /opt/bess/bessctl/conf/up4";

/// Content of the marker file; only its existence matters
pub const BOOTSTRAP_MARKER_CONTENT: &str = "Service `bessd` configured";

/// Bootstrap state of one container.
///
/// Only `NotStarted` and `Done` are ever observed from outside: the marker's
/// existence is the whole persisted representation. `Running` exists only
/// inside [`BootstrapRunner::run`] while the command is being retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapState {
    /// The command has not succeeded in this container
    NotStarted,
    /// The command is being attempted
    Running,
    /// The command succeeded and the marker exists
    Done,
}

/// What a call to [`BootstrapRunner::run`] did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Marker was present; the command was not invoked
    AlreadyDone,
    /// The command succeeded in this call and the marker was written
    Completed,
}

/// Runs the bootstrap command with a fixed interval until it succeeds or the budget runs out
pub struct BootstrapRunner {
    gateway: Arc<dyn WorkloadGateway>,
    retry: RetryConfig,
    command_timeout: Duration,
}

impl BootstrapRunner {
    /// Create a runner against the forwarder container
    pub fn new(gateway: Arc<dyn WorkloadGateway>, retry: RetryConfig, command_timeout: Duration) -> Self {
        Self {
            gateway,
            retry,
            command_timeout,
        }
    }

    /// Current state, read from the marker
    pub async fn state(&self) -> Result<BootstrapState> {
        if self.gateway.exists(BOOTSTRAP_MARKER_PATH).await? {
            Ok(BootstrapState::Done)
        } else {
            Ok(BootstrapState::NotStarted)
        }
    }

    /// Drive the state to `Done`.
    ///
    /// Command failures are retried every `retry.interval`; once the budget
    /// is spent this returns [`Error::TimeoutExceeded`] and the marker is not
    /// written. Other errors propagate immediately.
    pub async fn run(&self) -> Result<BootstrapOutcome> {
        if self.state().await? == BootstrapState::Done {
            debug!("bootstrap marker present, skipping");
            return Ok(BootstrapOutcome::AlreadyDone);
        }

        info!(state = ?BootstrapState::Running, "Starting configuration of the `bessd` service");
        let command = argv(BOOTSTRAP_COMMAND);
        let environment = bessd_environment();
        retry_until_deadline(
            &self.retry,
            "run bootstrap command",
            Error::is_command_failure,
            || self.gateway.exec(&command, &environment, self.command_timeout),
        )
        .await?;

        self.gateway
            .push(BOOTSTRAP_MARKER_PATH, BOOTSTRAP_MARKER_CONTENT.as_bytes())
            .await?;
        info!("{}", BOOTSTRAP_MARKER_CONTENT);
        Ok(BootstrapOutcome::Completed)
    }
}
