//! File and command gateway into a workload container
//!
//! The production gateway drives everything through pod exec: file
//! operations use coreutils, supervision goes through the `pebble` CLI.
//! A non-zero exit is always [`Error::CommandFailed`]; API and transport
//! failures are [`Error::Unavailable`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, DeleteParams};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use super::declaration::SupervisionDeclaration;
use crate::Error;

const PEBBLE: &str = "pebble";

/// Result of a command that exited
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit status
    pub exit_code: i32,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

/// Output of a command as the exec stream delivered it
#[derive(Debug)]
struct RawOutput {
    exit_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl From<RawOutput> for ExecOutput {
    fn from(raw: RawOutput) -> Self {
        Self {
            exit_code: raw.exit_code,
            stdout: String::from_utf8_lossy(&raw.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&raw.stderr).into_owned(),
        }
    }
}

/// Operations the reconcilers perform inside one container
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadGateway: Send + Sync {
    /// Whether the container's supervisor answers
    async fn can_connect(&self) -> bool;

    /// Whether `path` exists
    async fn exists(&self, path: &str) -> Result<bool, Error>;

    /// Read a file; `NotFound` when it does not exist
    async fn pull(&self, path: &str) -> Result<Vec<u8>, Error>;

    /// Write a file, creating parent directories
    async fn push(&self, path: &str, content: &[u8]) -> Result<(), Error>;

    /// Run a command; a non-zero exit or a timeout is `CommandFailed`
    async fn exec(
        &self,
        command: &[String],
        environment: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<ExecOutput, Error>;

    /// The supervisor's current plan
    async fn get_supervision_declaration(&self) -> Result<SupervisionDeclaration, Error>;

    /// Combine `declaration` into the plan under `label`
    async fn set_supervision_declaration(
        &self,
        label: &str,
        declaration: &SupervisionDeclaration,
    ) -> Result<(), Error>;

    /// Restart a supervised service
    async fn restart_service(&self, name: &str) -> Result<(), Error>;

    /// Whether a service is running.
    ///
    /// `false` means "not actionable yet": an unreachable container and a
    /// stopped service are reported the same way and never raise.
    async fn service_is_running(&self, name: &str) -> bool;

    /// Delete the whole instance so its controller recreates it
    async fn replace_instance(&self) -> Result<(), Error>;
}

/// Split a command line on whitespace into argv
pub fn argv(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

/// Log captured output line by line: stdout at info, stderr at error
pub fn log_output(output: &ExecOutput) {
    for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
        info!(target: "upf_operator::workload::exec", "{}", line);
    }
    for line in output.stderr.lines().filter(|l| !l.trim().is_empty()) {
        error!(target: "upf_operator::workload::exec", "{}", line);
    }
}

/// Gateway into one container of the instance pod via the Kubernetes exec API
pub struct KubeExecGateway {
    pods: Api<Pod>,
    pod_name: String,
    container: String,
    command_timeout: Duration,
}

impl KubeExecGateway {
    /// Create a gateway for `container` in `pod_name`
    pub fn new(
        client: Client,
        namespace: &str,
        pod_name: impl Into<String>,
        container: impl Into<String>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
            pod_name: pod_name.into(),
            container: container.into(),
            command_timeout,
        }
    }

    /// Run argv to completion, returning whatever exit status it had
    async fn run(&self, argv: Vec<String>, timeout: Duration) -> Result<ExecOutput, Error> {
        self.run_raw(argv, timeout).await.map(ExecOutput::from)
    }

    /// Like [`Self::run`] but stdout and stderr stay as bytes
    async fn run_raw(&self, argv: Vec<String>, timeout: Duration) -> Result<RawOutput, Error> {
        let command = argv.join(" ");
        match tokio::time::timeout(timeout, self.attach(argv)).await {
            Ok(result) => result,
            Err(_) => Err(Error::command_failed(
                command,
                None,
                format!("timed out after {:?}", timeout),
            )),
        }
    }

    async fn attach(&self, argv: Vec<String>) -> Result<RawOutput, Error> {
        let command = argv.join(" ");
        let params = AttachParams::default()
            .container(self.container.clone())
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = self
            .pods
            .exec(&self.pod_name, argv, &params)
            .await
            .map_err(|e| Error::from_kube("Pod", &self.pod_name, "exec", e))?;

        let status = attached.take_status();
        let (stdout, stderr) = tokio::join!(read_all(attached.stdout()), read_all(attached.stderr()));
        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| Error::unavailable_with_context("exec", e.to_string()))?;

        let exit_code = exit_code(status.as_ref()).ok_or_else(|| {
            Error::command_failed(command.clone(), None, "no exit status reported")
        })?;
        debug!(container = %self.container, command = %command, exit_code, "command exited");
        Ok(RawOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    /// Run argv and require exit status zero
    async fn run_checked(&self, argv: Vec<String>, timeout: Duration) -> Result<ExecOutput, Error> {
        let command = argv.join(" ");
        let output = self.run(argv, timeout).await?;
        if output.exit_code != 0 {
            return Err(Error::command_failed(
                command,
                Some(output.exit_code),
                output.stderr,
            ));
        }
        Ok(output)
    }

    fn pebble(args: &[&str]) -> Vec<String> {
        std::iter::once(PEBBLE)
            .chain(args.iter().copied())
            .map(str::to_string)
            .collect()
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        if let Err(e) = reader.read_to_end(&mut buf).await {
            warn!(error = %e, "failed to read command output");
        }
    }
    buf
}

/// Exit code from an exec status frame: `Success` is zero, otherwise the
/// `ExitCode` cause carries the number.
fn exit_code(status: Option<&Status>) -> Option<i32> {
    let status = status?;
    if status.status.as_deref() == Some("Success") {
        return Some(0);
    }
    status
        .details
        .as_ref()?
        .causes
        .as_ref()?
        .iter()
        .find(|c| c.reason.as_deref() == Some("ExitCode"))
        .and_then(|c| c.message.as_deref())
        .and_then(|m| m.parse().ok())
}

/// Parse `pebble services <name>` output
fn parse_service_running(output: &str, name: &str) -> bool {
    output.lines().skip(1).any(|line| {
        let mut cols = line.split_whitespace();
        cols.next() == Some(name) && cols.nth(1) == Some("active")
    })
}

#[async_trait]
impl WorkloadGateway for KubeExecGateway {
    async fn can_connect(&self) -> bool {
        self.run_checked(Self::pebble(&["version"]), self.command_timeout)
            .await
            .is_ok()
    }

    async fn exists(&self, path: &str) -> Result<bool, Error> {
        let argv = vec!["test".to_string(), "-e".to_string(), path.to_string()];
        let output = self.run(argv, self.command_timeout).await?;
        match output.exit_code {
            0 => Ok(true),
            1 => Ok(false),
            code => Err(Error::command_failed(
                format!("test -e {}", path),
                Some(code),
                output.stderr,
            )),
        }
    }

    async fn pull(&self, path: &str) -> Result<Vec<u8>, Error> {
        let argv = vec!["cat".to_string(), path.to_string()];
        let output = self.run_raw(argv, self.command_timeout).await?;
        if output.exit_code != 0 {
            return Err(Error::not_found("File", path));
        }
        Ok(output.stdout)
    }

    async fn push(&self, path: &str, content: &[u8]) -> Result<(), Error> {
        let script = r#"mkdir -p "$(dirname "$2")" && printf %s "$1" | base64 -d > "$2""#;
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "sh".to_string(),
            STANDARD.encode(content),
            path.to_string(),
        ];
        self.run_checked(argv, self.command_timeout).await?;
        debug!(container = %self.container, path = %path, bytes = content.len(), "pushed file");
        Ok(())
    }

    async fn exec(
        &self,
        command: &[String],
        environment: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<ExecOutput, Error> {
        let mut argv = Vec::with_capacity(command.len() + environment.len() + 1);
        if !environment.is_empty() {
            argv.push("env".to_string());
            argv.extend(environment.iter().map(|(k, v)| format!("{}={}", k, v)));
        }
        argv.extend(command.iter().cloned());

        let output = self.run(argv, timeout).await?;
        log_output(&output);
        if output.exit_code != 0 {
            return Err(Error::command_failed(
                command.join(" "),
                Some(output.exit_code),
                output.stderr,
            ));
        }
        Ok(output)
    }

    async fn get_supervision_declaration(&self) -> Result<SupervisionDeclaration, Error> {
        let output = self
            .run_checked(Self::pebble(&["plan"]), self.command_timeout)
            .await?;
        SupervisionDeclaration::from_yaml(&output.stdout)
    }

    async fn set_supervision_declaration(
        &self,
        label: &str,
        declaration: &SupervisionDeclaration,
    ) -> Result<(), Error> {
        let layer_path = format!("/tmp/{}-layer.yaml", label);
        self.push(&layer_path, declaration.to_yaml()?.as_bytes())
            .await?;
        self.run_checked(
            Self::pebble(&["add", "--combine", label, &layer_path]),
            self.command_timeout,
        )
        .await?;
        info!(container = %self.container, layer = %label, "supervision declaration replaced");
        Ok(())
    }

    async fn restart_service(&self, name: &str) -> Result<(), Error> {
        self.run_checked(Self::pebble(&["restart", name]), self.command_timeout)
            .await?;
        info!(container = %self.container, service = %name, "service restarted");
        Ok(())
    }

    async fn service_is_running(&self, name: &str) -> bool {
        match self
            .run_checked(Self::pebble(&["services", name]), self.command_timeout)
            .await
        {
            Ok(output) => parse_service_running(&output.stdout, name),
            Err(e) => {
                debug!(container = %self.container, service = %name, error = %e, "service state unavailable");
                false
            }
        }
    }

    async fn replace_instance(&self) -> Result<(), Error> {
        warn!(pod = %self.pod_name, "deleting pod so it is recreated");
        self.pods
            .delete(&self.pod_name, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_kube("Pod", &self.pod_name, "replace_instance", e))?;
        Ok(())
    }
}
