//! Error types for the UPF operator
//!
//! Errors are structured with fields to aid debugging in production. The
//! variants follow how a reconciliation pass reacts to them:
//! - `NotFound` drives create / no-op-delete branches and is never fatal
//! - `Unavailable` and `Kube` end the pass; the controller re-invokes later
//! - `CommandFailed` is retried only by the bootstrap runner
//! - `ConfigInvalid` blocks all reconciliation until the spec is fixed
//! - `TimeoutExceeded` is raised once the bootstrap retry budget is spent

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for UPF operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that was not classified further
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A remote object does not exist
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Resource kind (e.g., "NetworkAttachmentDefinition")
        kind: String,
        /// Name of the missing object
        name: String,
    },

    /// Transport, auth or server failure talking to the cluster or container
    #[error("unavailable [{context}]: {message}")]
    Unavailable {
        /// Operation that failed (e.g., "get_workload_descriptor")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// A command executed inside the workload exited unsuccessfully
    #[error("command '{command}' failed (exit code {}): {stderr}", exit_code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()))]
    CommandFailed {
        /// The command line that was executed
        command: String,
        /// Exit status, if the process reported one
        exit_code: Option<i32>,
        /// Captured standard error
        stderr: String,
    },

    /// The resource spec failed validation
    #[error("The following configurations are not valid: [{}]", quoted_fields(fields))]
    ConfigInvalid {
        /// Invalid field names, sorted
        fields: Vec<String>,
    },

    /// A bounded retry loop ran out of time
    #[error("timed out after {budget:?} trying to {operation}")]
    TimeoutExceeded {
        /// What was being attempted
        operation: String,
        /// Total wall-clock budget that was exhausted
        budget: Duration,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The document kind being processed (if known)
        kind: Option<String>,
    },

    /// Template rendering error
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

fn quoted_fields(fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| format!("'{}'", f))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Create a not-found error for a resource kind and name
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an unavailable error with the given message
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable {
            context: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create an unavailable error with context
    pub fn unavailable_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Unavailable {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a command failure
    pub fn command_failed(
        command: impl Into<String>,
        exit_code: Option<i32>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            command: command.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    /// Create a config validation error listing the offending fields
    ///
    /// Fields are sorted and deduplicated so the message is stable.
    pub fn config_invalid<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        fields.sort();
        fields.dedup();
        Self::ConfigInvalid { fields }
    }

    /// Create a timeout error for an operation and its budget
    pub fn timeout(operation: impl Into<String>, budget: Duration) -> Self {
        Self::TimeoutExceeded {
            operation: operation.into(),
            budget,
        }
    }

    /// Create a serialization error with document kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Classify a kube-rs error from an operation on a named object.
    ///
    /// A 404 becomes `NotFound`; everything else is `Unavailable`.
    pub fn from_kube(
        kind: impl Into<String>,
        name: impl Into<String>,
        context: &str,
        source: kube::Error,
    ) -> Self {
        match source {
            kube::Error::Api(ae) if ae.code == 404 => Self::not_found(kind, name),
            other => Self::unavailable_with_context(context, other.to_string()),
        }
    }

    /// Returns true if this is a `NotFound` error
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// Returns true if this is a `CommandFailed` error
    pub fn is_command_failure(&self) -> bool {
        matches!(self, Error::CommandFailed { .. })
    }

    /// Check if this error is retryable
    ///
    /// Config validation errors need a spec change; serialization and
    /// template errors are bugs. Everything else may clear up on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. } => true,
            Error::NotFound { .. } => true,
            Error::Unavailable { .. } => true,
            Error::CommandFailed { .. } => true,
            Error::ConfigInvalid { .. } => false,
            Error::TimeoutExceeded { .. } => true,
            Error::Serialization { .. } => false,
            Error::Template(_) => false,
            Error::Internal { .. } => true,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization_for_kind("json", e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::serialization_for_kind("yaml", e.to_string())
    }
}
