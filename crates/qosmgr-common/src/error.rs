//! Error types for QoS manager operations.
//!
//! Field- and unit-level validation problems are not errors: they are
//! reported as `Validated` outcomes by the daemon crate and only show up
//! here once they become fatal for the whole run.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for QoS manager operations.
pub type QosMgrResult<T> = Result<T, QosMgrError>;

/// Errors that can occur during QoS manager operations.
#[derive(Debug, Error)]
pub enum QosMgrError {
    /// The policy file is missing or cannot be read.
    #[error("Failed to read policy file {}: {source}", path.display())]
    SourceUnreadable {
        /// The policy file path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// No interface definition survived validation.
    #[error("No interface could be resolved from the policy macros")]
    NoUnitsResolved,

    /// Shaping failed for one or more interfaces.
    #[error("Shaping failed for interface(s): {}", interfaces.join(", "))]
    ApplyFailed {
        /// Interfaces whose upload or download shaping did not complete.
        interfaces: Vec<String>,
    },

    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// Shell command did not finish within its time budget.
    #[error("Shell command timed out after {}s: '{command}'", timeout.as_secs())]
    CommandTimeout {
        /// The command that timed out.
        command: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The process lacks the privilege needed to touch traffic control state.
    #[error("Insufficient privilege: must run as root")]
    PermissionDenied,

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl QosMgrError {
    /// Creates a source unreadable error.
    pub fn source_unreadable(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::SourceUnreadable {
            path: path.into(),
            source,
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error describes a single operation that did not
    /// succeed, as opposed to an unexpected fault in the apply path.
    pub fn is_operation_failure(&self) -> bool {
        matches!(
            self,
            QosMgrError::ShellCommandFailed { .. } | QosMgrError::CommandTimeout { .. }
        )
    }
}
