//! Shell command execution utilities.
//!
//! Every token that comes from the policy file is passed through
//! [`shellquote`] before it reaches `/bin/sh`, and every command runs under a
//! caller-supplied timeout.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use qosmgr_common::shell::{self, IP_CMD, shellquote};
//!
//! let dev = "ifb0";
//! let cmd = format!("{} link set dev {} up", IP_CMD, shellquote(dev));
//! let result = shell::exec(&cmd, Duration::from_secs(20)).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::{QosMgrError, QosMgrResult};

/// Path to the `ip` command for link management.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the `tc` command for traffic control.
pub const TC_CMD: &str = "/sbin/tc";

/// Path to the `modprobe` command for kernel module loading.
pub const MODPROBE_CMD: &str = "/sbin/modprobe";

/// Regex for characters that need escaping in shell double-quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// The string is wrapped in double quotes and `$`, `` ` ``, `"`, `\` and
/// newline are escaped.
///
/// # Example
///
/// ```
/// use qosmgr_common::shell::shellquote;
///
/// assert_eq!(shellquote("eth0"), "\"eth0\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// The captured stdout output.
    pub stdout: String,
    /// The captured stderr output.
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Executes a shell command asynchronously, bounded by `timeout`.
///
/// The command runs through `/bin/sh -c`. A non-zero exit is reported in the
/// returned [`ExecResult`], not as an error.
///
/// # Errors
///
/// * [`QosMgrError::ShellExec`] if the shell could not be spawned
/// * [`QosMgrError::CommandTimeout`] if the command outlived `timeout`; the
///   child process is killed
pub async fn exec(cmd: &str, timeout: Duration) -> QosMgrResult<ExecResult> {
    tracing::debug!(command = %cmd, "Executing shell command");

    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, child).await {
        Ok(output) => output.map_err(|e| QosMgrError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?,
        Err(_) => {
            tracing::warn!(command = %cmd, timeout_secs = timeout.as_secs(), "Command timed out");
            return Err(QosMgrError::CommandTimeout {
                command: cmd.to_string(),
                timeout,
            });
        }
    };

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    let result = ExecResult {
        exit_code,
        stdout,
        stderr,
    };

    if result.success() {
        tracing::trace!(command = %cmd, exit_code = exit_code, "Command succeeded");
    } else {
        tracing::debug!(
            command = %cmd,
            exit_code = exit_code,
            stderr = %result.stderr,
            "Command exited non-zero"
        );
    }

    Ok(result)
}
