//! Shaper backends: where shaping operations actually land
//!
//! [`ShellBackend`] renders each operation into an `ip`/`tc`/`modprobe`
//! command line and runs it. [`RecordingBackend`] only records, and backs
//! both `--dry-run` and the tests.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use qosmgr_common::shell::{self, ExecResult};
use qosmgr_common::{QosMgrError, QosMgrResult};
use tracing::debug;

use crate::commands;
use crate::plan::ShapingOperation;

/// Kernel message for objects that already exist
const EXISTS_MARKER: &str = "File exists";

/// Where network device entries live in sysfs
const SYSFS_NET: &str = "/sys/class/net";

/// How a failed operation is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tolerance {
    /// Failure aborts the remaining steps of the direction
    Fatal,
    /// "Already exists" counts as success, anything else is fatal
    TolerateExisting,
    /// Failure is logged and ignored
    BestEffort,
}

/// Result of one operation that the backend managed to attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub succeeded: bool,
    /// Backend output worth surfacing (error text, tolerated condition)
    pub diagnostic: Option<String>,
}

impl ExecOutcome {
    pub fn ok() -> Self {
        Self {
            succeeded: true,
            diagnostic: None,
        }
    }

    pub fn failed(diagnostic: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            diagnostic: Some(diagnostic.into()),
        }
    }
}

/// Executes shaping operations against some traffic control implementation
///
/// `Ok` with `succeeded == false` is an ordinary operation failure. `Err` is
/// reserved for faults the backend could not classify, and makes the
/// controller roll back.
#[async_trait]
pub trait ShaperBackend: Send {
    async fn execute(
        &mut self,
        op: &ShapingOperation,
        tolerance: Tolerance,
    ) -> QosMgrResult<ExecOutcome>;

    /// Whether the network device is currently present
    fn device_exists(&self, device: &str) -> bool;
}

/// Runs operations as shell commands
#[derive(Debug, Clone)]
pub struct ShellBackend {
    timeout: Duration,
    sysfs_net: PathBuf,
}

impl ShellBackend {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sysfs_net: PathBuf::from(SYSFS_NET),
        }
    }

    /// Looks devices up under `path` instead of `/sys/class/net`
    pub fn with_sysfs_net(mut self, path: impl Into<PathBuf>) -> Self {
        self.sysfs_net = path.into();
        self
    }
}

/// Maps the result of running `cmd` onto an [`ExecOutcome`]
///
/// Non-zero exits and timeouts are operation failures. "File exists" counts
/// as success under [`Tolerance::TolerateExisting`]. Errors that are not
/// operation failures (the shell could not be spawned) are passed through.
fn classify(
    cmd: String,
    result: QosMgrResult<ExecResult>,
    tolerance: Tolerance,
) -> QosMgrResult<ExecOutcome> {
    match result {
        Ok(result) if result.success() => Ok(ExecOutcome::ok()),
        Ok(result) => {
            let output = result.combined_output().trim().to_string();
            if tolerance == Tolerance::TolerateExisting && output.contains(EXISTS_MARKER) {
                debug!(command = %cmd, "Object already exists");
                return Ok(ExecOutcome {
                    succeeded: true,
                    diagnostic: Some(output),
                });
            }
            Ok(ExecOutcome::failed(
                QosMgrError::ShellCommandFailed {
                    command: cmd,
                    exit_code: result.exit_code,
                    output,
                }
                .to_string(),
            ))
        }
        Err(e) if e.is_operation_failure() => Ok(ExecOutcome::failed(e.to_string())),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl ShaperBackend for ShellBackend {
    async fn execute(
        &mut self,
        op: &ShapingOperation,
        tolerance: Tolerance,
    ) -> QosMgrResult<ExecOutcome> {
        let cmd = commands::render(op);
        let result = shell::exec(&cmd, self.timeout).await;
        classify(cmd, result, tolerance)
    }

    fn device_exists(&self, device: &str) -> bool {
        !device.is_empty() && !device.contains('/') && self.sysfs_net.join(device).exists()
    }
}

type OpPredicate = Box<dyn Fn(&ShapingOperation) -> bool + Send + Sync>;

/// Records operations instead of running them
///
/// Every device exists unless marked missing, and every operation succeeds
/// unless a failure or fault predicate matches it. Successful virtual device
/// creation and deletion update the set of missing devices.
#[derive(Default)]
pub struct RecordingBackend {
    operations: Vec<ShapingOperation>,
    missing_devices: HashSet<String>,
    fail_when: Option<OpPredicate>,
    fault_when: Option<OpPredicate>,
}

impl fmt::Debug for RecordingBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingBackend")
            .field("operations", &self.operations.len())
            .field("missing_devices", &self.missing_devices)
            .finish()
    }
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports `device` as absent from the system
    pub fn with_missing_device(mut self, device: impl Into<String>) -> Self {
        self.missing_devices.insert(device.into());
        self
    }

    /// Makes matching operations fail like a rejected command
    pub fn failing_when(
        mut self,
        predicate: impl Fn(&ShapingOperation) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.fail_when = Some(Box::new(predicate));
        self
    }

    /// Makes matching operations return an unexpected backend error
    pub fn faulting_when(
        mut self,
        predicate: impl Fn(&ShapingOperation) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.fault_when = Some(Box::new(predicate));
        self
    }

    /// Operations attempted so far, in order
    pub fn operations(&self) -> &[ShapingOperation] {
        &self.operations
    }

    /// Attempted operations rendered as shell commands
    pub fn commands(&self) -> Vec<String> {
        self.operations.iter().map(commands::render).collect()
    }

    pub fn clear(&mut self) {
        self.operations.clear();
    }
}

#[async_trait]
impl ShaperBackend for RecordingBackend {
    async fn execute(
        &mut self,
        op: &ShapingOperation,
        _tolerance: Tolerance,
    ) -> QosMgrResult<ExecOutcome> {
        self.operations.push(op.clone());

        if self.fault_when.as_ref().is_some_and(|p| p(op)) {
            return Err(QosMgrError::internal(format!(
                "Injected backend fault: {}",
                commands::render(op)
            )));
        }
        if self.fail_when.as_ref().is_some_and(|p| p(op)) {
            return Ok(ExecOutcome::failed(format!(
                "Injected failure: {}",
                commands::render(op)
            )));
        }

        match op {
            ShapingOperation::CreateVirtualDevice { device } => {
                self.missing_devices.remove(device);
            }
            ShapingOperation::DeleteVirtualDevice { device } => {
                self.missing_devices.insert(device.clone());
            }
            _ => {}
        }
        Ok(ExecOutcome::ok())
    }

    fn device_exists(&self, device: &str) -> bool {
        !self.missing_devices.contains(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use std::io;

    fn link_up(device: &str) -> ShapingOperation {
        ShapingOperation::LinkUp {
            device: device.to_string(),
        }
    }

    fn exited(exit_code: i32, stderr: &str) -> QosMgrResult<ExecResult> {
        Ok(ExecResult {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        })
    }

    const CMD: &str = "/sbin/tc qdisc add dev \"eth0\" ingress";

    #[tokio::test]
    async fn test_recording_backend_records_in_order() {
        let mut backend = RecordingBackend::new();
        backend.execute(&link_up("eth0"), Tolerance::Fatal).await.unwrap();
        backend.execute(&link_up("ifb0"), Tolerance::Fatal).await.unwrap();

        assert_eq!(backend.operations(), &[link_up("eth0"), link_up("ifb0")]);
        assert_eq!(
            backend.commands(),
            vec![
                "/sbin/ip link set dev \"eth0\" up",
                "/sbin/ip link set dev \"ifb0\" up"
            ]
        );

        backend.clear();
        assert!(backend.operations().is_empty());
    }

    #[tokio::test]
    async fn test_recording_backend_failure_and_fault() {
        let mut backend = RecordingBackend::new()
            .failing_when(|op| op.device() == Some("eth0"))
            .faulting_when(|op| op.device() == Some("ifb0"));

        let outcome = backend.execute(&link_up("eth0"), Tolerance::Fatal).await.unwrap();
        assert!(!outcome.succeeded);
        assert!(outcome.diagnostic.unwrap().contains("eth0"));

        assert!(backend.execute(&link_up("ifb0"), Tolerance::Fatal).await.is_err());
        assert!(backend
            .execute(&link_up("eth1"), Tolerance::Fatal)
            .await
            .unwrap()
            .succeeded);
        assert_eq!(backend.operations().len(), 3);
    }

    #[test]
    fn test_recording_backend_missing_device() {
        let backend = RecordingBackend::new().with_missing_device("eth9");
        assert!(!backend.device_exists("eth9"));
        assert!(backend.device_exists("eth0"));
    }

    #[tokio::test]
    async fn test_recording_backend_tracks_virtual_devices() {
        let create = ShapingOperation::CreateVirtualDevice {
            device: "ifb0".to_string(),
        };
        let delete = ShapingOperation::DeleteVirtualDevice {
            device: "ifb0".to_string(),
        };

        let mut backend = RecordingBackend::new().with_missing_device("ifb0");
        backend.execute(&create, Tolerance::TolerateExisting).await.unwrap();
        assert!(backend.device_exists("ifb0"));
        backend.execute(&delete, Tolerance::BestEffort).await.unwrap();
        assert!(!backend.device_exists("ifb0"));

        let mut backend = RecordingBackend::new()
            .failing_when(|op| matches!(op, ShapingOperation::DeleteVirtualDevice { .. }));
        backend.execute(&delete, Tolerance::BestEffort).await.unwrap();
        assert!(backend.device_exists("ifb0"));
    }

    #[test]
    fn test_classify_success() {
        let outcome = classify(CMD.to_string(), exited(0, ""), Tolerance::Fatal).unwrap();
        assert_eq!(outcome, ExecOutcome::ok());
    }

    #[test]
    fn test_classify_tolerates_existing_object() {
        let outcome = classify(
            CMD.to_string(),
            exited(2, "RTNETLINK answers: File exists"),
            Tolerance::TolerateExisting,
        )
        .unwrap();
        assert!(outcome.succeeded);
        assert_eq!(
            outcome.diagnostic.as_deref(),
            Some("RTNETLINK answers: File exists")
        );
    }

    #[test]
    fn test_classify_existing_object_is_fatal_without_tolerance() {
        let outcome = classify(
            CMD.to_string(),
            exited(2, "RTNETLINK answers: File exists"),
            Tolerance::Fatal,
        )
        .unwrap();
        assert!(!outcome.succeeded);
        let detail = outcome.diagnostic.unwrap();
        assert!(detail.contains("exit code 2"));
        assert!(detail.contains("File exists"));
    }

    #[test]
    fn test_classify_other_error_is_not_tolerated() {
        let outcome = classify(
            CMD.to_string(),
            exited(1, "Cannot find device \"eth0\""),
            Tolerance::TolerateExisting,
        )
        .unwrap();
        assert!(!outcome.succeeded);
    }

    #[test]
    fn test_classify_timeout_is_operation_failure() {
        let result = Err(QosMgrError::CommandTimeout {
            command: CMD.to_string(),
            timeout: Duration::from_secs(20),
        });
        let outcome = classify(CMD.to_string(), result, Tolerance::BestEffort).unwrap();
        assert!(!outcome.succeeded);
        assert!(outcome.diagnostic.unwrap().contains("timed out"));
    }

    #[test]
    fn test_classify_spawn_error_is_fault() {
        let result = Err(QosMgrError::ShellExec {
            command: CMD.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "/bin/sh missing"),
        });
        let err = classify(CMD.to_string(), result, Tolerance::Fatal).unwrap_err();
        assert!(matches!(err, QosMgrError::ShellExec { .. }));
    }

    #[test]
    fn test_shell_backend_device_exists() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("eth0")).unwrap();

        let backend = ShellBackend::new(Duration::from_secs(1)).with_sysfs_net(dir.path());
        assert!(backend.device_exists("eth0"));
        assert!(!backend.device_exists("eth1"));
        assert!(!backend.device_exists(""));
        assert!(!backend.device_exists("../eth0"));
    }

    #[test]
    fn test_exec_outcome_constructors() {
        assert_eq!(
            ExecOutcome::ok(),
            ExecOutcome {
                succeeded: true,
                diagnostic: None
            }
        );
        assert_eq!(
            ExecOutcome::failed("boom").diagnostic.as_deref(),
            Some("boom")
        );
    }
}
