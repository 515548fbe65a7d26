//! Common infrastructure for the QoS macro manager.
//!
//! This crate provides the pieces shared by the policy compiler and the
//! daemon binary:
//!
//! - [`shell`]: Shell command execution with quoting and a per-call timeout
//! - [`diagnostics`]: The injected diagnostics sink carrying severities
//! - [`error`]: Error types for manager operations
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use qosmgr_common::shell::{self, TC_CMD, shellquote};
//!
//! async fn drop_root(dev: &str) -> qosmgr_common::QosMgrResult<()> {
//!     let cmd = format!("{} qdisc del dev {} root", TC_CMD, shellquote(dev));
//!     shell::exec(&cmd, Duration::from_secs(20)).await?;
//!     Ok(())
//! }
//! ```

pub mod diagnostics;
pub mod error;
pub mod shell;

// Re-export commonly used items at crate root
pub use diagnostics::{Diagnostic, Diagnostics, Severity};
pub use error::{QosMgrError, QosMgrResult};
