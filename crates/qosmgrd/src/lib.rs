//! QoS Manager - foomuuri macro policy to traffic control compiler
//!
//! qosmgrd reads the `macro { ... }` block of a foomuuri configuration file
//! and converges the kernel's traffic control state to the policy it
//! describes:
//! - HTB root scheduler and default class per WAN interface (upload)
//! - IFB redirect with connmark restore and a mirrored HTB tree (download)
//! - One class plus one mark filter per service and direction
//! - Per-interface rate/ceil overrides layered over service defaults
//! - Best-effort teardown and rollback

pub mod backend;
pub mod commands;
pub mod config_builder;
pub mod macro_reader;
pub mod plan;
pub mod qos_mgr;
pub mod tables;
pub mod types;
pub mod validate;

pub use backend::{ExecOutcome, RecordingBackend, ShaperBackend, ShellBackend, Tolerance};
pub use config_builder::{build_policy, release_targets, ReleaseTarget};
pub use macro_reader::{parse_macros, read_macro_file, RawMacroMap};
pub use plan::{compile_apply, compile_release, ShapingOperation};
pub use qos_mgr::QosMgr;
pub use types::{ClassId, ClassSpec, Direction, InterfaceConfig, QosPlan, Rate, ServiceConfig};
pub use validate::Validated;
