//! Plan compiler: typed policy to ordered shaping operations
//!
//! The compiler never touches the kernel. It turns a [`QosPlan`] into
//! [`ApplyPlan`] / [`ReleasePlan`] values whose steps the controller hands to
//! a [`ShaperBackend`](crate::backend::ShaperBackend) one at a time.
//!
//! Ordering per interface and direction:
//! 1. root HTB qdisc, root-bound class `1:1`, default class
//! 2. (download only, before 1) IFB creation, ingress qdisc, redirect filter
//! 3. one class and one mark filter per service
//! 4. the catch-all filter for the sentinel mark

use std::collections::HashSet;

use qosmgr_common::Diagnostics;

use crate::backend::Tolerance;
use crate::config_builder::ReleaseTarget;
use crate::tables::tc;
use crate::types::{ClassId, ClassSpec, Direction, InterfaceConfig, QosPlan, Rate, ServiceConfig};

/// A single backend-agnostic traffic control instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapingOperation {
    LoadModule {
        module: String,
    },
    LinkUp {
        device: String,
    },
    LinkDown {
        device: String,
    },
    CreateVirtualDevice {
        device: String,
    },
    DeleteVirtualDevice {
        device: String,
    },
    DeleteRootQdisc {
        device: String,
    },
    DeleteIngressQdisc {
        device: String,
    },
    /// HTB root with handle `1:` sending unclassified traffic to `1:<default_minor>`
    ReplaceRootQdisc {
        device: String,
        default_minor: String,
    },
    AddIngressQdisc {
        device: String,
    },
    ReplaceClass {
        device: String,
        parent: String,
        class_id: ClassId,
        rate: Rate,
        ceil: Rate,
        priority: Option<u8>,
    },
    ReplaceMarkFilter {
        device: String,
        priority: u8,
        mark: u32,
        flow_id: ClassId,
    },
    /// Match-all ingress filter: restore connmark, mirror to `target`
    ReplaceRedirectFilter {
        device: String,
        target: String,
    },
}

impl ShapingOperation {
    /// Device the operation acts on, if any
    pub fn device(&self) -> Option<&str> {
        match self {
            ShapingOperation::LoadModule { .. } => None,
            ShapingOperation::LinkUp { device }
            | ShapingOperation::LinkDown { device }
            | ShapingOperation::CreateVirtualDevice { device }
            | ShapingOperation::DeleteVirtualDevice { device }
            | ShapingOperation::DeleteRootQdisc { device }
            | ShapingOperation::DeleteIngressQdisc { device }
            | ShapingOperation::ReplaceRootQdisc { device, .. }
            | ShapingOperation::AddIngressQdisc { device }
            | ShapingOperation::ReplaceClass { device, .. }
            | ShapingOperation::ReplaceMarkFilter { device, .. }
            | ShapingOperation::ReplaceRedirectFilter { device, .. } => Some(device),
        }
    }
}

/// An operation plus how its failure is handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub op: ShapingOperation,
    pub tolerance: Tolerance,
    /// Best-effort operations issued when this step fails fatally
    pub cleanup: Vec<ShapingOperation>,
}

impl Step {
    pub fn fatal(op: ShapingOperation) -> Self {
        Self {
            op,
            tolerance: Tolerance::Fatal,
            cleanup: Vec::new(),
        }
    }

    pub fn tolerate_existing(op: ShapingOperation) -> Self {
        Self {
            op,
            tolerance: Tolerance::TolerateExisting,
            cleanup: Vec::new(),
        }
    }

    pub fn best_effort(op: ShapingOperation) -> Self {
        Self {
            op,
            tolerance: Tolerance::BestEffort,
            cleanup: Vec::new(),
        }
    }

    pub fn with_cleanup(mut self, op: ShapingOperation) -> Self {
        self.cleanup.push(op);
        self
    }
}

/// Steps for one direction of one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectionPlan {
    pub direction: Direction,
    /// Device carrying the HTB tree (physical for upload, IFB for download)
    pub device: String,
    /// IFB creation and ingress redirect, download only. A failure here
    /// skips the direction without failing the interface.
    pub redirect: Vec<Step>,
    pub steps: Vec<Step>,
}

/// Upload and optional download plans of one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfacePlan {
    pub name: String,
    pub upload: DirectionPlan,
    pub download: Option<DirectionPlan>,
}

/// Everything an apply issues after the teardown pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyPlan {
    pub preload: Vec<Step>,
    pub interfaces: Vec<InterfacePlan>,
}

/// Best-effort steps for one device, issued only if the device exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTeardown {
    pub device: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleasePlan {
    pub devices: Vec<DeviceTeardown>,
}

/// Effective parameters of one service class on one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedClass {
    pub class_id: ClassId,
    pub rate: Rate,
    pub ceil: Rate,
    pub priority: u8,
    pub filter_priority: u8,
}

/// Resolves a service's class for `device`: service-level spec and priority,
/// with rate and ceil replaced by a per-interface override when one exists.
pub fn resolve_service_class(
    service: &ServiceConfig,
    device: &str,
    direction: Direction,
) -> Option<ResolvedClass> {
    let spec = service.spec(direction)?;
    let (rate, ceil) = match service.override_for(device, direction) {
        Some(ovr) => (ovr.rate.clone(), ovr.ceil.clone()),
        None => (spec.rate.clone(), spec.ceil.clone()),
    };

    Some(ResolvedClass {
        class_id: ClassId::under_root(&spec.class_id_suffix),
        rate,
        ceil,
        priority: service.priority,
        filter_priority: spec.filter_priority,
    })
}

/// Root qdisc, root-bound class and default class on `device`
fn htb_tree_steps(device: &str, bandwidth: &Rate, default_class: &ClassSpec) -> Vec<Step> {
    let drop_root = ShapingOperation::DeleteRootQdisc {
        device: device.to_string(),
    };

    vec![
        Step::best_effort(drop_root.clone()),
        Step::fatal(ShapingOperation::ReplaceRootQdisc {
            device: device.to_string(),
            default_minor: default_class.id.minor().to_string(),
        }),
        Step::fatal(ShapingOperation::ReplaceClass {
            device: device.to_string(),
            parent: tc::ROOT_HANDLE.to_string(),
            class_id: ClassId::root_class(),
            rate: bandwidth.clone(),
            ceil: bandwidth.clone(),
            priority: None,
        })
        .with_cleanup(drop_root.clone()),
        Step::fatal(ShapingOperation::ReplaceClass {
            device: device.to_string(),
            parent: ClassId::root_class().to_string(),
            class_id: default_class.id.clone(),
            rate: default_class.rate.clone(),
            ceil: default_class.ceil.clone(),
            priority: Some(default_class.priority),
        })
        .with_cleanup(drop_root),
    ]
}

/// Service classes, their mark filters and the catch-all filter
fn classification_steps(
    device: &str,
    direction: Direction,
    default_class: &ClassSpec,
    services: &[ServiceConfig],
    diag: &mut Diagnostics,
) -> Vec<Step> {
    let mut steps = Vec::new();

    for service in services {
        let Some(class) = resolve_service_class(service, device, direction) else {
            continue;
        };
        diag.debug(format!(
            "{} class {} mark {:#x} on {} (rate {} ceil {} prio {} filter prio {})",
            direction,
            class.class_id,
            service.mark,
            device,
            class.rate,
            class.ceil,
            class.priority,
            class.filter_priority
        ));

        steps.push(Step::fatal(ShapingOperation::ReplaceClass {
            device: device.to_string(),
            parent: ClassId::root_class().to_string(),
            class_id: class.class_id.clone(),
            rate: class.rate,
            ceil: class.ceil,
            priority: Some(class.priority),
        }));
        steps.push(Step::fatal(ShapingOperation::ReplaceMarkFilter {
            device: device.to_string(),
            priority: class.filter_priority,
            mark: service.mark,
            flow_id: class.class_id,
        }));
    }

    steps.push(Step::fatal(ShapingOperation::ReplaceMarkFilter {
        device: device.to_string(),
        priority: tc::DEFAULT_FILTER_PRIORITY,
        mark: tc::DEFAULT_MARK,
        flow_id: default_class.id.clone(),
    }));

    steps
}

/// Upload plan: link up, HTB tree on the physical device, classification.
pub fn compile_upload(
    interface: &InterfaceConfig,
    services: &[ServiceConfig],
    diag: &mut Diagnostics,
) -> DirectionPlan {
    let device = interface.name.as_str();
    let default_class = interface.default_class(Direction::Upload);

    let mut steps = vec![Step::best_effort(ShapingOperation::LinkUp {
        device: device.to_string(),
    })];
    steps.extend(htb_tree_steps(
        device,
        interface.total_bandwidth(Direction::Upload),
        default_class,
    ));
    steps.extend(classification_steps(
        device,
        Direction::Upload,
        default_class,
        services,
        diag,
    ));

    DirectionPlan {
        direction: Direction::Upload,
        device: device.to_string(),
        redirect: Vec::new(),
        steps,
    }
}

/// Download plan: IFB device, ingress redirect with connmark restore, then
/// the HTB tree and classification on the IFB. `None` without an IFB.
pub fn compile_download(
    interface: &InterfaceConfig,
    services: &[ServiceConfig],
    diag: &mut Diagnostics,
) -> Option<DirectionPlan> {
    let Some(ifb) = interface.ifb.as_deref() else {
        diag.info(format!(
            "Download shaping not configured for {} (no IFB device)",
            interface.name
        ));
        return None;
    };
    let physical = interface.name.as_str();
    let default_class = interface.default_class(Direction::Download);

    let redirect = vec![
        Step::tolerate_existing(ShapingOperation::CreateVirtualDevice {
            device: ifb.to_string(),
        }),
        Step::fatal(ShapingOperation::LinkUp {
            device: ifb.to_string(),
        }),
        Step::best_effort(ShapingOperation::DeleteIngressQdisc {
            device: physical.to_string(),
        }),
        Step::tolerate_existing(ShapingOperation::AddIngressQdisc {
            device: physical.to_string(),
        }),
        Step::fatal(ShapingOperation::ReplaceRedirectFilter {
            device: physical.to_string(),
            target: ifb.to_string(),
        })
        .with_cleanup(ShapingOperation::DeleteIngressQdisc {
            device: physical.to_string(),
        }),
    ];

    let mut steps = htb_tree_steps(
        ifb,
        interface.total_bandwidth(Direction::Download),
        default_class,
    );
    steps.extend(classification_steps(
        ifb,
        Direction::Download,
        default_class,
        services,
        diag,
    ));

    Some(DirectionPlan {
        direction: Direction::Download,
        device: ifb.to_string(),
        redirect,
        steps,
    })
}

/// Compiles the full apply plan for a validated policy.
pub fn compile_apply(policy: &QosPlan, diag: &mut Diagnostics) -> ApplyPlan {
    let preload = tc::KERNEL_MODULES
        .iter()
        .map(|module| {
            Step::best_effort(ShapingOperation::LoadModule {
                module: module.to_string(),
            })
        })
        .collect();

    let interfaces = policy
        .interfaces
        .iter()
        .map(|interface| InterfacePlan {
            name: interface.name.clone(),
            upload: compile_upload(interface, &policy.services, diag),
            download: compile_download(interface, &policy.services, diag),
        })
        .collect();

    ApplyPlan {
        preload,
        interfaces,
    }
}

/// Compiles the teardown of every target device and each distinct IFB.
pub fn compile_release(targets: &[ReleaseTarget]) -> ReleasePlan {
    let mut devices: Vec<DeviceTeardown> = targets
        .iter()
        .map(|target| DeviceTeardown {
            device: target.device.clone(),
            steps: vec![
                Step::best_effort(ShapingOperation::DeleteRootQdisc {
                    device: target.device.clone(),
                }),
                Step::best_effort(ShapingOperation::DeleteIngressQdisc {
                    device: target.device.clone(),
                }),
            ],
        })
        .collect();

    let mut seen = HashSet::new();
    for ifb in targets.iter().filter_map(|t| t.ifb.as_deref()) {
        if !seen.insert(ifb) {
            continue;
        }
        let device = ifb.to_string();
        devices.push(DeviceTeardown {
            device: device.clone(),
            steps: vec![
                Step::best_effort(ShapingOperation::DeleteRootQdisc {
                    device: device.clone(),
                }),
                Step::best_effort(ShapingOperation::DeleteIngressQdisc {
                    device: device.clone(),
                }),
                Step::best_effort(ShapingOperation::LinkDown {
                    device: device.clone(),
                }),
                Step::best_effort(ShapingOperation::DeleteVirtualDevice { device }),
            ],
        });
    }

    ReleasePlan { devices }
}
