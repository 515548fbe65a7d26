//! Shell command builders for shaping operations

use qosmgr_common::shell;

use crate::plan::ShapingOperation;
use crate::tables::tc;
use crate::types::{ClassId, Rate};

/// Build kernel module load command
pub fn build_load_module_cmd(module: &str) -> String {
    format!("{} {}", shell::MODPROBE_CMD, shell::shellquote(module))
}

/// Build link state command
pub fn build_set_link_cmd(device: &str, up: bool) -> String {
    format!(
        "{} link set dev {} {}",
        shell::IP_CMD,
        shell::shellquote(device),
        if up { "up" } else { "down" }
    )
}

/// Build IFB device creation command
pub fn build_add_ifb_cmd(device: &str) -> String {
    format!(
        "{} link add {} type ifb",
        shell::IP_CMD,
        shell::shellquote(device)
    )
}

/// Build link deletion command
pub fn build_del_link_cmd(device: &str) -> String {
    format!("{} link del dev {}", shell::IP_CMD, shell::shellquote(device))
}

/// Build root qdisc deletion command
pub fn build_del_root_qdisc_cmd(device: &str) -> String {
    format!(
        "{} qdisc del dev {} root",
        shell::TC_CMD,
        shell::shellquote(device)
    )
}

/// Build ingress qdisc deletion command
pub fn build_del_ingress_qdisc_cmd(device: &str) -> String {
    format!(
        "{} qdisc del dev {} ingress",
        shell::TC_CMD,
        shell::shellquote(device)
    )
}

/// Build HTB root qdisc command
///
/// Unclassified traffic goes to `1:<default_minor>`.
pub fn build_replace_root_qdisc_cmd(device: &str, default_minor: &str) -> String {
    format!(
        "{} qdisc replace dev {} root handle {} htb default {}",
        shell::TC_CMD,
        shell::shellquote(device),
        tc::ROOT_HANDLE,
        shell::shellquote(default_minor)
    )
}

/// Build ingress qdisc creation command
pub fn build_add_ingress_qdisc_cmd(device: &str) -> String {
    format!(
        "{} qdisc add dev {} handle {} ingress",
        shell::TC_CMD,
        shell::shellquote(device),
        tc::INGRESS_HANDLE
    )
}

/// Build HTB class add/replace command
pub fn build_replace_class_cmd(
    device: &str,
    parent: &str,
    class_id: &ClassId,
    rate: &Rate,
    ceil: &Rate,
    priority: Option<u8>,
) -> String {
    let mut cmd = format!(
        "{} class replace dev {} parent {} classid {} htb rate {} ceil {}",
        shell::TC_CMD,
        shell::shellquote(device),
        shell::shellquote(parent),
        shell::shellquote(&class_id.to_string()),
        shell::shellquote(rate.as_str()),
        shell::shellquote(ceil.as_str())
    );
    if let Some(prio) = priority {
        cmd.push_str(&format!(" prio {}", prio));
    }
    cmd
}

/// Build firewall mark classifier command
///
/// Matches the full 32-bit mark and sends the packet to `flow_id`.
pub fn build_replace_mark_filter_cmd(
    device: &str,
    priority: u8,
    mark: u32,
    flow_id: &ClassId,
) -> String {
    format!(
        "{} filter replace dev {} parent {} protocol ip prio {} u32 match mark {:#x} {:#x} flowid {}",
        shell::TC_CMD,
        shell::shellquote(device),
        tc::ROOT_HANDLE,
        priority,
        mark,
        tc::MARK_MASK,
        shell::shellquote(&flow_id.to_string())
    )
}

/// Build ingress redirect command
///
/// Restores the connection mark onto each packet, then mirrors it to the
/// IFB device's egress.
pub fn build_replace_redirect_filter_cmd(device: &str, target: &str) -> String {
    format!(
        "{} filter replace dev {} parent {} protocol all prio {} u32 match u32 0 0 \
         action ctinfo cpmark action mirred egress redirect dev {}",
        shell::TC_CMD,
        shell::shellquote(device),
        tc::INGRESS_HANDLE,
        tc::REDIRECT_FILTER_PRIORITY,
        shell::shellquote(target)
    )
}

/// Renders an operation as the shell command that performs it.
pub fn render(op: &ShapingOperation) -> String {
    match op {
        ShapingOperation::LoadModule { module } => build_load_module_cmd(module),
        ShapingOperation::LinkUp { device } => build_set_link_cmd(device, true),
        ShapingOperation::LinkDown { device } => build_set_link_cmd(device, false),
        ShapingOperation::CreateVirtualDevice { device } => build_add_ifb_cmd(device),
        ShapingOperation::DeleteVirtualDevice { device } => build_del_link_cmd(device),
        ShapingOperation::DeleteRootQdisc { device } => build_del_root_qdisc_cmd(device),
        ShapingOperation::DeleteIngressQdisc { device } => build_del_ingress_qdisc_cmd(device),
        ShapingOperation::ReplaceRootQdisc {
            device,
            default_minor,
        } => build_replace_root_qdisc_cmd(device, default_minor),
        ShapingOperation::AddIngressQdisc { device } => build_add_ingress_qdisc_cmd(device),
        ShapingOperation::ReplaceClass {
            device,
            parent,
            class_id,
            rate,
            ceil,
            priority,
        } => build_replace_class_cmd(device, parent, class_id, rate, ceil, *priority),
        ShapingOperation::ReplaceMarkFilter {
            device,
            priority,
            mark,
            flow_id,
        } => build_replace_mark_filter_cmd(device, *priority, *mark, flow_id),
        ShapingOperation::ReplaceRedirectFilter { device, target } => {
            build_replace_redirect_filter_cmd(device, target)
        }
    }
}
