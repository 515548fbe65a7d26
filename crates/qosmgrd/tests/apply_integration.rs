//! End-to-end tests: policy file in, recorded traffic control commands out
//!
//! Every test runs the full reader, builder, compiler and controller chain
//! against a [`RecordingBackend`], so no kernel state is touched.

use std::io::Write;

use pretty_assertions::assert_eq;
use qosmgr_common::{QosMgrError, Severity};
use qosmgrd::{QosMgr, RecordingBackend, ShaperBackend, ShapingOperation};
use tempfile::NamedTempFile;

const WAN: &str = r#"
    QOS_IF_WAN_NAME "eth0"
    QOS_IF_WAN_IFB "ifb0"
    QOS_IF_WAN_TOTAL_UPLOAD_BW 100mbit
    QOS_IF_WAN_TOTAL_DOWNLOAD_BW 200mbit
    QOS_IF_WAN_DEFAULT_UPLOAD_ID 1:99
    QOS_IF_WAN_DEFAULT_UPLOAD_RATE 10mbit
    QOS_IF_WAN_DEFAULT_UPLOAD_CEIL 100mbit
    QOS_IF_WAN_DEFAULT_DOWNLOAD_ID 1:99
    QOS_IF_WAN_DEFAULT_DOWNLOAD_RATE 20mbit
    QOS_IF_WAN_DEFAULT_DOWNLOAD_CEIL 200mbit
"#;

const LTE: &str = r#"
    QOS_IF_LTE_NAME wwan0
    QOS_IF_LTE_IFB ifb1
    QOS_IF_LTE_TOTAL_UPLOAD_BW 20mbit
    QOS_IF_LTE_TOTAL_DOWNLOAD_BW 50mbit
    QOS_IF_LTE_DEFAULT_UPLOAD_ID 1:99
    QOS_IF_LTE_DEFAULT_UPLOAD_PRIO 6
    QOS_IF_LTE_DEFAULT_UPLOAD_RATE 1mbit
    QOS_IF_LTE_DEFAULT_UPLOAD_CEIL 20mbit
    QOS_IF_LTE_DEFAULT_DOWNLOAD_ID 1:99
    QOS_IF_LTE_DEFAULT_DOWNLOAD_RATE 1mbit
    QOS_IF_LTE_DEFAULT_DOWNLOAD_CEIL 50mbit
"#;

const VOIP: &str = r#"
    QOS_SRV_VOIP_MARK 0x10
    QOS_SRV_VOIP_PRIORITY 1
    QOS_SRV_VOIP_UPLOAD_SUFFIX 10
    QOS_SRV_VOIP_UPLOAD_RATE_DEFAULT 10mbit
    QOS_SRV_VOIP_UPLOAD_CEIL_DEFAULT 12mbit
"#;

fn policy_file(blocks: &[&str]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "# foomuuri configuration").unwrap();
    writeln!(file, "zone {{\n    localhost\n    public\n}}").unwrap();
    writeln!(file, "macro {{").unwrap();
    for block in blocks {
        writeln!(file, "{}", block).unwrap();
    }
    writeln!(file, "}}").unwrap();
    file.flush().unwrap();
    file
}

async fn apply(file: &NamedTempFile) -> (Result<(), QosMgrError>, QosMgr<RecordingBackend>) {
    let mut mgr = QosMgr::new(file.path(), RecordingBackend::new());
    let result = mgr.apply().await;
    (result, mgr)
}

fn class_line(commands: &[String], device: &str, class_id: &str) -> Option<String> {
    let needle = format!("class replace dev \"{}\" parent \"1:1\" classid \"{}\"", device, class_id);
    commands.iter().find(|c| c.contains(&needle)).cloned()
}

#[tokio::test]
async fn test_full_command_sequence() {
    let file = policy_file(&[WAN, "    QOS_SERVICE_LIST VOIP", VOIP]);
    let (result, mgr) = apply(&file).await;
    result.unwrap();

    let expected = vec![
        // teardown of previous state
        "/sbin/tc qdisc del dev \"eth0\" root",
        "/sbin/tc qdisc del dev \"eth0\" ingress",
        "/sbin/tc qdisc del dev \"ifb0\" root",
        "/sbin/tc qdisc del dev \"ifb0\" ingress",
        "/sbin/ip link set dev \"ifb0\" down",
        "/sbin/ip link del dev \"ifb0\"",
        // kernel modules
        "/sbin/modprobe \"ifb\"",
        "/sbin/modprobe \"sch_htb\"",
        "/sbin/modprobe \"act_ctinfo\"",
        // upload
        "/sbin/ip link set dev \"eth0\" up",
        "/sbin/tc qdisc del dev \"eth0\" root",
        "/sbin/tc qdisc replace dev \"eth0\" root handle 1: htb default \"99\"",
        "/sbin/tc class replace dev \"eth0\" parent \"1:\" classid \"1:1\" htb rate \"100mbit\" ceil \"100mbit\"",
        "/sbin/tc class replace dev \"eth0\" parent \"1:1\" classid \"1:99\" htb rate \"10mbit\" ceil \"100mbit\" prio 7",
        "/sbin/tc class replace dev \"eth0\" parent \"1:1\" classid \"1:10\" htb rate \"10mbit\" ceil \"12mbit\" prio 1",
        "/sbin/tc filter replace dev \"eth0\" parent 1: protocol ip prio 10 u32 match mark 0x10 0xffffffff flowid \"1:10\"",
        "/sbin/tc filter replace dev \"eth0\" parent 1: protocol ip prio 20 u32 match mark 0xff 0xffffffff flowid \"1:99\"",
        // download
        "/sbin/ip link add \"ifb0\" type ifb",
        "/sbin/ip link set dev \"ifb0\" up",
        "/sbin/tc qdisc del dev \"eth0\" ingress",
        "/sbin/tc qdisc add dev \"eth0\" handle ffff: ingress",
        "/sbin/tc filter replace dev \"eth0\" parent ffff: protocol all prio 1 u32 match u32 0 0 \
         action ctinfo cpmark action mirred egress redirect dev \"ifb0\"",
        "/sbin/tc qdisc del dev \"ifb0\" root",
        "/sbin/tc qdisc replace dev \"ifb0\" root handle 1: htb default \"99\"",
        "/sbin/tc class replace dev \"ifb0\" parent \"1:\" classid \"1:1\" htb rate \"200mbit\" ceil \"200mbit\"",
        "/sbin/tc class replace dev \"ifb0\" parent \"1:1\" classid \"1:99\" htb rate \"20mbit\" ceil \"200mbit\" prio 7",
        "/sbin/tc filter replace dev \"ifb0\" parent 1: protocol ip prio 20 u32 match mark 0xff 0xffffffff flowid \"1:99\"",
    ];

    assert_eq!(mgr.backend().commands(), expected);
}

#[tokio::test]
async fn test_override_applies_to_its_interface_only() {
    let file = policy_file(&[
        WAN,
        LTE,
        "    QOS_SERVICE_LIST VOIP",
        VOIP,
        "    QOS_SRV_VOIP_OVERRIDE_WAN_UPLOAD_RATE 20mbit",
        "    QOS_SRV_VOIP_OVERRIDE_WAN_UPLOAD_CEIL 25mbit",
    ]);
    let (result, mgr) = apply(&file).await;
    result.unwrap();

    let commands = mgr.backend().commands();
    assert_eq!(
        class_line(&commands, "eth0", "1:10").unwrap(),
        "/sbin/tc class replace dev \"eth0\" parent \"1:1\" classid \"1:10\" htb rate \"20mbit\" ceil \"25mbit\" prio 1"
    );
    assert_eq!(
        class_line(&commands, "wwan0", "1:10").unwrap(),
        "/sbin/tc class replace dev \"wwan0\" parent \"1:1\" classid \"1:10\" htb rate \"10mbit\" ceil \"12mbit\" prio 1"
    );
    assert_eq!(
        class_line(&commands, "wwan0", "1:99").unwrap(),
        "/sbin/tc class replace dev \"wwan0\" parent \"1:1\" classid \"1:99\" htb rate \"1mbit\" ceil \"20mbit\" prio 6"
    );
}

#[tokio::test]
async fn test_partial_override_is_discarded() {
    let file = policy_file(&[
        WAN,
        "    QOS_SERVICE_LIST VOIP",
        VOIP,
        "    QOS_SRV_VOIP_OVERRIDE_WAN_UPLOAD_RATE 20mbit",
    ]);
    let (result, mgr) = apply(&file).await;
    result.unwrap();

    let commands = mgr.backend().commands();
    assert_eq!(
        class_line(&commands, "eth0", "1:10").unwrap(),
        "/sbin/tc class replace dev \"eth0\" parent \"1:1\" classid \"1:10\" htb rate \"10mbit\" ceil \"12mbit\" prio 1"
    );
    assert!(mgr
        .diagnostics()
        .contains(Severity::Warning, "Partial upload override"));
}

#[tokio::test]
async fn test_apply_is_idempotent() {
    let file = policy_file(&[WAN, LTE, "    QOS_SERVICE_LIST VOIP", VOIP]);
    let mut mgr = QosMgr::new(file.path(), RecordingBackend::new());

    mgr.apply().await.unwrap();
    let first = mgr.backend().commands();

    mgr.apply().await.unwrap();
    let all = mgr.backend().commands();
    let second = &all[first.len()..];

    assert_eq!(first.as_slice(), second);
}

#[tokio::test]
async fn test_zero_interfaces_emits_nothing() {
    let file = policy_file(&["    QOS_SERVICE_LIST VOIP", VOIP]);
    let (result, mgr) = apply(&file).await;

    assert!(matches!(result, Err(QosMgrError::NoUnitsResolved)));
    assert!(mgr.backend().operations().is_empty());
}

#[tokio::test]
async fn test_incomplete_download_spec_emits_upload_only() {
    let file = policy_file(&[
        WAN,
        "    QOS_SERVICE_LIST VOIP",
        VOIP,
        "    QOS_SRV_VOIP_DOWNLOAD_SUFFIX 10",
        "    QOS_SRV_VOIP_DOWNLOAD_RATE_DEFAULT 10mbit",
    ]);
    let (result, mgr) = apply(&file).await;
    result.unwrap();

    let commands = mgr.backend().commands();
    assert!(class_line(&commands, "eth0", "1:10").is_some());
    assert!(class_line(&commands, "ifb0", "1:10").is_none());
    assert!(!commands
        .iter()
        .any(|c| c.contains("dev \"ifb0\"") && c.contains("match mark 0x10 ")));
    assert!(mgr
        .diagnostics()
        .contains(Severity::Warning, "Incomplete download spec"));
}

// Download overrides are looked up under the uppercased IFB name first and
// the interface key second; upload overrides only under the interface key.
#[tokio::test]
async fn test_download_override_lookup_is_asymmetric() {
    let file = policy_file(&[
        WAN,
        "    QOS_SERVICE_LIST VOIP",
        VOIP,
        "    QOS_SRV_VOIP_DOWNLOAD_SUFFIX 10",
        "    QOS_SRV_VOIP_DOWNLOAD_RATE_DEFAULT 10mbit",
        "    QOS_SRV_VOIP_DOWNLOAD_CEIL_DEFAULT 12mbit",
        "    QOS_SRV_VOIP_OVERRIDE_IFB0_DOWNLOAD_RATE 30mbit",
        "    QOS_SRV_VOIP_OVERRIDE_WAN_DOWNLOAD_CEIL 35mbit",
        "    QOS_SRV_VOIP_OVERRIDE_IFB0_UPLOAD_RATE 40mbit",
        "    QOS_SRV_VOIP_OVERRIDE_IFB0_UPLOAD_CEIL 45mbit",
    ]);
    let (result, mgr) = apply(&file).await;
    result.unwrap();

    let commands = mgr.backend().commands();
    assert_eq!(
        class_line(&commands, "ifb0", "1:10").unwrap(),
        "/sbin/tc class replace dev \"ifb0\" parent \"1:1\" classid \"1:10\" htb rate \"30mbit\" ceil \"35mbit\" prio 1"
    );
    assert_eq!(
        class_line(&commands, "eth0", "1:10").unwrap(),
        "/sbin/tc class replace dev \"eth0\" parent \"1:1\" classid \"1:10\" htb rate \"10mbit\" ceil \"12mbit\" prio 1"
    );
    assert!(commands.iter().any(|c| c
        == "/sbin/tc filter replace dev \"ifb0\" parent 1: protocol ip prio 15 u32 match mark 0x10 0xffffffff flowid \"1:10\""));
}

#[tokio::test]
async fn test_invalid_interface_does_not_block_others() {
    let file = policy_file(&[
        WAN,
        LTE,
        "    QOS_IF_LTE_TOTAL_UPLOAD_BW 20mbps",
        "    QOS_SERVICE_LIST VOIP",
        VOIP,
    ]);
    let (result, mgr) = apply(&file).await;
    result.unwrap();

    let commands = mgr.backend().commands();
    assert!(class_line(&commands, "eth0", "1:10").is_some());
    assert!(class_line(&commands, "wwan0", "1:10").is_none());
    // still released, since it was discovered
    assert_eq!(
        commands.iter().filter(|c| c.contains("\"wwan0\"")).count(),
        2
    );
    assert!(mgr.diagnostics().has_errors());
}

#[tokio::test]
async fn test_failure_reports_every_failed_interface() {
    let file = policy_file(&[WAN, LTE, "    QOS_SERVICE_LIST VOIP", VOIP]);
    let backend = RecordingBackend::new().failing_when(|op| {
        matches!(op, ShapingOperation::ReplaceMarkFilter { mark: 0x10, .. })
    });
    let mut mgr = QosMgr::new(file.path(), backend);

    match mgr.apply().await {
        Err(QosMgrError::ApplyFailed { interfaces }) => {
            assert_eq!(interfaces, vec!["wwan0".to_string(), "eth0".to_string()])
        }
        other => panic!("unexpected result: {:?}", other),
    }

    // the catch-all filter is never reached on a failed direction
    let commands = mgr.backend().commands();
    assert!(!commands.iter().any(|c| c.contains("match mark 0xff")));

    // failed interfaces trigger a full teardown; the IFBs were already
    // removed up front and never recreated, so only the WAN devices remain
    let tail = vec![
        "/sbin/tc qdisc del dev \"wwan0\" root",
        "/sbin/tc qdisc del dev \"wwan0\" ingress",
        "/sbin/tc qdisc del dev \"eth0\" root",
        "/sbin/tc qdisc del dev \"eth0\" ingress",
    ];
    assert_eq!(&commands[commands.len() - tail.len()..], tail.as_slice());
    assert!(!mgr.backend().device_exists("ifb0"));
    assert!(!mgr.backend().device_exists("ifb1"));
}

#[tokio::test]
async fn test_release_removes_each_ifb_once() {
    let file = policy_file(&[
        WAN,
        LTE,
        "    QOS_IF_LTE_IFB ifb0",
    ]);
    let mut mgr = QosMgr::new(file.path(), RecordingBackend::new());
    mgr.release().await;

    let expected = vec![
        "/sbin/tc qdisc del dev \"wwan0\" root",
        "/sbin/tc qdisc del dev \"wwan0\" ingress",
        "/sbin/tc qdisc del dev \"eth0\" root",
        "/sbin/tc qdisc del dev \"eth0\" ingress",
        "/sbin/tc qdisc del dev \"ifb0\" root",
        "/sbin/tc qdisc del dev \"ifb0\" ingress",
        "/sbin/ip link set dev \"ifb0\" down",
        "/sbin/ip link del dev \"ifb0\"",
    ];
    assert_eq!(mgr.backend().commands(), expected);
}
