//! QoS Manager Daemon Entry Point
//!
//! One-shot: `--start` applies the policy, `--stop` releases it. Stdout
//! carries the verdict, `success` or `failed`.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{ArgGroup, Parser};
use qosmgr_common::QosMgrError;
use qosmgrd::tables::defaults;
use qosmgrd::{QosMgr, RecordingBackend, ShaperBackend, ShellBackend};
use tracing::{error, info};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Foomuuri QoS macro policy to traffic control compiler
#[derive(Parser, Debug)]
#[command(name = "qosmgrd")]
#[command(author, version, about, long_about = None)]
#[command(group(
    ArgGroup::new("action")
        .required(true)
        .args(["start", "stop", "dump_policy"])
))]
struct Args {
    /// Apply the QoS policy
    #[arg(long)]
    start: bool,

    /// Remove QoS shaping from the policy's interfaces
    #[arg(long)]
    stop: bool,

    /// Print the validated policy as JSON and exit
    #[arg(long)]
    dump_policy: bool,

    /// Foomuuri configuration file holding the macro block
    #[arg(short = 'c', long, default_value = defaults::CONFIG_PATH)]
    config_file: PathBuf,

    /// Timeout for each external command, in seconds
    #[arg(long, default_value_t = defaults::COMMAND_TIMEOUT_SECS)]
    command_timeout: u64,

    /// Log level (trace, debug, info, warn, error) or a tracing filter
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print the commands instead of running them
    #[arg(short = 'n', long)]
    dry_run: bool,
}

/// `RUST_LOG` wins over `--log-level` when set and valid.
fn env_filter(log_level: &str) -> anyhow::Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("Invalid log level '{}'", log_level))
}

fn init_tracing(args: &Args) -> anyhow::Result<()> {
    let filter = env_filter(&args.log_level)?;

    let (writer, ansi) = match &args.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(writer)
        .try_init()
        .map_err(|e| anyhow!(e))
}

fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

/// Privilege check, done before `--log-file` is opened so an unprivileged
/// run never creates or appends to it. The refusal is logged to stderr only.
fn check_privilege(args: &Args) -> Result<(), QosMgrError> {
    if args.dry_run || args.dump_policy || is_root() {
        return Ok(());
    }

    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
    Err(QosMgrError::PermissionDenied)
}

fn dump_policy(args: &Args) -> anyhow::Result<()> {
    let mut mgr = QosMgr::new(&args.config_file, RecordingBackend::new());
    let policy = mgr.load_policy()?;
    let json = serde_json::to_string_pretty(&policy).context("Failed to serialize policy")?;
    println!("{}", json);
    Ok(())
}

async fn run<B: ShaperBackend>(mgr: &mut QosMgr<B>, args: &Args) -> bool {
    if args.stop {
        mgr.release().await;
        return true;
    }

    match mgr.apply().await {
        Ok(()) => true,
        Err(e) => {
            error!("QoS apply failed: {}", e);
            false
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = check_privilege(&args) {
        error!("{}", e);
        eprintln!("failed - run as root");
        return ExitCode::FAILURE;
    }

    if let Err(e) = init_tracing(&args) {
        eprintln!("failed - {:#}", e);
        return ExitCode::FAILURE;
    }

    if args.dump_policy {
        return match dump_policy(&args) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{:#}", e);
                ExitCode::FAILURE
            }
        };
    }

    info!(
        "Starting qosmgrd ({})",
        if args.start { "start" } else { "stop" }
    );

    let succeeded = if args.dry_run {
        let mut mgr = QosMgr::new(&args.config_file, RecordingBackend::new());
        let succeeded = run(&mut mgr, &args).await;
        for cmd in mgr.backend().commands() {
            println!("{}", cmd);
        }
        succeeded
    } else {
        let backend = ShellBackend::new(Duration::from_secs(args.command_timeout));
        let mut mgr = QosMgr::new(&args.config_file, backend);
        run(&mut mgr, &args).await
    };

    if succeeded {
        println!("success");
        ExitCode::SUCCESS
    } else {
        println!("failed");
        ExitCode::FAILURE
    }
}
