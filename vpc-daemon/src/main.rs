//! YogaVPC Daemon (yogavpcd)
//!
//! Privileged service that binds the VPC device, keeps the platform feature
//! toggles in sync with firmware and serves property requests over a Unix
//! socket.
//!
//! # Security Model
//! - **Privilege**: runs as root for acpi_call and ec_sys access
//! - **Authorization**: peer credentials decide who may drive the hardware
//! - **Audit**: every hardware request is logged with uid/pid
//! - **Isolation**: restrictive umask, no core dumps, working directory set to /
//! - **Signals**: SIGINT/SIGTERM detach the driver before exit

mod aggregator_watch;
mod server;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, error, info, warn};

use vpc_core::constants::paths;
use vpc_core::{load_settings, AcpiCallFirmware, DeviceHandle, ServiceNotifier, VpcDriver};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Security Hardening
// ============================================================================

fn set_rlimit(resource: i32, soft: u64, hard: u64) {
    let limit = libc::rlimit { rlim_cur: soft as libc::rlim_t, rlim_max: hard as libc::rlim_t };
    // SAFETY: resource is a RLIMIT_* constant and limit is fully initialized.
    unsafe {
        #[allow(clippy::useless_conversion)]
        if libc::setrlimit(resource as libc::__rlimit_resource_t, &limit) != 0 {
            warn!("Failed to set rlimit for resource {}", resource);
        }
    }
}

fn harden_process() {
    // No core dumps: EC contents and peer data stay in memory only
    set_rlimit(libc::RLIMIT_CORE as i32, 0, 0);
    set_rlimit(libc::RLIMIT_NOFILE as i32, 256, 256);

    // SAFETY: umask only sets the file creation mask.
    unsafe { libc::umask(0o077) };

    if std::env::set_current_dir("/").is_err() {
        warn!("Could not chdir to /");
    }
}

fn verify_privileges() -> Result<(), &'static str> {
    // SAFETY: geteuid and getuid have no preconditions.
    let euid = unsafe { libc::geteuid() };
    let uid = unsafe { libc::getuid() };

    if euid != 0 {
        return Err("Daemon must run as root (euid=0) for firmware access");
    }
    if uid != 0 {
        warn!("Running as setuid root - this is not recommended");
    }
    info!("Running as root (uid={}, euid={})", uid, euid);
    Ok(())
}

fn validate_socket_path(path: &str) -> Result<(), String> {
    let p = Path::new(path);

    if !p.is_absolute() {
        return Err("Socket path must be absolute".into());
    }
    if path.contains("..") {
        return Err("Socket path contains path traversal".into());
    }
    if path.contains('\0') {
        return Err("Socket path contains null byte".into());
    }

    let safe_dirs = ["/run/", "/var/run/", "/tmp/"];
    if !safe_dirs.iter().any(|d| path.starts_with(d)) {
        return Err(format!("Socket path must be under {:?}", safe_dirs));
    }

    if let Some(parent) = p.parent() {
        if !parent.exists() {
            return Err(format!("Parent directory does not exist: {:?}", parent));
        }
    }

    if p.symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(false) {
        return Err("Socket path is a symlink - refusing for security".into());
    }
    Ok(())
}

// ============================================================================
// PID File Management
// ============================================================================

fn write_pid_file(path: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    if Path::new(path).exists() {
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Ok(old_pid) = content.trim().parse::<i32>() {
                // SAFETY: signal 0 only checks that the process exists.
                if unsafe { libc::kill(old_pid, 0) } == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::AddrInUse,
                        format!("Another instance is running (PID {})", old_pid),
                    ));
                }
            }
        }
        let _ = std::fs::remove_file(path);
    }

    let mut file = std::fs::OpenOptions::new().write(true).create_new(true).mode(0o644).open(path)?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()?;

    debug!("PID file written: {}", path);
    Ok(())
}

fn cleanup(socket_path: &str) {
    for path in [socket_path, paths::PID_FILE] {
        if Path::new(path).exists() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Failed to remove {}: {}", path, e);
            }
        }
    }
    info!("Cleanup complete");
}

// ============================================================================
// CLI
// ============================================================================

struct Args {
    config: PathBuf,
    socket: Option<String>,
}

enum Parsed {
    Run(Args),
    Exit,
}

fn print_help() {
    eprintln!("yogavpcd {} - YogaVPC platform feature daemon", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    yogavpcd [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -c, --config PATH   Settings file (default {})", paths::CONFIG_FILE);
    eprintln!("    -s, --socket PATH   Control socket (overrides settings)");
    eprintln!("    -v, --version       Print version");
    eprintln!("    -h, --help          Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    YOGAVPC_LOG         Log filter (trace, debug, info, warn, error)");
}

fn parse_args() -> anyhow::Result<Parsed> {
    let mut args = std::env::args().skip(1);
    let mut parsed = Args { config: vpc_core::get_settings_path(), socket: None };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(Parsed::Exit);
            }
            "-v" | "--version" => {
                println!("yogavpcd {}", VERSION);
                return Ok(Parsed::Exit);
            }
            "-c" | "--config" => {
                parsed.config = args.next().map(PathBuf::from).context("--config requires a path argument")?;
            }
            "-s" | "--socket" => {
                parsed.socket = Some(args.next().context("--socket requires a path argument")?);
            }
            other => {
                print_help();
                anyhow::bail!("Unknown argument: {}", other);
            }
        }
    }
    Ok(Parsed::Run(parsed))
}

/// journald when it is listening, stdout otherwise
fn init_logging() -> bool {
    use tracing_subscriber::prelude::*;

    let log_level = std::env::var("YOGAVPC_LOG").unwrap_or_else(|_| "info".to_string());

    if Path::new(paths::JOURNALD_SOCKET).exists() {
        match tracing_journald::layer() {
            Ok(layer) => {
                tracing_subscriber::registry()
                    .with(layer)
                    .with(tracing_subscriber::EnvFilter::new(&log_level))
                    .init();
                return true;
            }
            Err(e) => eprintln!("Failed to create journald layer: {}, falling back to stdout", e),
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(&log_level)
        .init();
    false
}

/// Resolves on SIGINT or SIGTERM
fn shutdown_signal() -> impl Future<Output = ()> {
    async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("SIGNAL: SIGINT"),
                    _ = term.recv() => info!("SIGNAL: SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("SIGNAL: SIGINT");
            }
        }
    }
}

/// Teardown always runs; the full detach follows once the driver is unshared
async fn detach(driver: Arc<VpcDriver>) {
    if let Err(e) = driver.teardown().await {
        warn!("Teardown finished with error: {}", e);
    }
    match Arc::try_unwrap(driver) {
        Ok(owned) => {
            if let Err(e) = owned.detach().await {
                warn!("Detach finished with error: {}", e);
            }
        }
        Err(_) => warn!("Driver still shared after teardown, stopping its tasks on drop"),
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };
        eprintln!("PANIC at {}: {}", location, message);
    }));

    harden_process();

    let args = match parse_args()? {
        Parsed::Run(args) => args,
        Parsed::Exit => return Ok(()),
    };

    let journald = init_logging();
    info!("STARTUP: yogavpcd {} starting", VERSION);
    info!("STARTUP: Logging to {}", if journald { "systemd journal" } else { "stdout" });

    if let Err(e) = verify_privileges() {
        error!("{}", e);
        anyhow::bail!(e);
    }

    let settings = load_settings(&args.config)
        .with_context(|| format!("loading settings from {}", args.config.display()))?;
    let socket_path = args
        .socket
        .unwrap_or_else(|| settings.socket_path.to_string_lossy().into_owned());

    validate_socket_path(&socket_path).map_err(|e| anyhow::anyhow!("Invalid socket path: {}", e))?;
    write_pid_file(paths::PID_FILE).context("writing PID file")?;

    let firmware = AcpiCallFirmware::new(&settings.acpi_call_path, Some(settings.ec_io_path.clone()));
    if !firmware.is_available() {
        warn!(
            "{} not present - is the acpi_call module loaded?",
            settings.acpi_call_path.display()
        );
    }

    let profile = settings.platform.profile();
    let device = DeviceHandle::new(settings.device(), Arc::new(firmware));
    let notifier = ServiceNotifier::new();

    let driver = match VpcDriver::attach(device, profile, settings.gate_options(), &notifier).await {
        Ok(driver) => Arc::new(driver),
        Err(e) => {
            cleanup(&socket_path);
            return Err(e).context("attaching VPC device");
        }
    };
    info!("STARTUP: {} profile attached to {}", profile.name(), settings.device());

    let watcher = settings.aggregator_socket.clone().map(|path| {
        tokio::spawn(aggregator_watch::watch(path, settings.aggregator_poll(), notifier.clone()))
    });

    let result = server::run_server(&socket_path, Arc::clone(&driver), shutdown_signal()).await;

    if let Some(watcher) = watcher {
        watcher.abort();
    }
    detach(driver).await;
    cleanup(&socket_path);

    if let Err(e) = &result {
        error!("Server error: {}", e);
    }
    result
}
