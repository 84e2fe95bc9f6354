use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, EnvFilter};

use blockmon::config::Config;
use blockmon::device::DeviceDescriptor;
use blockmon::error::{ControlError, ExitStatus};
use blockmon::monitor::Monitor;
use blockmon::ui::{self, TerminalGuard};

/// Live terminal heatmap of block device activity.
#[derive(Parser)]
#[command(name = "blockmon", about)]
struct Cli {
    /// Delay between refreshes, e.g. "15ms" or "1s". A bare number is
    /// microseconds.
    #[arg(short, long, value_parser = parse_delay)]
    delay: Option<Duration>,

    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Any path on the filesystem whose block device should be monitored.
    #[arg(long)]
    device: Option<PathBuf>,

    /// Logging filter (trace, debug, info, warn, error, or an EnvFilter directive).
    #[arg(long)]
    log_level: Option<String>,

    /// Append logs to this file. Logs are discarded when unset.
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

impl Cli {
    /// Command-line flags take precedence over the config file.
    fn apply(&self, cfg: &mut Config) {
        if let Some(delay) = self.delay {
            cfg.refresh_delay = delay;
        }
        if let Some(device) = &self.device {
            cfg.device_path = device.clone();
        }
        if let Some(level) = &self.log_level {
            cfg.log_level = level.clone();
        }
        if let Some(file) = &self.log_file {
            cfg.log_file = Some(file.clone());
        }
    }
}

fn parse_delay(raw: &str) -> Result<Duration, String> {
    let delay = if raw.bytes().all(|b| b.is_ascii_digit()) {
        let micros: u64 = raw.parse().map_err(|e| format!("invalid delay {raw:?}: {e}"))?;
        Duration::from_micros(micros)
    } else {
        humantime::parse_duration(raw).map_err(|e| format!("invalid delay {raw:?}: {e}"))?
    };

    if delay.is_zero() {
        return Err("delay must be positive".to_string());
    }
    Ok(delay)
}

/// Build-time version info, injected via build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version are not failures.
            let status = if e.use_stderr() {
                ExitStatus::Startup
            } else {
                ExitStatus::Success
            };
            let _ = e.print();
            return status.into();
        }
    };

    if let Some(Command::Version) = &cli.command {
        println!("blockmon {}", version::full());
        return ExitCode::SUCCESS;
    }

    match run(&cli) {
        Ok(status) => status.into(),
        Err(e) => {
            error!(error = %format!("{e:#}"), "startup failed");
            eprintln!("blockmon: {e:#}");
            ExitStatus::Startup.into()
        }
    }
}

fn run(cli: &Cli) -> Result<ExitStatus> {
    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    cli.apply(&mut cfg);
    cfg.validate().context("invalid configuration")?;

    init_logging(&cfg)?;

    info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting blockmon",
    );

    // Safety: geteuid has no preconditions and cannot fail.
    if cfg.require_root && unsafe { libc::geteuid() } != 0 {
        bail!("requires root privileges (set require_root: false to skip this check)");
    }

    let device = DeviceDescriptor::resolve(&cfg.device_path)
        .with_context(|| format!("resolving device of {}", cfg.device_path.display()))?;
    info!(
        path = %cfg.device_path.display(),
        device = %device.id,
        block_size = device.block_size,
        blocks = device.total_blocks,
        "resolved device",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let mut monitor = Monitor::new(cfg, device)?;
    if let Err(e) = rt.block_on(monitor.start()) {
        if let Err(stop_err) = rt.block_on(monitor.stop()) {
            warn!(error = %stop_err, "cleanup after failed start");
        }
        return Err(e);
    }

    rt.spawn(watch_signals(monitor.cancel_token()));

    let status = run_ui(&monitor);

    if let Err(e) = rt.block_on(monitor.stop()) {
        error!(error = %e, "error stopping monitor");
    }

    info!("blockmon stopped");
    status
}

/// Run the control loop on this thread, containing any panic.
fn run_ui(monitor: &Monitor) -> Result<ExitStatus> {
    ui::install_panic_hook();

    let mut guard = TerminalGuard::enter().context("initializing terminal")?;
    let status = contain(|| ui::run(monitor, guard.terminal_mut()));
    drop(guard);

    Ok(status)
}

/// Run `body`, mapping its result or panic to an exit status.
fn contain<F>(body: F) -> ExitStatus
where
    F: FnOnce() -> Result<(), ControlError>,
{
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(body)) {
        Ok(Ok(())) => ExitStatus::Success,
        Ok(Err(e)) => {
            error!(error = %e, "control loop stopped");
            eprintln!("blockmon: {e}");
            e.exit_status()
        }
        Err(_) => {
            error!("control loop panicked");
            eprintln!("blockmon: internal fault, terminal restored");
            ExitStatus::Fault
        }
    }
}

fn init_logging(cfg: &Config) -> Result<()> {
    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    // The terminal belongs to the UI, so logs go to a file or nowhere.
    let writer = match &cfg.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::sink),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(writer)
        .init();

    Ok(())
}

async fn watch_signals(cancel: CancellationToken) {
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                return;
            }
        };

    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
        }
    }

    cancel.cancel();
}
