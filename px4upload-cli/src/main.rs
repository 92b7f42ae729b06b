//! px4upload CLI - Command-line tool for uploading firmware to PX4 boards.
//!
//! ## Features
//!
//! - Upload `.px4` firmware images through the PX4 serial bootloader
//! - Inspect firmware images (board, size, CRC32, metadata)
//! - List serial ports and which ones could be a bootloader
//! - Layered TOML configuration and environment variable support

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use px4upload::{
    EventSink, FailureKind, FirmwareImage, NativePortEnumerator, PortEnumerator, UploadEvent,
    UploadFailure, UploadOptions, UploadOutcome,
};
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

mod config;

use config::{Config, erase_ticks_for};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// px4upload - Upload firmware to PX4 flight controllers over their serial bootloader.
///
/// Environment variables:
///   PX4UPLOAD_BAUD            - Baud rate for the bootloader port (default: 115200)
///   PX4UPLOAD_PORT_PATTERN    - Name fragment a new port must contain
///   PX4UPLOAD_DETECT_TIMEOUT  - Seconds to wait for the bootloader
///   PX4UPLOAD_OPEN_ATTEMPTS   - Attempts to open the detected port
///   PX4UPLOAD_ERASE_TIMEOUT   - Seconds to wait for the erase
#[derive(Parser)]
#[command(name = "px4upload")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Example: px4upload upload px4fmu-v2_default.px4")]
struct Cli {
    /// Baud rate for the bootloader port.
    #[arg(short, long, global = true, env = "PX4UPLOAD_BAUD")]
    baud: Option<u32>,

    /// Only accept new ports whose name contains this text (empty accepts any).
    #[arg(long, global = true, env = "PX4UPLOAD_PORT_PATTERN")]
    port_pattern: Option<String>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Upload a .px4 firmware image to a board in bootloader mode.
    Upload {
        /// Path to the .px4 firmware file.
        firmware: PathBuf,

        /// Give up if no bootloader appears within this many seconds.
        #[arg(long, value_name = "SECS", env = "PX4UPLOAD_DETECT_TIMEOUT")]
        detect_timeout: Option<u64>,

        /// Attempts to open the detected port (one per second).
        #[arg(long, env = "PX4UPLOAD_OPEN_ATTEMPTS")]
        open_attempts: Option<u32>,

        /// Give up if erasing takes longer than this many seconds.
        #[arg(long, value_name = "SECS", env = "PX4UPLOAD_ERASE_TIMEOUT")]
        erase_timeout: Option<u64>,
    },

    /// Show information about a .px4 firmware file.
    Info {
        /// Path to the .px4 firmware file.
        firmware: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },
}

/// CLI-level failures with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
enum CliError {
    /// Invalid combination of arguments.
    #[error("{0}")]
    Usage(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
        }
    }
}

/// Map an error to the process exit code.
///
/// 2 usage, 4 no bootloader, 130 cancelled, 1 anything else.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(cli) = err.downcast_ref::<CliError>() {
        return cli.exit_code();
    }
    match err.downcast_ref::<px4upload::Error>() {
        Some(px4upload::Error::Cancelled) => 130,
        Some(px4upload::Error::Timeout(_) | px4upload::Error::PortOpen { .. }) => 4,
        _ => 1,
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for(&err))
        },
    }
}

fn run() -> Result<()> {
    // --- NO_COLOR and TTY detection (clig.dev best practice) ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        // Disable all color output
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "px4upload v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Upload {
            firmware,
            detect_timeout,
            open_attempts,
            erase_timeout,
        } => {
            let overrides = UploadOverrides {
                detect_timeout: *detect_timeout,
                open_attempts: *open_attempts,
                erase_timeout: *erase_timeout,
            };
            let options = build_options(&cli, &config, &overrides)?;
            cmd_upload(&cli, firmware, &options)?;
        },
        Commands::Info { firmware, json } => {
            if *json {
                cmd_info_json(firmware)?;
            } else {
                cmd_info(firmware)?;
            }
        },
        Commands::ListPorts { json } => {
            let options = build_options(&cli, &config, &UploadOverrides::default())?;
            cmd_list_ports(&options, *json)?;
        },
    }

    Ok(())
}

/// Per-command flags that override the configuration file.
#[derive(Debug, Default)]
struct UploadOverrides {
    detect_timeout: Option<u64>,
    open_attempts: Option<u32>,
    erase_timeout: Option<u64>,
}

/// Layer command-line flags over the configuration file.
fn build_options(cli: &Cli, config: &Config, overrides: &UploadOverrides) -> Result<UploadOptions> {
    let mut options = config.upload_options();

    if let Some(baud) = cli.baud {
        if baud == 0 {
            return Err(CliError::Usage("--baud must be greater than 0".into()).into());
        }
        options.serial.baud_rate = baud;
    }
    if let Some(ref pattern) = cli.port_pattern {
        options.port_filter = if pattern.is_empty() {
            px4upload::PortFilter::any()
        } else {
            px4upload::PortFilter::containing(pattern.clone())
        };
    }
    if let Some(secs) = overrides.detect_timeout {
        options.detect_timeout = Some(Duration::from_secs(secs));
    }
    if let Some(attempts) = overrides.open_attempts {
        if attempts == 0 {
            return Err(CliError::Usage("--open-attempts must be at least 1".into()).into());
        }
        options.open_attempts = attempts;
    }
    if let Some(secs) = overrides.erase_timeout {
        if secs == 0 {
            return Err(CliError::Usage("--erase-timeout must be at least 1 second".into()).into());
        }
        options.erase_timeout_ticks = erase_ticks_for(Duration::from_secs(secs), options.erase_tick);
    }

    Ok(options)
}

/// Load a firmware file, adding the path to any error.
fn load_firmware(path: &Path) -> Result<FirmwareImage> {
    FirmwareImage::from_file(path)
        .with_context(|| format!("Failed to load firmware {}", path.display()))
}

/// What the user can do about a failed upload, if anything specific.
fn failure_hint(kind: FailureKind) -> Option<&'static str> {
    match kind {
        FailureKind::CrcMismatch => Some("The written firmware did not verify. Run the upload again."),
        FailureKind::EraseTimeout => {
            Some("The board never finished erasing. Power cycle it and run the upload again.")
        },
        FailureKind::ImageTooLarge => {
            Some("The firmware does not fit this board. Check that it was built for this target.")
        },
        FailureKind::Transport | FailureKind::Timeout | FailureKind::Other => None,
    }
}

/// Renders upload notifications on the terminal.
struct ConsoleSink {
    quiet: bool,
    bar: Option<ProgressBar>,
    failure: Option<UploadFailure>,
}

impl ConsoleSink {
    fn new(quiet: bool) -> Self {
        Self {
            quiet,
            bar: None,
            failure: None,
        }
    }

    fn line(&self, text: &str) {
        if self.quiet {
            return;
        }
        match self.bar {
            Some(ref bar) if !bar.is_hidden() => bar.println(text),
            _ => eprintln!("{text}"),
        }
    }

    fn start_bar(&mut self) {
        let bar = if self.quiet || !use_fancy_output() {
            ProgressBar::hidden()
        } else {
            let bar = ProgressBar::new(0);
            #[allow(clippy::unwrap_used)] // Static template string
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
                    .unwrap()
                    .progress_chars("#>-"),
            );
            bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
            bar
        };
        self.bar = Some(bar);
    }
}

impl EventSink for ConsoleSink {
    fn emit(&mut self, event: UploadEvent) {
        match event {
            UploadEvent::ReplugRequested => {
                self.line(&format!(
                    "{} Plug in the board now (or press its reset button)",
                    style("🔌").cyan()
                ));
            },
            UploadEvent::DeviceDetected { port } => {
                self.line(&format!(
                    "{} Bootloader found on {}",
                    style("✓").green(),
                    style(port).cyan()
                ));
            },
            UploadEvent::Status(text) => {
                self.line(&format!("{} {text}", style("ℹ").blue()));
            },
            UploadEvent::FlashingStarted => self.start_bar(),
            UploadEvent::Progress { sent, total } => {
                if let Some(ref bar) = self.bar {
                    bar.set_length(total as u64);
                    bar.set_position(sent as u64);
                }
            },
            UploadEvent::Error(failure) => {
                debug!("Upload failure: {failure:?}");
                self.failure = Some(failure);
            },
            UploadEvent::Complete(outcome) => {
                if let Some(bar) = self.bar.take() {
                    match outcome {
                        UploadOutcome::Success => bar.finish_with_message("done"),
                        UploadOutcome::Failure => bar.abandon(),
                    }
                }
            },
            // Covered by the status lines
            UploadEvent::KickedOff { .. }
            | UploadEvent::DeviceInfo { .. }
            | UploadEvent::BootloaderRev(_)
            | UploadEvent::BoardId(_)
            | UploadEvent::BoardRev(_)
            | UploadEvent::FlashSize(_)
            | UploadEvent::SerialNumber(_) => {},
        }
    }
}

/// Upload command implementation.
fn cmd_upload(cli: &Cli, firmware: &Path, options: &UploadOptions) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Loading firmware {}",
            style("📦").cyan(),
            firmware.display()
        );
    }
    let image = load_firmware(firmware)?;

    if !cli.quiet {
        eprintln!(
            "{} {} (board {}, {} bytes)",
            style("ℹ").blue(),
            image.description(),
            image.board_id(),
            image.len()
        );
    }

    // Ctrl-C stops the session between notifications
    let interrupted = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&interrupted);
    if let Err(e) = ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst)) {
        debug!("Failed to install Ctrl-C handler: {e}");
    }
    let checker_flag = Arc::clone(&interrupted);
    px4upload::set_interrupt_checker(move || checker_flag.load(Ordering::SeqCst));

    let mut sink = ConsoleSink::new(cli.quiet);
    let report = px4upload::upload(image, options, &mut sink).map_err(|e| {
        let hint = sink
            .failure
            .as_ref()
            .and_then(|failure| failure_hint(failure.kind));
        if let (Some(hint), false) = (hint, cli.quiet) {
            eprintln!("{} {hint}", style("💡").yellow());
        }
        anyhow::Error::new(e).context("Upload failed")
    })?;

    if !cli.quiet {
        eprintln!(
            "\n{} Upload complete on {}",
            style("🎉").green().bold(),
            report.port
        );
        if let Some(board) = report.device.board_id {
            eprintln!("    Board ID: {board}");
        }
        if let Some(ref serial) = report.serial_number {
            eprintln!("    Serial:   {serial}");
        }
        eprintln!("    Written:  {} bytes", report.bytes_written);
    }

    Ok(())
}

/// Info command implementation.
fn cmd_info(firmware: &Path) -> Result<()> {
    eprintln!(
        "{} Loading firmware {}",
        style("📦").cyan(),
        firmware.display()
    );

    let image = load_firmware(firmware)?;
    let meta = image.metadata();

    eprintln!("\n{}", style("Firmware Information").bold().underlined());
    eprintln!("  Description: {}", image.description());
    eprintln!("  Board ID:    {}", image.board_id());
    if let Some(rev) = meta.board_revision {
        eprintln!("  Board Rev:   {rev}");
    }
    if let Some(ref summary) = meta.summary {
        eprintln!("  Summary:     {summary}");
    }
    if let Some(ref version) = meta.version {
        eprintln!("  Version:     {version}");
    }
    if let Some(ref git) = meta.git_identity {
        eprintln!("  Git:         {git}");
    }
    eprintln!("  Image size:  {} bytes", image.image_size());
    eprintln!("  Padded size: {} bytes", image.len());
    if let Some(max) = meta.image_maxsize {
        eprintln!("  Max size:    {max} bytes");
    }
    eprintln!("  CRC32:       0x{:08X}", image.crc());

    Ok(())
}

/// Info command --json output: structured JSON to stdout.
fn cmd_info_json(firmware: &Path) -> Result<()> {
    let image = load_firmware(firmware)?;
    let meta = image.metadata();

    let info = serde_json::json!({
        "description": image.description(),
        "board_id": image.board_id(),
        "board_revision": meta.board_revision,
        "summary": meta.summary,
        "version": meta.version,
        "git_identity": meta.git_identity,
        "image_size": image.image_size(),
        "padded_size": image.len(),
        "image_maxsize": meta.image_maxsize,
        "crc32": format!("0x{:08X}", image.crc()),
    });

    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

/// List ports command implementation.
fn cmd_list_ports(options: &UploadOptions, json: bool) -> Result<()> {
    let ports = NativePortEnumerator
        .list_ports()
        .context("Failed to enumerate serial ports")?;

    if json {
        let entries: Vec<serde_json::Value> = ports
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "candidate": options.port_filter.matches(&p.name),
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial_number,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    eprintln!("{}", style("Available Serial Ports").bold().underlined());

    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &ports {
        let candidate = if options.port_filter.matches(&port.name) {
            format!(" [{}]", style("bootloader candidate").yellow())
        } else {
            String::new()
        };
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{}{}{}",
            style("•").green(),
            style(&port.name).cyan(),
            candidate,
            vid_pid,
            product
        );
    }

    Ok(())
}
