//! fpgaboot CLI - Command-line tool for updating FPGA soft-core firmware.
//!
//! ## Features
//!
//! - Full update: move the device into boot mode, erase, write, verify, start
//! - Individual bootloader commands (erase, write, read, check, jump, ...)
//! - Firmware image inspection
//! - Device console listening
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use fpgaboot::{CancellationToken, Version};
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;

use commands::Session;
use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Errors that map to a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid combination of arguments.
    #[error("{0}")]
    Usage(String),
}

/// fpgaboot - Update FPGA soft-core firmware through the UART bootloader.
///
/// Environment variables:
///   FPGABOOT_SERIAL   - Default serial port
///   FPGABOOT_BAUD     - Default baud rate (default: 115200)
#[derive(Parser)]
#[command(name = "fpgaboot")]
#[command(author, version, about, long_about = None)]
pub(crate) struct Cli {
    /// Serial port to use (auto-selected when only one is present).
    #[arg(short, long, global = true, env = "FPGABOOT_SERIAL")]
    serial: Option<String>,

    /// Baud rate [default: 115200].
    #[arg(short, long, global = true, env = "FPGABOOT_BAUD")]
    baud: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
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

/// Firmware image options.
#[derive(Args, Debug, Clone)]
pub(crate) struct ImageArgs {
    /// Raw application binary (header region followed by the payload).
    #[arg(short, long)]
    input: PathBuf,

    /// Application base address [default: 0x00400000].
    #[arg(short, long, value_parser = parse_number)]
    addr: Option<u32>,

    /// Version written into the descriptors (major.minor.patch).
    #[arg(long = "version", value_name = "VERSION")]
    image_version: Option<Version>,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Print the device console until Ctrl-C.
    Listen,

    /// Ask the bootloader to stay in boot mode.
    SaveBrick,

    /// Reset the device.
    Reset,

    /// Move a running application into the bootloader.
    EnterBoot,

    /// Send ENTER_APP.
    EnterApp,

    /// Negotiate the device frame size.
    Next {
        /// Frame size (272 for page writes, 16 for standard frames).
        #[arg(long, default_value = "272", value_parser = parse_number)]
        size: u32,
    },

    /// Erase flash sectors.
    Erase {
        /// First sector address (the base address when --input is given).
        #[arg(short, long, value_parser = parse_number)]
        addr: Option<u32>,

        /// Bytes to erase, rounded up to whole sectors.
        #[arg(long, value_parser = parse_number)]
        size: Option<u32>,

        /// Derive the sectors from this image, including its metadata sector.
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Erase, then write an image and its metadata.
    Write {
        #[command(flatten)]
        image: ImageArgs,
    },

    /// Write an image and its metadata without erasing.
    WriteOnly {
        #[command(flatten)]
        image: ImageArgs,
    },

    /// Read flash to a file.
    Read {
        /// Start address.
        #[arg(short, long, value_parser = parse_number)]
        addr: u32,

        /// Bytes to read.
        #[arg(long, value_parser = parse_number)]
        size: u32,

        /// Output file.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Ask the bootloader to verify the written image.
    Check,

    /// Jump between bootloader and application.
    Jump,

    /// Show the device mode, or summarize an image with --input.
    Info {
        /// Image to summarize instead of querying the device.
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Application base address used for the summary.
        #[arg(short, long, value_parser = parse_number)]
        addr: Option<u32>,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Run a complete firmware update.
    Update {
        #[command(flatten)]
        image: ImageArgs,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

/// Parse a decimal or `0x` hexadecimal number (underscores allowed).
fn parse_number(s: &str) -> Result<u32, String> {
    let s: String = s.trim().chars().filter(|c| *c != '_').collect();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("Invalid number '{s}': {e}"))
}

/// Exit code for a failed command.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(CliError::Usage(_)) = err.downcast_ref::<CliError>() {
        return 2;
    }
    let cancelled = err
        .chain()
        .any(|cause| {
            cause
                .downcast_ref::<fpgaboot::Error>()
                .is_some_and(fpgaboot::Error::is_cancelled)
        });
    if cancelled { 130 } else { 1 }
}

fn main() -> ExitCode {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
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
        "fpgaboot v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        debug!("Could not install Ctrl-C handler: {e}");
    }

    let session = Session::new(cli, config, cancel);

    match &cli.command {
        Commands::Listen => commands::device::cmd_listen(&session),
        Commands::SaveBrick => commands::device::cmd_save_brick(&session),
        Commands::Reset => commands::device::cmd_reset(&session),
        Commands::EnterBoot => commands::device::cmd_enter_boot(&session),
        Commands::EnterApp => commands::device::cmd_enter_app(&session),
        Commands::Next { size } => commands::device::cmd_next(&session, *size),
        Commands::Check => commands::device::cmd_check(&session),
        Commands::Jump => commands::device::cmd_jump(&session),
        Commands::Erase { addr, size, input } => {
            commands::flash::cmd_erase(&session, *addr, *size, input.as_deref())
        },
        Commands::Write { image } => commands::flash::cmd_write(&session, image, true),
        Commands::WriteOnly { image } => commands::flash::cmd_write(&session, image, false),
        Commands::Read { addr, size, output } => {
            commands::flash::cmd_read(&session, *addr, *size, output)
        },
        Commands::Update { image } => commands::flash::cmd_update(&session, image),
        Commands::Info {
            input: Some(input),
            addr,
            json,
        } => commands::info::cmd_image_info(&session, input, *addr, *json),
        Commands::Info {
            input: None, json, ..
        } => commands::device::cmd_info(&session, *json),
        Commands::ListPorts { json } => commands::info::cmd_list_ports(*json),
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g.: fpgaboot completions bash".to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}
