//! Command implementations.
//!
//! Each group of subcommands is implemented in its own module; [`Session`]
//! carries what they share.

pub(crate) mod completions;
pub(crate) mod device;
pub(crate) mod flash;
pub(crate) mod info;

use anyhow::{Context, Result};
use console::style;
use fpgaboot::{
    CancellationToken, DEFAULT_BASE_ADDRESS, FirmwareImage, Flasher, NativePortEnumerator,
    PortEnumerator, Version,
};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::info;
use std::path::Path;

use crate::config::Config;
use crate::{Cli, CliError, ImageArgs, use_fancy_output};

/// Default baud rate of the bootloader UART.
pub(crate) const DEFAULT_BAUD: u32 = 115_200;

/// Resolved options shared by all device commands.
pub(crate) struct Session {
    serial: Option<String>,
    baud: u32,
    quiet: bool,
    config: Config,
    cancel: CancellationToken,
}

impl Session {
    /// Resolve CLI arguments against the loaded configuration.
    pub(crate) fn new(cli: &Cli, config: Config, cancel: CancellationToken) -> Self {
        Self {
            serial: cli
                .serial
                .clone()
                .or_else(|| config.connection.serial.clone()),
            baud: cli
                .baud
                .or(config.connection.baud)
                .unwrap_or(DEFAULT_BAUD),
            quiet: cli.quiet,
            config,
            cancel,
        }
    }

    /// Whether non-essential output is suppressed.
    pub(crate) fn quiet(&self) -> bool {
        self.quiet
    }

    /// Print a status line to stderr unless quiet.
    pub(crate) fn status(&self, icon: &str, message: impl std::fmt::Display) {
        if !self.quiet {
            eprintln!("{} {message}", style(icon).cyan());
        }
    }

    /// Serial port to use.
    ///
    /// Without an explicit port, the only port present is used.
    fn port_name(&self) -> Result<String> {
        if let Some(serial) = &self.serial {
            return Ok(serial.clone());
        }

        let ports = NativePortEnumerator::list_ports().context("Failed to list serial ports")?;
        match ports.as_slice() {
            [only] => {
                info!("Using the only serial port present: {}", only.name);
                Ok(only.name.clone())
            },
            [] => Err(CliError::Usage(
                "no serial port found; connect the device or pass --serial".to_string(),
            )
            .into()),
            _ => Err(CliError::Usage(format!(
                "{} serial ports found; choose one with --serial or FPGABOOT_SERIAL",
                ports.len()
            ))
            .into()),
        }
    }

    /// Open the device.
    pub(crate) fn open(&self) -> Result<Flasher> {
        let port = self.port_name()?;
        self.status("🔌", format!("Using {port} at {} baud", self.baud));
        Flasher::open(
            &port,
            self.baud,
            self.config.flasher_config(),
            self.cancel.clone(),
        )
        .with_context(|| format!("Failed to open {port}"))
    }

    /// Application base address from the arguments, config or default.
    pub(crate) fn base_address(&self, addr: Option<u32>) -> u32 {
        addr.or(self.config.update.address)
            .unwrap_or(DEFAULT_BASE_ADDRESS)
    }

    /// Image version from the arguments, config or default.
    fn version(&self, version: Option<Version>) -> Result<Version> {
        if let Some(version) = version {
            return Ok(version);
        }
        match &self.config.update.version {
            Some(text) => text
                .parse()
                .with_context(|| format!("Invalid version in config: {text}")),
            None => Ok(Version::default()),
        }
    }

    /// Load an image file.
    pub(crate) fn load_image(&self, args: &ImageArgs) -> Result<FirmwareImage> {
        self.load_image_from(&args.input, args.addr, args.image_version)
    }

    pub(crate) fn load_image_from(
        &self,
        path: &Path,
        addr: Option<u32>,
        version: Option<Version>,
    ) -> Result<FirmwareImage> {
        let base = self.base_address(addr);
        let version = self.version(version)?;
        FirmwareImage::from_file(path, base, version)
            .with_context(|| format!("Failed to load firmware image {}", path.display()))
    }

    /// Progress bar on stderr, hidden when quiet or not on a terminal.
    pub(crate) fn progress_bar(&self) -> ProgressBar {
        if self.quiet || !use_fancy_output() {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(100);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(ProgressDrawTarget::stderr());
        pb
    }
}

/// Progress callback driving `pb`: one message per stage, percent within it.
pub(crate) fn progress_reporter(pb: &ProgressBar) -> impl FnMut(&str, usize, usize) + '_ {
    let mut current_stage = String::new();
    move |stage, current, total| {
        if stage != current_stage {
            current_stage = stage.to_string();
            pb.set_message(stage.to_string());
        }
        if total > 0 {
            pb.set_position((current * 100 / total) as u64);
        }
    }
}
