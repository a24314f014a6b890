//! # fpgaboot
//!
//! A library for updating the application firmware of an FPGA soft-core
//! system through its UART bootloader.
//!
//! This crate provides:
//!
//! - The 16-byte CRC-32 framed request/ack protocol and its commands
//! - Firmware image parsing and metadata (descriptor) generation
//! - A threaded serial link with cancellation
//! - The [`Flasher`] command engine and the [`Updater`] state machine that
//!   moves a device from its application into boot mode, erases, writes,
//!   verifies and starts the new image
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via the `serialport` crate
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use fpgaboot::{CancellationToken, FirmwareImage, FlasherConfig, Updater, Version};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::from_file(
//!         "app.bin",
//!         fpgaboot::DEFAULT_BASE_ADDRESS,
//!         Version::new(1, 0, 0),
//!     )?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let mut flasher = fpgaboot::Flasher::open(
//!             "/dev/ttyUSB0",
//!             115_200,
//!             FlasherConfig::default(),
//!             CancellationToken::new(),
//!         )?;
//!         Updater::new(&mut flasher)
//!             .with_progress(|stage, current, total| {
//!                 println!("{stage}: {current}/{total}");
//!             })
//!             .run(&image)?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod config;
pub mod console;
pub mod error;
pub mod flasher;
pub mod image;
pub mod link;
pub mod port;
pub mod protocol;
pub mod update;

#[cfg(test)]
pub(crate) mod sim;

// Native-specific re-exports
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    cancel::{CancellationToken, POLL_TICK},
    config::FlasherConfig,
    console::{ConsoleDecoder, clean_console_text},
    error::{AckField, Error, Result},
    flasher::{CheckOutcome, Completion, DeviceInfo, Flasher, Mode, OperationReport},
    image::{DEFAULT_BASE_ADDRESS, Descriptor, FirmwareImage, ImageSummary, Page, Version},
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{Command, Frame, FrameMode},
    update::{FailureReason, UpdateReport, UpdateSession, UpdateState, Updater},
};
