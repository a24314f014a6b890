//! Bootloader transactions.
//!
//! [`Flasher`] runs one request at a time over a [`Link`]. Each request has
//! a [`Completion`] policy that decides when its response is complete:
//! either as soon as the ack header is located, or once the device has been
//! quiet for an idle period (for replies that carry text or flash data).
//!
//! ## Example
//!
//! ```rust,no_run
//! use fpgaboot::{CancellationToken, FirmwareImage, Flasher, FlasherConfig, Version};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::from_file("app.bin", 0x0040_0000, Version::new(1, 0, 0))?;
//!
//!     let mut flasher = Flasher::open(
//!         "/dev/ttyUSB0",
//!         115200,
//!         FlasherConfig::default(),
//!         CancellationToken::new(),
//!     )?;
//!
//!     flasher.erase(image.erase_start(), image.sector_count(), &mut |_, _, _| {})?;
//!     flasher.write_image(&image, &mut |name, current, total| {
//!         println!("{name}: {current}/{total}");
//!     })?;
//!
//!     let outcome = flasher.check()?;
//!     println!("check passed: {}", outcome.passed);
//!
//!     Ok(())
//! }
//! ```

use crate::cancel::{CancellationToken, POLL_TICK};
use crate::config::FlasherConfig;
use crate::console::{ConsoleDecoder, reply_text};
use crate::error::{Error, Result};
use crate::image::FirmwareImage;
use crate::link::Link;
use crate::port::Port;
use crate::protocol::{
    Command, FrameMode, HEADER_LEN, LARGE_FRAME_LEN, PAGE_SIZE, Reassembler, SECTOR_SIZE,
    encode_request, encode_request_padded, validate_ack,
};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use std::fmt;
use std::time::{Duration, Instant};

/// Marker the bootloader prints when the image passes verification.
const CHECK_PASS_MARKER: &str = "ok";

/// Prefix of the bootloader's mode report.
const MODE_PREFIX: &str = "current: ";

/// How a pending request is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Complete once an ack header is located.
    Ack {
        /// Give up after this long.
        timeout: Duration,
    },
    /// Complete once the device stops talking.
    Quiet {
        /// Wait this long for the first byte.
        first: Duration,
        /// Then complete after this much silence.
        idle: Duration,
        /// Or as soon as this many payload bytes followed the ack.
        expect: Option<usize>,
    },
}

/// Execution context reported by INFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Mode {
    /// The bootloader holds the CPU.
    Boot,
    /// The application is running.
    App,
    /// The device reported something else, or nothing.
    Unknown,
}

impl Mode {
    /// Classify a device reply containing `current: <mode>`.
    pub fn from_reply(text: &str) -> Self {
        let Some(at) = text.rfind(MODE_PREFIX) else {
            return Self::Unknown;
        };
        let word = text[at + MODE_PREFIX.len()..]
            .split_whitespace()
            .next()
            .unwrap_or_default();
        match word {
            "boot" => Self::Boot,
            "app" => Self::App,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boot => write!(f, "boot"),
            Self::App => write!(f, "app"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Reply to INFO.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceInfo {
    /// Parsed mode.
    pub mode: Mode,
    /// Text the device printed.
    pub text: String,
}

/// Reply to CHECK.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CheckOutcome {
    /// The device reported a good image.
    pub passed: bool,
    /// Text the device printed (empty when it stayed silent).
    pub text: String,
}

/// Acknowledgement tally of a multi-frame operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationReport {
    /// Frames whose ack validated.
    pub acknowledged: usize,
    /// Frames whose ack failed validation.
    pub mismatches: usize,
}

impl OperationReport {
    fn record(&mut self, valid: bool) {
        if valid {
            self.acknowledged += 1;
        } else {
            self.mismatches += 1;
        }
    }

    fn merge(&mut self, other: Self) {
        self.acknowledged += other.acknowledged;
        self.mismatches += other.mismatches;
    }

    /// Frames sent.
    pub fn total(&self) -> usize {
        self.acknowledged + self.mismatches
    }
}

/// Client for the serial bootloader.
pub struct Flasher {
    link: Link,
    config: FlasherConfig,
    frame_mode: FrameMode,
    cancel: CancellationToken,
}

impl Flasher {
    /// Start a flasher on an open port with its own cancellation token.
    pub fn new(port: Box<dyn Port>, config: FlasherConfig) -> Result<Self> {
        Self::with_cancel(port, config, CancellationToken::new())
    }

    /// Start a flasher on an open port, stopped by `cancel`.
    ///
    /// The device is assumed to be in standard frame mode.
    pub fn with_cancel(
        port: Box<dyn Port>,
        config: FlasherConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let link = Link::spawn(port, cancel.clone())?;
        Ok(Self {
            link,
            config,
            frame_mode: FrameMode::Standard,
            cancel,
        })
    }

    /// Current timing configuration.
    pub fn config(&self) -> &FlasherConfig {
        &self.config
    }

    /// Token that cancels this flasher's operations.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Flush queued frames and stop the pumps.
    pub fn close(self) -> Result<()> {
        self.link.shutdown()
    }

    /// Erase `sectors` consecutive sectors starting at `start`.
    ///
    /// A missing ack stops the erase; an ack that fails validation is
    /// logged and counted.
    pub fn erase(
        &mut self,
        start: u32,
        sectors: u32,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<OperationReport> {
        let last = u64::from(start) + u64::from(sectors) * u64::from(SECTOR_SIZE);
        if last > u64::from(u32::MAX) + 1 {
            return Err(Error::InvalidAddress(start));
        }

        info!("Erasing {sectors} sector(s) from 0x{start:08X}");
        let mut report = OperationReport::default();
        let timeout = self.config.erase_timeout;

        for i in 0..sectors {
            let address = start + i * SECTOR_SIZE;
            let reply = self.transact(
                Command::Erase,
                address,
                SECTOR_SIZE,
                &[],
                Completion::Ack { timeout },
            )?;

            let outcome = match expect_ack(&reply, Command::Erase, address, SECTOR_SIZE, "erase") {
                Err(Error::Timeout(_)) => {
                    return Err(Error::Timeout(format!(
                        "erase of sector 0x{address:08X} ({}/{sectors}) did not acknowledge within {timeout:?}",
                        i + 1
                    )));
                },
                other => other,
            };
            report.record(tolerate_mismatch(outcome, || format!("erase 0x{address:08X}"))?);
            progress("erase", i as usize + 1, sectors as usize);

            self.cancel.sleep(self.config.erase_settle)?;
        }

        if report.mismatches > 0 {
            warn!("{} of {sectors} erase acks failed validation", report.mismatches);
        }
        Ok(report)
    }

    /// Switch the device's frame length with NEXT_SET.
    ///
    /// The request is padded to the length the device reads now, which is
    /// 272 bytes when leaving large-frame mode.
    pub fn negotiate_frame_size(&mut self, mode: FrameMode) -> Result<bool> {
        let size = mode.frame_len() as u32;
        debug!("NEXT_SET {size} (device reads {} bytes)", self.frame_mode.frame_len());

        let reply = self.transact(
            Command::NextSet,
            0,
            size,
            &[],
            Completion::Ack {
                timeout: self.config.ack_timeout,
            },
        )?;
        let valid = tolerate_mismatch(
            expect_ack(&reply, Command::NextSet, 0, size, "frame size negotiation"),
            || format!("NEXT_SET {size}"),
        )?;
        self.frame_mode = mode;
        Ok(valid)
    }

    /// Write one page. `data` is zero-padded to a full page.
    ///
    /// Returns whether the ack validated. Requires large-frame mode.
    pub fn write_page(&mut self, address: u32, data: &[u8]) -> Result<bool> {
        if data.len() > PAGE_SIZE {
            return Err(Error::Protocol(format!(
                "page data is {} bytes, limit is {PAGE_SIZE}",
                data.len()
            )));
        }
        if self.frame_mode != FrameMode::Large {
            return Err(Error::Protocol(
                "WRITE needs large-frame mode, negotiate NEXT_SET 272 first".into(),
            ));
        }

        let mut page = [0u8; PAGE_SIZE];
        page[..data.len()].copy_from_slice(data);
        let size = LARGE_FRAME_LEN as u32;

        let reply = self.transact(
            Command::Write,
            address,
            size,
            &page,
            Completion::Ack {
                timeout: self.config.ack_timeout,
            },
        )?;
        tolerate_mismatch(
            expect_ack(&reply, Command::Write, address, size, "write"),
            || format!("write 0x{address:08X}"),
        )
    }

    /// Write the image payload and its metadata page.
    ///
    /// Switches to large frames first and back to standard frames at the
    /// end, also when a write fails. Does not erase.
    pub fn write_image(
        &mut self,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<OperationReport> {
        let mut report = OperationReport::default();
        report.record(self.negotiate_frame_size(FrameMode::Large)?);

        let written = self.write_pages(image, progress);
        let reverted = self.negotiate_frame_size(FrameMode::Standard);

        match (written, reverted) {
            (Ok(pages), Ok(valid)) => {
                report.merge(pages);
                report.record(valid);
                info!(
                    "Wrote {} page(s) and metadata ({} ack mismatch(es))",
                    image.page_count(),
                    report.mismatches
                );
                Ok(report)
            },
            (Ok(_), Err(e)) => Err(e),
            (Err(e), revert) => {
                if let Err(revert_err) = revert {
                    warn!("Could not restore standard frame size: {revert_err}");
                }
                Err(e)
            },
        }
    }

    fn write_pages(
        &mut self,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<OperationReport> {
        let mut report = OperationReport::default();
        let total = image.page_count();
        info!(
            "Writing {total} page(s) to 0x{:08X}",
            image.base_address()
        );

        for (i, page) in image.pages().enumerate() {
            report.record(self.write_page(page.address, &page.data)?);
            progress("app", i + 1, total);
        }

        let metadata = image.metadata_page();
        debug!("Writing metadata page at 0x{:08X}", metadata.address);
        report.record(self.write_page(metadata.address, &metadata.data)?);
        progress("metadata", 1, 1);

        Ok(report)
    }

    /// Read `size` bytes of flash from `address`.
    pub fn read(&mut self, address: u32, size: u32) -> Result<Vec<u8>> {
        let reply = self.transact(
            Command::Read,
            address,
            size,
            &[],
            Completion::Quiet {
                first: self.config.ack_timeout,
                idle: self.config.read_idle,
                expect: Some(size as usize),
            },
        )?;
        tolerate_mismatch(
            expect_ack(&reply, Command::Read, address, size, "read"),
            || format!("read 0x{address:08X}"),
        )?;

        let mut data = reply.payload().to_vec();
        if data.len() < size as usize {
            warn!("Read returned {} of {size} bytes", data.len());
        }
        data.truncate(size as usize);
        Ok(data)
    }

    /// Ask the device which context it runs in.
    pub fn info(&mut self) -> Result<DeviceInfo> {
        let text = self.text_command(Command::Info, "info")?;
        let mode = Mode::from_reply(&text);
        debug!("Device reports mode {mode}");
        Ok(DeviceInfo { mode, text })
    }

    /// Ask the bootloader to verify the written image.
    ///
    /// A silent device counts as a failed check.
    pub fn check(&mut self) -> Result<CheckOutcome> {
        let reply = self.transact(
            Command::Check,
            0,
            0,
            &[],
            Completion::Quiet {
                first: self.config.ack_timeout,
                idle: self.config.check_idle,
                expect: None,
            },
        )?;

        if reply.header().is_none() {
            debug!("No reply to CHECK");
            return Ok(CheckOutcome {
                passed: false,
                text: reply_text(reply.noise()),
            });
        }
        tolerate_mismatch(expect_ack(&reply, Command::Check, 0, 0, "check"), || {
            "check".to_string()
        })?;

        let text = reply_text(reply.payload());
        let passed = text.contains(CHECK_PASS_MARKER);
        debug!("CHECK reply: {text:?}");
        Ok(CheckOutcome { passed, text })
    }

    /// Jump between bootloader and application. Returns the device text.
    ///
    /// The bootloader acknowledges JUMP. A running application does not: it
    /// resets into the bootloader, which only accepts SAVE_BRICK for a short
    /// while after boot. The wait is therefore bounded by `reply_idle`, and a
    /// reply without an ack is returned as plain text.
    pub fn jump(&mut self) -> Result<String> {
        let idle = self.config.reply_idle;
        let reply = self.transact(
            Command::Jump,
            0,
            0,
            &[],
            Completion::Quiet {
                first: idle,
                idle,
                expect: None,
            },
        )?;

        if reply.header().is_none() {
            let text = reply_text(reply.noise());
            debug!("JUMP not acknowledged, device printed {text:?}");
            return Ok(text);
        }
        tolerate_mismatch(expect_ack(&reply, Command::Jump, 0, 0, "jump"), || {
            Command::Jump.to_string()
        })?;
        Ok(reply_text(reply.payload()))
    }

    /// Ask the bootloader to stay in boot mode.
    ///
    /// Waits one `brick_interval` for the ack and returns whether a valid
    /// one arrived.
    pub fn save_brick(&mut self) -> Result<bool> {
        let reply = self.transact(
            Command::SaveBrick,
            0,
            0,
            &[],
            Completion::Ack {
                timeout: self.config.brick_interval,
            },
        )?;
        match expect_ack(&reply, Command::SaveBrick, 0, 0, "save brick") {
            Ok(()) => Ok(true),
            Err(Error::Timeout(_)) => Ok(false),
            Err(e) if e.is_ack_mismatch() => {
                warn!("SAVE_BRICK: {e}");
                Ok(false)
            },
            Err(e) => Err(e),
        }
    }

    /// Reset the CPU. Does not wait for a reply.
    pub fn reset(&mut self) -> Result<()> {
        info!("Resetting device...");
        self.discard_stale()?;
        let frame = self.request(Command::Reset, 0, 0, &[]);
        self.link.send(frame)?;
        self.link.flush(self.config.ack_timeout)?;
        self.frame_mode = FrameMode::Standard;
        Ok(())
    }

    /// Send ENTER_APP.
    pub fn enter_app(&mut self) -> Result<bool> {
        self.simple_command(Command::EnterApp, "enter app")
    }

    /// Send ENTER_BOOT.
    pub fn enter_boot(&mut self) -> Result<bool> {
        self.simple_command(Command::EnterBoot, "enter boot")
    }

    /// Forward device console output to `sink` until cancelled.
    pub fn listen(&mut self, sink: &mut dyn FnMut(&str)) -> Result<()> {
        info!("Listening on {} (Ctrl-C to stop)", self.link.name());
        let mut decoder = ConsoleDecoder::new();
        loop {
            match self.link.recv(POLL_TICK) {
                Ok(Some(chunk)) => {
                    let text = decoder.push(&chunk);
                    if !text.is_empty() {
                        sink(&text);
                    }
                },
                Ok(None) => {},
                Err(Error::Cancelled) => break,
                Err(e) => return Err(e),
            }
        }
        let rest = decoder.finish();
        if !rest.is_empty() {
            sink(&rest);
        }
        Ok(())
    }

    fn simple_command(&mut self, command: Command, operation: &str) -> Result<bool> {
        let reply = self.transact(
            command,
            0,
            0,
            &[],
            Completion::Ack {
                timeout: self.config.ack_timeout,
            },
        )?;
        tolerate_mismatch(expect_ack(&reply, command, 0, 0, operation), || {
            command.to_string()
        })
    }

    fn text_command(&mut self, command: Command, operation: &str) -> Result<String> {
        let reply = self.transact(
            command,
            0,
            0,
            &[],
            Completion::Quiet {
                first: self.config.ack_timeout,
                idle: self.config.reply_idle,
                expect: None,
            },
        )?;
        tolerate_mismatch(expect_ack(&reply, command, 0, 0, operation), || {
            command.to_string()
        })?;
        Ok(reply_text(reply.payload()))
    }

    /// Encode a request for the device's current frame length.
    fn request(&self, command: Command, address: u32, size: u32, payload: &[u8]) -> Vec<u8> {
        if payload.is_empty() {
            encode_request_padded(command, address, size, self.frame_mode.frame_len())
        } else {
            encode_request(command, address, size, payload)
        }
    }

    fn discard_stale(&mut self) -> Result<()> {
        let stale = self.link.drain()?;
        if !stale.is_empty() {
            debug!("Device said: {}", reply_text(&stale));
        }
        Ok(())
    }

    /// Send one request and collect its response under `completion`.
    fn transact(
        &mut self,
        command: Command,
        address: u32,
        size: u32,
        payload: &[u8],
        completion: Completion,
    ) -> Result<Reassembler> {
        self.cancel.check()?;
        self.discard_stale()?;

        let frame = self.request(command, address, size, payload);
        debug!(
            "{command} addr=0x{address:08X} size={size} ({} bytes on the wire)",
            frame.len()
        );
        self.link.send(frame)?;

        let mut reply = Reassembler::new(command);
        match completion {
            Completion::Ack { timeout } => {
                let deadline = Instant::now() + timeout;
                while reply.header().is_none() {
                    self.cancel.check()?;
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    if let Some(chunk) = self.link.recv((deadline - now).min(POLL_TICK))? {
                        reply.push(&chunk);
                    }
                }
            },
            Completion::Quiet { first, idle, expect } => {
                let mut deadline = Instant::now() + first;
                loop {
                    self.cancel.check()?;
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    if let Some(chunk) = self.link.recv((deadline - now).min(POLL_TICK))? {
                        reply.push(&chunk);
                        deadline = Instant::now() + idle;
                        if let Some(expect) = expect {
                            if reply.header().is_some() && reply.payload().len() >= expect {
                                break;
                            }
                        }
                    }
                }
            },
        }

        if !reply.noise().is_empty() && reply.header().is_some() {
            debug!("Skipped before ack: {}", reply_text(reply.noise()));
        }
        Ok(reply)
    }
}

/// Validate the located ack, or explain why none was found.
///
/// Without a located header, leading bytes that carry this command's ack
/// code are a corrupted ack. Anything else means no ack arrived.
fn expect_ack(
    reply: &Reassembler,
    command: Command,
    address: u32,
    size: u32,
    operation: &str,
) -> Result<()> {
    if let Some(header) = reply.header() {
        return validate_ack(header, command, address, size);
    }
    let bytes = reply.as_bytes();
    if bytes.len() >= HEADER_LEN && LittleEndian::read_u32(&bytes[4..8]) == command.ack_code() {
        return validate_ack(&bytes[..HEADER_LEN], command, address, size);
    }
    Err(Error::Timeout(operation.to_string()))
}

/// Turn an ack validation failure into a warning.
fn tolerate_mismatch(outcome: Result<()>, what: impl FnOnce() -> String) -> Result<bool> {
    match outcome {
        Ok(()) => Ok(true),
        Err(e) if e.is_ack_mismatch() => {
            warn!("{}: {e}", what());
            Ok(false)
        },
        Err(e) => Err(e),
    }
}

#[cfg(feature = "native")]
mod native {
    use super::{CancellationToken, Flasher, FlasherConfig};
    use crate::error::{Error, Result};
    use crate::port::{NativePort, SerialConfig};
    use log::{debug, info, warn};
    use std::time::Duration;

    const MAX_OPEN_PORT_ATTEMPTS: usize = 3;
    const OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);

    impl Flasher {
        /// Open a serial port and start a flasher on it.
        ///
        /// Opening is retried a few times, since the port may still be held
        /// by a terminal that is closing.
        pub fn open(
            port_name: &str,
            baud_rate: u32,
            config: FlasherConfig,
            cancel: CancellationToken,
        ) -> Result<Self> {
            let serial = SerialConfig::new(port_name, baud_rate).with_timeout(config.ack_timeout);
            let mut last_error = None;

            for attempt in 1..=MAX_OPEN_PORT_ATTEMPTS {
                match NativePort::open(&serial) {
                    Ok(port) => {
                        if attempt > 1 {
                            debug!("Port opened on attempt {attempt}");
                        }
                        info!("Connected to {port_name} at {baud_rate} baud");
                        return Self::with_cancel(Box::new(port), config, cancel);
                    },
                    Err(e) => {
                        warn!(
                            "Failed to open port {port_name} (attempt {attempt}/{MAX_OPEN_PORT_ATTEMPTS}): {e}"
                        );
                        last_error = Some(e);
                        if attempt < MAX_OPEN_PORT_ATTEMPTS {
                            cancel.sleep(OPEN_RETRY_DELAY)?;
                        }
                    },
                }
            }

            Err(last_error.unwrap_or(Error::Cancelled))
        }
    }
}
