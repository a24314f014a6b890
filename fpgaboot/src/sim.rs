//! Simulated bootloader for tests.
//!
//! [`SimDevice`] behaves like the resident bootloader on the other end of
//! the UART: it consumes fixed-length frames (16 bytes, or 272 after
//! `NEXT_SET 272`), silently drops frames whose checksum fails, acknowledges
//! every accepted frame and then prints its console text. Flash is modelled
//! sparsely with NOR semantics (erase sets 0xFF, write can only clear bits),
//! and CHECK really verifies the descriptors in the metadata sector.
//!
//! While the application runs, only INFO is acknowledged. JUMP and RESET
//! reboot into the bootloader without an ack. After a reboot the bootloader
//! reports "app" and accepts SAVE_BRICK until the save-brick window closes,
//! after which the application is running again.

use crate::config::FlasherConfig;
use crate::error::Result;
use crate::port::Port;
use crate::protocol::crc::{crc32, crc32_digest};
use crate::protocol::{Command, Frame, HEADER_LEN, LARGE_FRAME_LEN, PAGE_SIZE, SECTOR_SIZE};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Application address the simulated bootloader accepts.
pub const SIM_APP_ADDRESS: u32 = 0x0040_0000;

/// Timings short enough for tests against the simulator.
///
/// Also routes library logs to the test harness (`RUST_LOG=debug`).
pub fn test_config() -> FlasherConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    FlasherConfig::default()
        .with_ack_timeout(Duration::from_millis(500))
        .with_erase_timeout(Duration::from_millis(300))
        .with_erase_settle(Duration::ZERO)
        .with_read_idle(Duration::from_millis(50))
        .with_reply_idle(Duration::from_millis(50))
        .with_check_idle(Duration::from_millis(80))
        .with_brick_retry(3, Duration::from_millis(50))
}

/// Mode the simulated device starts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimMode {
    App,
    Boot,
    /// INFO reports neither app nor boot.
    Unknown,
}

/// How CHECK is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckBehavior {
    /// Verify the descriptors and image in flash.
    Verify,
    /// Always report a CRC error.
    Fail,
    /// Send nothing at all.
    Silent,
}

#[derive(Debug, Clone)]
pub struct SimBehavior {
    pub start_mode: SimMode,
    pub ack_save_brick: bool,
    pub check: CheckBehavior,
    /// Requests with this command are accepted but never answered.
    pub silent_on: Option<Command>,
    /// Acks for this command echo a wrong address (valid checksum).
    pub misreport_address: Option<Command>,
    /// Acks for this command carry a broken checksum.
    pub garble_acks: Option<Command>,
    /// Largest chunk handed out per read.
    pub max_chunk: usize,
    pub app_address: u32,
    /// How long after a reboot SAVE_BRICK can still hold the bootloader.
    pub save_brick_window: Duration,
    /// The bootloader prints nothing when it starts.
    pub quiet_reboot: bool,
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            start_mode: SimMode::Boot,
            ack_save_brick: true,
            check: CheckBehavior::Verify,
            silent_on: None,
            misreport_address: None,
            garble_acks: None,
            max_chunk: usize::MAX,
            app_address: SIM_APP_ADDRESS,
            save_brick_window: Duration::from_millis(1000),
            quiet_reboot: false,
        }
    }
}

impl SimBehavior {
    pub fn in_app() -> Self {
        Self {
            start_mode: SimMode::App,
            ..Self::default()
        }
    }
}

/// A request the device accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimRequest {
    pub command: Command,
    pub address: u32,
    pub size: u32,
    /// The frame as it was consumed.
    pub raw: Vec<u8>,
}

struct SimState {
    behavior: SimBehavior,
    frame_len: usize,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
    flash: HashMap<u32, u8>,
    mode: SimMode,
    /// End of the save-brick window after the last reboot.
    booted_until: Option<Instant>,
    check_ok: bool,
    log: Vec<SimRequest>,
    disconnected: bool,
}

impl SimState {
    fn consume(&mut self) {
        while self.rx.len() >= self.frame_len {
            let frame: Vec<u8> = self.rx.drain(..self.frame_len).collect();
            self.handle(&frame);
        }
    }

    fn handle(&mut self, frame: &[u8]) {
        let Ok(Frame::Request {
            command,
            address,
            size,
            payload,
        }) = Frame::decode(frame)
        else {
            return;
        };
        self.log.push(SimRequest {
            command,
            address,
            size,
            raw: frame.to_vec(),
        });

        if self.booted_until.is_some_and(|until| Instant::now() >= until) {
            self.booted_until = None;
        }
        if self.mode == SimMode::App && self.booted_until.is_none() {
            self.handle_app(command, address, size);
            return;
        }

        let silent = self.behavior.silent_on == Some(command)
            || match command {
                Command::SaveBrick => !self.behavior.ack_save_brick,
                Command::Check => self.behavior.check == CheckBehavior::Silent,
                _ => false,
            };
        if silent {
            return;
        }
        if command == Command::Reset {
            self.reboot();
            return;
        }
        self.ack(command, address, size);

        match command {
            Command::NextSet => {
                self.frame_len = if size as usize == LARGE_FRAME_LEN {
                    LARGE_FRAME_LEN
                } else {
                    HEADER_LEN
                };
                self.print(&format!("next_len: {size}\n"));
            },
            Command::Erase => {
                let end = address.saturating_add(size);
                self.flash.retain(|a, _| !(address..end).contains(a));
                self.print(&format!("erase done: 0x{address:08x}, len: {size}\n"));
            },
            Command::Write => {
                for (i, byte) in payload.iter().take(PAGE_SIZE).enumerate() {
                    let at = address + i as u32;
                    let old = self.flash.get(&at).copied().unwrap_or(0xFF);
                    self.flash.insert(at, old & byte);
                }
                self.print(&format!("write done: 0x{address:08x}, len: {size}\n"));
            },
            Command::Read => {
                let data = self.read_flash(address, size as usize);
                self.tx.extend(data);
            },
            Command::Info => {
                let mode = match self.mode {
                    SimMode::App => "app",
                    SimMode::Boot => "boot",
                    SimMode::Unknown => "unknown",
                };
                self.print(&format!("current: {mode}\n"));
            },
            Command::SaveBrick => {
                self.mode = SimMode::Boot;
                self.booted_until = None;
                self.print("save brick get\n");
            },
            Command::Check => self.check(),
            Command::Jump => {
                if self.check_ok {
                    self.print("jump to app\n");
                    self.mode = SimMode::App;
                    self.booted_until = None;
                } else {
                    self.print("ERROR: You need check first\n");
                }
            },
            _ => {},
        }
    }

    /// The running application only knows INFO, JUMP and RESET.
    fn handle_app(&mut self, command: Command, address: u32, size: u32) {
        if self.behavior.silent_on == Some(command) {
            return;
        }
        match command {
            Command::Info => {
                self.ack(command, address, size);
                self.print("current: app\n");
            },
            Command::Jump | Command::Reset => self.reboot(),
            _ => self.print("app: unknown command\n"),
        }
    }

    /// Restart into the bootloader and open the save-brick window.
    fn reboot(&mut self) {
        self.mode = SimMode::App;
        self.check_ok = false;
        self.frame_len = HEADER_LEN;
        self.booted_until = Some(Instant::now() + self.behavior.save_brick_window);
        if !self.behavior.quiet_reboot {
            self.print("IS_APP\ncurrent: app\n");
        }
    }

    fn ack(&mut self, command: Command, address: u32, size: u32) {
        let address = if self.behavior.misreport_address == Some(command) {
            address.wrapping_add(PAGE_SIZE as u32)
        } else {
            address
        };
        let mut bytes = Frame::ack(command, address, size).encode();
        if self.behavior.garble_acks == Some(command) {
            bytes[0] ^= 0xFF;
        }
        self.tx.extend(bytes);
    }

    fn print(&mut self, text: &str) {
        self.tx.extend(text.as_bytes());
    }

    fn read_flash(&self, address: u32, len: usize) -> Vec<u8> {
        (0..len as u32)
            .map(|i| self.flash.get(&(address + i)).copied().unwrap_or(0xFF))
            .collect()
    }

    fn check(&mut self) {
        if self.behavior.check == CheckBehavior::Fail {
            self.fail_check("ERROR: app_crc: 0x00000000 != 0xFFFFFFFF\n".to_string());
            return;
        }

        let app_address = self.behavior.app_address;
        let meta = app_address - SECTOR_SIZE;
        let isr_address = meta + 32;
        let info = self.read_flash(meta, 32 + 80);
        let word = |i: usize| LittleEndian::read_u32(&info[i * 4..i * 4 + 4]);

        if word(2) != app_address {
            let text = format!("ERROR: app_info.addr: 0x{:08x} != 0x{app_address:08x}\n", word(2));
            self.fail_check(text);
            return;
        }
        if word(5) != word(1) || word(6) != isr_address || word(7) != 80 {
            let text = format!(
                "ERROR: app_isr_info: 0x{:08X}, 0x{:08X}, {}\n",
                word(5),
                word(6),
                word(7)
            );
            self.fail_check(text);
            return;
        }
        let isr_crc = crc32(&info[20..]);
        if isr_crc != word(4) {
            let text = format!("ERROR: app_isr_crc: 0x{:08X} != 0x{isr_crc:08X}\n", word(4));
            self.fail_check(text);
            return;
        }

        let mut digest = crc32_digest();
        digest.update(&info[4..16]);
        digest.update(&self.read_flash(app_address, word(3) as usize));
        let app_crc = digest.finalize();
        if app_crc != word(0) {
            let text = format!("ERROR: app_crc: 0x{:08X} != 0x{app_crc:08X}\n", word(0));
            self.fail_check(text);
            return;
        }

        self.check_ok = true;
        self.print("app_crc check ok, enter app\n");
    }

    fn fail_check(&mut self, text: String) {
        self.check_ok = false;
        self.mode = SimMode::Boot;
        self.print(&text);
    }
}

/// Handle on the simulated device, used by tests to inspect its state.
#[derive(Clone)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    pub fn new(behavior: SimBehavior) -> Self {
        let mode = behavior.start_mode;
        Self {
            state: Arc::new(Mutex::new(SimState {
                behavior,
                frame_len: HEADER_LEN,
                rx: Vec::new(),
                tx: VecDeque::new(),
                flash: HashMap::new(),
                mode,
                booted_until: None,
                check_ok: false,
                log: Vec::new(),
                disconnected: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A port connected to this device.
    pub fn port(&self) -> SimPort {
        SimPort {
            device: self.clone(),
            timeout: Duration::from_millis(100),
        }
    }

    /// Commands accepted so far, in order.
    pub fn requests(&self) -> Vec<Command> {
        self.lock().log.iter().map(|r| r.command).collect()
    }

    /// Full request log.
    pub fn request_log(&self) -> Vec<SimRequest> {
        self.lock().log.clone()
    }

    /// Contents of flash (0xFF where erased).
    pub fn flash(&self, address: u32, len: usize) -> Vec<u8> {
        self.lock().read_flash(address, len)
    }

    /// Preload flash without going through the protocol.
    pub fn load_flash(&self, address: u32, data: &[u8]) {
        let mut state = self.lock();
        for (i, byte) in data.iter().enumerate() {
            state.flash.insert(address + i as u32, *byte);
        }
    }

    pub fn mode(&self) -> SimMode {
        self.lock().mode
    }

    pub fn frame_len(&self) -> usize {
        self.lock().frame_len
    }

    /// Whether the bootloader is between reboot and the end of its
    /// save-brick window.
    pub fn in_save_brick_window(&self) -> bool {
        self.lock()
            .booted_until
            .is_some_and(|until| Instant::now() < until)
    }

    /// Make the device print unsolicited console text.
    pub fn emit(&self, text: &[u8]) {
        self.lock().tx.extend(text);
    }

    /// Make every further port operation fail.
    pub fn disconnect(&self) {
        self.lock().disconnected = true;
    }
}

/// [`Port`] end of a [`SimDevice`].
pub struct SimPort {
    device: SimDevice,
    timeout: Duration,
}

impl Read for SimPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.timeout;
        loop {
            {
                let mut state = self.device.lock();
                if state.disconnected {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device gone"));
                }
                if !state.tx.is_empty() {
                    let n = buf.len().min(state.behavior.max_chunk).min(state.tx.len());
                    for (slot, byte) in buf.iter_mut().zip(state.tx.drain(..n)) {
                        *slot = byte;
                    }
                    return Ok(n);
                }
            }
            if Instant::now() >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Write for SimPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.device.lock();
        if state.disconnected {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device gone"));
        }
        state.rx.extend_from_slice(buf);
        state.consume();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for SimPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn name(&self) -> &str {
        "sim"
    }

    fn try_clone_port(&self) -> Result<Box<dyn Port>> {
        Ok(Box::new(Self {
            device: self.device.clone(),
            timeout: self.timeout,
        }))
    }
}
