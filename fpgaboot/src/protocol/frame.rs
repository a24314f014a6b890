//! Bootloader frame codec.
//!
//! ## Frame Format
//!
//! ```text
//! +----------+----------+----------+----------+-------------------+
//! |  CRC32   | Command  | Address  |   Size   |  Payload (opt.)   |
//! +----------+----------+----------+----------+-------------------+
//! | 4 bytes  | 4 bytes  | 4 bytes  | 4 bytes  |     variable      |
//! +----------+----------+----------+----------+-------------------+
//! ```
//!
//! All fields are little-endian. A request carries the command code and its
//! CRC covers every byte after the checksum. An acknowledgement carries the
//! bitwise complement of the command it answers, echoes address and size,
//! and its CRC covers the 12 header bytes only; any reply text follows the
//! header unprotected.

use crate::error::{AckField, Error, Result};
use crate::protocol::command::Command;
use crate::protocol::crc::crc32;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

/// Length of the header including its checksum.
pub const HEADER_LEN: usize = 16;

/// Flash page size (one WRITE payload).
pub const PAGE_SIZE: usize = 256;

/// Length of a WRITE frame, and of every frame while the device is in
/// large-frame mode.
pub const LARGE_FRAME_LEN: usize = HEADER_LEN + PAGE_SIZE;

/// Erasable flash sector size.
pub const SECTOR_SIZE: u32 = 0x10000;

/// Frame length the bootloader reads.
///
/// The device consumes fixed-size chunks and only changes the size when it
/// accepts a NEXT_SET request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FrameMode {
    /// 16-byte command frames (power-on default).
    #[default]
    Standard,
    /// 272-byte frames carrying one page each.
    Large,
}

impl FrameMode {
    /// Number of bytes per frame.
    pub fn frame_len(self) -> usize {
        match self {
            Self::Standard => HEADER_LEN,
            Self::Large => LARGE_FRAME_LEN,
        }
    }

    /// Mode selected by a NEXT_SET size, if the device recognises it.
    pub fn from_size(size: u32) -> Option<Self> {
        match size as usize {
            HEADER_LEN => Some(Self::Standard),
            LARGE_FRAME_LEN => Some(Self::Large),
            _ => None,
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Host to device request.
    Request {
        /// Requested command.
        command: Command,
        /// Target flash address, or 0.
        address: u32,
        /// Payload length or declared frame size.
        size: u32,
        /// Page data or padding.
        payload: Vec<u8>,
    },
    /// Device acknowledgement of a request.
    Ack {
        /// Command being acknowledged.
        command: Command,
        /// Echoed address.
        address: u32,
        /// Echoed size.
        size: u32,
        /// Reply text or data following the header.
        payload: Vec<u8>,
    },
}

impl Frame {
    /// Create a request without payload.
    pub fn request(command: Command, address: u32, size: u32) -> Self {
        Self::Request {
            command,
            address,
            size,
            payload: Vec::new(),
        }
    }

    /// Create a request carrying a payload.
    pub fn request_with_payload(
        command: Command,
        address: u32,
        size: u32,
        payload: Vec<u8>,
    ) -> Self {
        Self::Request {
            command,
            address,
            size,
            payload,
        }
    }

    /// Create an acknowledgement echoing the given request fields.
    pub fn ack(command: Command, address: u32, size: u32) -> Self {
        Self::Ack {
            command,
            address,
            size,
            payload: Vec::new(),
        }
    }

    /// Command carried by the frame.
    pub fn command(&self) -> Command {
        match self {
            Self::Request { command, .. } | Self::Ack { command, .. } => *command,
        }
    }

    /// Address field.
    pub fn address(&self) -> u32 {
        match self {
            Self::Request { address, .. } | Self::Ack { address, .. } => *address,
        }
    }

    /// Size field.
    pub fn size(&self) -> u32 {
        match self {
            Self::Request { size, .. } | Self::Ack { size, .. } => *size,
        }
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Request { payload, .. } | Self::Ack { payload, .. } => payload,
        }
    }

    /// Raw command field as it appears on the wire.
    fn command_field(&self) -> u32 {
        match self {
            Self::Request { command, .. } => command.code(),
            Self::Ack { command, .. } => command.ack_code(),
        }
    }

    /// Serialize the frame.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());

        buf.write_u32::<LittleEndian>(0).unwrap();
        buf.write_u32::<LittleEndian>(self.command_field()).unwrap();
        buf.write_u32::<LittleEndian>(self.address()).unwrap();
        buf.write_u32::<LittleEndian>(self.size()).unwrap();
        buf.extend_from_slice(payload);

        let crc = match self {
            Self::Request { .. } => crc32(&buf[4..]),
            Self::Ack { .. } => crc32(&buf[4..HEADER_LEN]),
        };
        LittleEndian::write_u32(&mut buf[..4], crc);

        buf
    }

    /// Serialize the frame, zero-padding after the payload so the frame is
    /// exactly `frame_len` bytes long.
    ///
    /// Frames already at least `frame_len` long are encoded unchanged.
    pub fn encode_padded(&self, frame_len: usize) -> Vec<u8> {
        let mut frame = self.clone();
        let (Self::Request { payload, .. } | Self::Ack { payload, .. }) = &mut frame;
        if HEADER_LEN + payload.len() < frame_len {
            payload.resize(frame_len - HEADER_LEN, 0);
        }
        frame.encode()
    }

    /// Parse a frame from raw bytes.
    ///
    /// The checksum is verified with the rule matching the variant: header
    /// only for acknowledgements, whole frame for requests.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = split_header(bytes)?;
        let raw_command = LittleEndian::read_u32(&header[4..8]);
        let address = LittleEndian::read_u32(&header[8..12]);
        let size = LittleEndian::read_u32(&header[12..16]);
        let payload = bytes[HEADER_LEN..].to_vec();
        let carried = LittleEndian::read_u32(&header[..4]);

        if let Some(command) = Command::from_ack_code(raw_command) {
            check_crc(crc32(&header[4..]), carried)?;
            return Ok(Self::Ack {
                command,
                address,
                size,
                payload,
            });
        }

        let command = Command::try_from(raw_command)?;
        check_crc(crc32(&bytes[4..]), carried)?;
        Ok(Self::Request {
            command,
            address,
            size,
            payload,
        })
    }
}

/// Encode a request header with an optional payload.
pub fn encode_request(command: Command, address: u32, size: u32, payload: &[u8]) -> Vec<u8> {
    Frame::request_with_payload(command, address, size, payload.to_vec()).encode()
}

/// Encode a payload-less request zero-padded to `frame_len` bytes.
///
/// This is the form a device in large-frame mode expects: it reads fixed
/// 272-byte chunks and checks the CRC over all of them.
pub fn encode_request_padded(
    command: Command,
    address: u32,
    size: u32,
    frame_len: usize,
) -> Vec<u8> {
    Frame::request(command, address, size).encode_padded(frame_len)
}

/// Validate an acknowledgement header against the request it answers.
///
/// Checks run in order (checksum, command, address, size) and the first
/// failure is returned with its classification.
pub fn validate_ack(bytes: &[u8], command: Command, address: u32, size: u32) -> Result<()> {
    let header = split_header(bytes)?;

    let carried = LittleEndian::read_u32(&header[..4]);
    check_crc(crc32(&header[4..]), carried)?;

    let checks = [
        (AckField::Command, command.ack_code(), LittleEndian::read_u32(&header[4..8])),
        (AckField::Address, address, LittleEndian::read_u32(&header[8..12])),
        (AckField::Size, size, LittleEndian::read_u32(&header[12..16])),
    ];
    for (field, expected, actual) in checks {
        if expected != actual {
            return Err(Error::FieldMismatch {
                field,
                expected,
                actual,
            });
        }
    }

    Ok(())
}

fn split_header(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::Protocol(format!(
            "frame too short: {} bytes, need {HEADER_LEN}",
            bytes.len()
        )));
    }
    Ok(&bytes[..HEADER_LEN])
}

fn check_crc(expected: u32, actual: u32) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::ChecksumMismatch { expected, actual })
    }
}
