//! Error types for fpgaboot.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for fpgaboot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Header field of an acknowledgement that failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckField {
    /// Command field (expected to hold the complemented request code).
    Command,
    /// Echoed flash address.
    Address,
    /// Echoed size.
    Size,
}

impl fmt::Display for AckField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command => write!(f, "command"),
            Self::Address => write!(f, "address"),
            Self::Size => write!(f, "size"),
        }
    }
}

/// Error type for fpgaboot operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The byte transport failed while the pumps were running.
    #[error("Transport error: {0}")]
    Transport(#[source] io::Error),

    /// Acknowledgement checksum did not match its header.
    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// CRC-32 computed over the received header.
        expected: u32,
        /// CRC-32 carried in the frame.
        actual: u32,
    },

    /// Acknowledgement header field did not echo the request.
    #[error("Ack {field} mismatch: expected {expected:#010x}, got {actual:#010x}")]
    FieldMismatch {
        /// Which field failed.
        field: AckField,
        /// Expected raw value.
        expected: u32,
        /// Received raw value.
        actual: u32,
    },

    /// The device did not answer in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The device could not be moved into boot mode.
    #[error("cannot reach boot mode: {0}")]
    ModeTransitionFailed(String),

    /// The bootloader rejected the written image.
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    /// Input file does not extend past the discarded header region.
    #[error("image too small: {size} bytes <= header size {header}")]
    ImageTooSmall {
        /// Input file size.
        size: usize,
        /// Size of the header region.
        header: usize,
    },

    /// Address cannot hold an application (metadata sector would underflow).
    #[error("Invalid address: {0:#010x}")]
    InvalidAddress(u32),

    /// Version string is not `major.minor.patch`.
    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// An update stage failed with a lower-level error.
    #[error("update failed while {stage}")]
    UpdateAborted {
        /// Stage that was running.
        stage: String,
        /// Underlying cause.
        #[source]
        source: Box<Error>,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error is an ack validation failure.
    ///
    /// Validation failures during erase and write are reported but do not
    /// abort the operation.
    pub fn is_ack_mismatch(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::FieldMismatch { .. }
        )
    }

    /// Whether this error, or the stage failure it wraps, is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::UpdateAborted { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}
