//! Bootloader command codes.

use crate::error::{Error, Result};
use std::fmt;

/// Bootloader commands.
///
/// Numeric values are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    /// Placeholder state, never requested by the host.
    Unknown = 0,
    /// Verify the image described by the metadata sector.
    Check = 1,
    /// Idle state.
    Ready = 2,
    /// Ask the device to hold in boot mode (back up before erase).
    SaveBrick = 3,
    /// Reset the CPU.
    Reset = 4,
    /// Enter boot context.
    EnterBoot = 5,
    /// Enter application context.
    EnterApp = 6,
    /// Set the size of the next frames the device reads.
    NextSet = 7,
    /// Erase a flash sector.
    Erase = 8,
    /// Write a flash page.
    Write = 9,
    /// Read flash back.
    Read = 10,
    /// Jump between boot and application.
    Jump = 11,
    /// Report the current execution context.
    Info = 12,
}

impl Command {
    /// All commands in wire order.
    pub const ALL: [Self; 13] = [
        Self::Unknown,
        Self::Check,
        Self::Ready,
        Self::SaveBrick,
        Self::Reset,
        Self::EnterBoot,
        Self::EnterApp,
        Self::NextSet,
        Self::Erase,
        Self::Write,
        Self::Read,
        Self::Jump,
        Self::Info,
    ];

    /// Wire value of a request.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Wire value carried by an acknowledgement of this command.
    pub fn ack_code(self) -> u32 {
        !self.code()
    }

    /// Decode an acknowledgement command field.
    pub fn from_ack_code(value: u32) -> Option<Self> {
        Self::try_from(!value).ok()
    }
}

impl TryFrom<u32> for Command {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or_else(|| Error::Protocol(format!("unknown command code {value:#010x}")))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "UNKNOWN",
            Self::Check => "CHECK",
            Self::Ready => "READY",
            Self::SaveBrick => "SAVE_BRICK",
            Self::Reset => "RESET",
            Self::EnterBoot => "ENTER_BOOT",
            Self::EnterApp => "ENTER_APP",
            Self::NextSet => "NEXT_SET",
            Self::Erase => "ERASE",
            Self::Write => "WRITE",
            Self::Read => "READ",
            Self::Jump => "JUMP",
            Self::Info => "INFO",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values() {
        assert_eq!(Command::Unknown.code(), 0);
        assert_eq!(Command::Check.code(), 1);
        assert_eq!(Command::SaveBrick.code(), 3);
        assert_eq!(Command::NextSet.code(), 7);
        assert_eq!(Command::Erase.code(), 8);
        assert_eq!(Command::Write.code(), 9);
        assert_eq!(Command::Read.code(), 10);
        assert_eq!(Command::Jump.code(), 11);
        assert_eq!(Command::Info.code(), 12);
    }

    #[test]
    fn test_all_is_in_wire_order() {
        for (i, cmd) in Command::ALL.iter().enumerate() {
            assert_eq!(cmd.code() as usize, i);
            assert_eq!(Command::try_from(i as u32).unwrap(), *cmd);
        }
    }

    #[test]
    fn test_ack_code_is_complement() {
        assert_eq!(Command::Erase.ack_code(), 0xFFFF_FFFF - 8);
        assert_eq!(Command::from_ack_code(0xFFFF_FFF7), Some(Command::Erase));
        assert_eq!(Command::from_ack_code(8), None);
    }

    #[test]
    fn test_unknown_code_rejected() {
        assert!(Command::try_from(13).is_err());
        assert!(Command::try_from(0xFFFF_FFFF).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Command::SaveBrick.to_string(), "SAVE_BRICK");
        assert_eq!(Command::NextSet.to_string(), "NEXT_SET");
    }
}
