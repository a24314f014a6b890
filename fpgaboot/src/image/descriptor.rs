//! Image descriptors stored in the metadata sector.
//!
//! ```text
//! +----------+----------+----------------+----------+
//! |  CRC32   | Version  | Target address |  Length  |
//! +----------+----------+----------------+----------+
//! | 4 bytes  | 4 bytes  |    4 bytes     | 4 bytes  |
//! +----------+----------+----------------+----------+
//! ```
//!
//! The CRC covers version, target address and length followed by the
//! `length` bytes of data the descriptor refers to.

use crate::error::{Error, Result};
use crate::protocol::crc::crc32_digest;
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use std::str::FromStr;

/// Size of an encoded descriptor.
pub const DESCRIPTOR_LEN: usize = 16;

/// Firmware version, packed as `major << 24 | minor << 16 | patch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Version {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Patch level.
    pub patch: u16,
}

impl Version {
    /// Create a version.
    pub const fn new(major: u8, minor: u8, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Packed wire value.
    pub fn as_u32(self) -> u32 {
        (u32::from(self.major) << 24) | (u32::from(self.minor) << 16) | u32::from(self.patch)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidVersion(format!("{s:?} (expected major.minor.patch)"));

        let mut parts = s.trim().split('.');
        let (Some(major), Some(minor), Some(patch), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
            patch: patch.parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Descriptor of a region the bootloader verifies before jumping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Descriptor {
    /// CRC-32 over the remaining fields and the data.
    pub crc32: u32,
    /// Packed firmware version.
    pub version: u32,
    /// Flash address of the data.
    pub target_address: u32,
    /// Data length in bytes.
    pub length: u32,
}

impl Descriptor {
    /// Build the descriptor for `data` stored at `target_address`.
    pub fn new(version: Version, target_address: u32, data: &[u8]) -> Self {
        let version = version.as_u32();
        let length = data.len() as u32;
        Self {
            crc32: checksum(version, target_address, length, data),
            version,
            target_address,
            length,
        }
    }

    /// Serialize to the 16-byte layout.
    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_LEN] {
        let mut buf = [0u8; DESCRIPTOR_LEN];
        LittleEndian::write_u32_into(
            &[self.crc32, self.version, self.target_address, self.length],
            &mut buf,
        );
        buf
    }
}

fn checksum(version: u32, target_address: u32, length: u32, data: &[u8]) -> u32 {
    let mut fields = [0u8; 12];
    LittleEndian::write_u32_into(&[version, target_address, length], &mut fields);

    let mut digest = crc32_digest();
    digest.update(&fields);
    digest.update(data);
    digest.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_packing() {
        let v: Version = "1.2.3".parse().unwrap();
        assert_eq!(v, Version::new(1, 2, 3));
        assert_eq!(v.as_u32(), 0x0102_0003);
        assert_eq!(v.to_string(), "1.2.3");
    }

    #[test]
    fn test_version_limits() {
        let v: Version = "255.255.65535".parse().unwrap();
        assert_eq!(v.as_u32(), 0xFFFF_FFFF);
        assert!("256.0.0".parse::<Version>().is_err());
        assert!("0.256.0".parse::<Version>().is_err());
        assert!("0.0.65536".parse::<Version>().is_err());
    }

    #[test]
    fn test_version_rejects_malformed() {
        for bad in ["", "1", "1.2", "1.2.3.4", "a.b.c", "1..3", "-1.0.0"] {
            let err = bad.parse::<Version>().unwrap_err();
            assert!(matches!(err, Error::InvalidVersion(_)), "{bad}");
        }
    }

    #[test]
    fn test_descriptor_layout() {
        let d = Descriptor::new(Version::new(0, 0, 1), 0x0040_0000, b"abc");
        let bytes = d.to_bytes();
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &0x0040_0000u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &3u32.to_le_bytes());

        let mut covered = bytes[4..16].to_vec();
        covered.extend_from_slice(b"abc");
        assert_eq!(d.crc32, crate::protocol::crc::crc32(&covered));
    }

    #[test]
    fn test_descriptor_crc_tracks_data() {
        let v = Version::new(1, 0, 0);
        let d = Descriptor::new(v, 0x1000, b"payload");
        assert_ne!(d.crc32, Descriptor::new(v, 0x1000, b"paylaod").crc32);
        assert_ne!(d.crc32, Descriptor::new(v, 0x2000, b"payload").crc32);
        assert_eq!(Descriptor::new(v, 0x1000, b"payload!").length, 8);
    }
}
