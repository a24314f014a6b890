//! CRC-32 used by the bootloader for frame checksums and image descriptors.
//!
//! The bootloader uses the reflected IEEE polynomial with the zlib
//! conventions (`CRC_32_ISO_HDLC`).

use crc::{CRC_32_ISO_HDLC, Crc, Digest};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Calculate the CRC-32 of a byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Start an incremental CRC-32 computation.
pub fn crc32_digest() -> Digest<'static, u32> {
    CRC32.digest()
}
