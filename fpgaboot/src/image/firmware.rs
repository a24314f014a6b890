//! Application firmware image.
//!
//! The input is the raw binary of the soft-core application as produced by
//! the toolchain:
//!
//! ```text
//! 0x00000 +-----------------------+
//!         | vectors (0x50 bytes)  |
//!         | ... unused ...        |
//! 0x10000 +-----------------------+
//!         | application payload   |
//!         |         ...           |
//!         +-----------------------+
//! ```
//!
//! The payload is written page by page at the base address. The sector
//! below the base address holds the metadata page:
//!
//! ```text
//! base - 0x10000 +---------------------------+
//!                | app descriptor    (16 B)  |
//!                | vector descriptor (16 B)  |
//!                | vectors           (80 B)  |
//!                | zero padding to 256 B     |
//!                +---------------------------+
//! ```

use crate::error::{Error, Result};
use crate::image::descriptor::{DESCRIPTOR_LEN, Descriptor, Version};
use crate::protocol::{PAGE_SIZE, SECTOR_SIZE};
use log::debug;
use std::fs;
use std::path::Path;

/// Bytes at the start of the input file that precede the payload.
pub const HEADER_REGION_LEN: usize = 0x10000;

/// Size of the interrupt vector block at the start of the header region.
pub const VECTOR_LEN: usize = 0x50;

/// Default flash address of the application payload.
pub const DEFAULT_BASE_ADDRESS: u32 = 0x0040_0000;

/// Offset of the vectors inside the metadata page.
const VECTOR_OFFSET: u32 = 2 * DESCRIPTOR_LEN as u32;

/// One flash page of payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Flash address of the page.
    pub address: u32,
    /// Page contents, zero-padded.
    pub data: [u8; PAGE_SIZE],
}

/// Summary of an image, as shown by `info --input`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ImageSummary {
    /// Input file size.
    pub file_size: usize,
    /// Payload size.
    pub payload_size: usize,
    /// Payload flash address.
    pub base_address: u32,
    /// First sector erased before writing.
    pub erase_start: u32,
    /// Sectors erased before writing.
    pub sectors: u32,
    /// Payload pages written.
    pub pages: usize,
    /// Image version.
    pub version: Version,
    /// Descriptor of the payload.
    pub app_descriptor: Descriptor,
    /// Descriptor of the vectors.
    pub vector_descriptor: Descriptor,
}

/// A firmware image ready to be written.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    vectors: [u8; VECTOR_LEN],
    payload: Vec<u8>,
    file_size: usize,
    base_address: u32,
    version: Version,
}

impl FirmwareImage {
    /// Load an image from a file.
    pub fn from_file<P: AsRef<Path>>(path: P, base_address: u32, version: Version) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading image from: {}", path.display());
        let bytes = fs::read(path)?;
        Self::parse(&bytes, base_address, version)
    }

    /// Split a raw binary into vectors and payload.
    pub fn parse(bytes: &[u8], base_address: u32, version: Version) -> Result<Self> {
        if bytes.len() <= HEADER_REGION_LEN {
            return Err(Error::ImageTooSmall {
                size: bytes.len(),
                header: HEADER_REGION_LEN,
            });
        }
        if base_address < SECTOR_SIZE {
            return Err(Error::InvalidAddress(base_address));
        }

        let payload = bytes[HEADER_REGION_LEN..].to_vec();
        if payload.len() > u32::MAX as usize
            || base_address.checked_add(payload.len() as u32).is_none()
        {
            return Err(Error::InvalidAddress(base_address));
        }

        let mut vectors = [0u8; VECTOR_LEN];
        vectors.copy_from_slice(&bytes[..VECTOR_LEN]);

        debug!(
            "Image: {} bytes payload for 0x{base_address:08X}, version {version}",
            payload.len()
        );

        Ok(Self {
            vectors,
            payload,
            file_size: bytes.len(),
            base_address,
            version,
        })
    }

    /// Application payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Interrupt vector block.
    pub fn vectors(&self) -> &[u8; VECTOR_LEN] {
        &self.vectors
    }

    /// Flash address of the payload.
    pub fn base_address(&self) -> u32 {
        self.base_address
    }

    /// Image version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Number of payload pages.
    pub fn page_count(&self) -> usize {
        self.payload.len().div_ceil(PAGE_SIZE)
    }

    /// Payload pages in address order, the last one zero-padded.
    pub fn pages(&self) -> impl Iterator<Item = Page> + '_ {
        self.payload
            .chunks(PAGE_SIZE)
            .enumerate()
            .map(|(i, chunk)| {
                let mut data = [0u8; PAGE_SIZE];
                data[..chunk.len()].copy_from_slice(chunk);
                Page {
                    address: self.base_address + (i * PAGE_SIZE) as u32,
                    data,
                }
            })
    }

    /// Address of the metadata page (and first sector to erase).
    pub fn metadata_address(&self) -> u32 {
        self.base_address - SECTOR_SIZE
    }

    /// First sector erased before writing.
    pub fn erase_start(&self) -> u32 {
        self.metadata_address()
    }

    /// Sectors covering the payload plus the metadata sector.
    pub fn sector_count(&self) -> u32 {
        (self.payload.len() as u32).div_ceil(SECTOR_SIZE) + 1
    }

    /// Descriptor of the payload.
    pub fn app_descriptor(&self) -> Descriptor {
        Descriptor::new(self.version, self.base_address, &self.payload)
    }

    /// Descriptor of the vectors as stored in the metadata page.
    pub fn vector_descriptor(&self) -> Descriptor {
        Descriptor::new(
            self.version,
            self.metadata_address() + VECTOR_OFFSET,
            &self.vectors,
        )
    }

    /// The metadata page written after the payload.
    pub fn metadata_page(&self) -> Page {
        let mut data = [0u8; PAGE_SIZE];
        data[..DESCRIPTOR_LEN].copy_from_slice(&self.app_descriptor().to_bytes());
        data[DESCRIPTOR_LEN..2 * DESCRIPTOR_LEN]
            .copy_from_slice(&self.vector_descriptor().to_bytes());
        let start = VECTOR_OFFSET as usize;
        data[start..start + VECTOR_LEN].copy_from_slice(&self.vectors);
        Page {
            address: self.metadata_address(),
            data,
        }
    }

    /// Summary of the image layout.
    pub fn summary(&self) -> ImageSummary {
        ImageSummary {
            file_size: self.file_size,
            payload_size: self.payload.len(),
            base_address: self.base_address,
            erase_start: self.erase_start(),
            sectors: self.sector_count(),
            pages: self.page_count(),
            version: self.version,
            app_descriptor: self.app_descriptor(),
            vector_descriptor: self.vector_descriptor(),
        }
    }
}
