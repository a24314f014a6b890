//! Firmware image handling.

pub mod descriptor;
pub mod firmware;

pub use descriptor::{DESCRIPTOR_LEN, Descriptor, Version};
pub use firmware::{
    DEFAULT_BASE_ADDRESS, FirmwareImage, HEADER_REGION_LEN, ImageSummary, Page, VECTOR_LEN,
};
