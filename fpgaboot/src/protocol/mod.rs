//! Bootloader wire protocol.

pub mod command;
pub mod crc;
pub mod frame;
pub mod reassembly;

pub use command::Command;
pub use frame::{
    Frame, FrameMode, HEADER_LEN, LARGE_FRAME_LEN, PAGE_SIZE, SECTOR_SIZE, encode_request,
    encode_request_padded, validate_ack,
};
pub use reassembly::Reassembler;
