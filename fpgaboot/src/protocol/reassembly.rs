//! Reassembly of device responses from unaligned inbound chunks.
//!
//! The serial driver hands over whatever bytes it has, so an ack header may
//! be split over several reads and may be preceded by console text the
//! bootloader printed earlier, or by a late ack to an earlier request.
//! [`Reassembler`] buffers the chunks for the single pending request and
//! finds the header at the first offset that decodes as an ack of the
//! expected command.

use crate::protocol::command::Command;
use crate::protocol::frame::{Frame, HEADER_LEN};

/// Accumulates inbound bytes for one pending request.
#[derive(Debug)]
pub struct Reassembler {
    expected: Command,
    buffer: Vec<u8>,
    header_at: Option<usize>,
    scan_from: usize,
}

impl Reassembler {
    /// Create an empty reassembler waiting for the ack of `expected`.
    pub fn new(expected: Command) -> Self {
        Self {
            expected,
            buffer: Vec::new(),
            header_at: None,
            scan_from: 0,
        }
    }

    /// Append a chunk and rescan for the ack header.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        if self.header_at.is_some() {
            return;
        }
        while self.scan_from + HEADER_LEN <= self.buffer.len() {
            let window = &self.buffer[self.scan_from..self.scan_from + HEADER_LEN];
            if matches!(
                Frame::decode(window),
                Ok(Frame::Ack { command, .. }) if command == self.expected
            ) {
                self.header_at = Some(self.scan_from);
                return;
            }
            self.scan_from += 1;
        }
    }

    /// Total bytes received so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether nothing has been received.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// The located 16-byte ack header, if any.
    pub fn header(&self) -> Option<&[u8]> {
        self.header_at
            .map(|at| &self.buffer[at..at + HEADER_LEN])
    }

    /// Bytes following the ack header.
    pub fn payload(&self) -> &[u8] {
        match self.header_at {
            Some(at) => &self.buffer[at + HEADER_LEN..],
            None => &[],
        }
    }

    /// Bytes preceding the ack header (device console noise).
    ///
    /// Until a header is found this is everything received.
    pub fn noise(&self) -> &[u8] {
        match self.header_at {
            Some(at) => &self.buffer[..at],
            None => &self.buffer,
        }
    }

    /// Raw buffered bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::validate_ack;

    fn info_reply() -> Vec<u8> {
        let mut data = Frame::ack(Command::Info, 0, 0).encode();
        data.extend_from_slice(b"current: app\n");
        data
    }

    #[test]
    fn test_single_chunk() {
        let mut r = Reassembler::new(Command::Info);
        r.push(&info_reply());
        let header = r.header().unwrap();
        assert!(validate_ack(header, Command::Info, 0, 0).is_ok());
        assert_eq!(r.payload(), b"current: app\n");
        assert!(r.noise().is_empty());
    }

    #[test]
    fn test_split_across_every_boundary() {
        let reply = info_reply();
        for split in 1..reply.len() {
            let mut r = Reassembler::new(Command::Info);
            r.push(&reply[..split]);
            if split < HEADER_LEN {
                assert!(r.header().is_none(), "split {split}");
            }
            r.push(&reply[split..]);
            assert!(r.header().is_some(), "split {split}");
            assert_eq!(r.payload(), b"current: app\n", "split {split}");
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut r = Reassembler::new(Command::Info);
        for b in info_reply() {
            r.push(&[b]);
        }
        assert_eq!(r.payload(), b"current: app\n");
    }

    #[test]
    fn test_leading_noise_skipped() {
        let mut r = Reassembler::new(Command::Info);
        r.push(b"boot banner\r\n");
        r.push(&info_reply());
        assert_eq!(r.noise(), b"boot banner\r\n");
        assert_eq!(r.payload(), b"current: app\n");
    }

    #[test]
    fn test_late_ack_of_other_command_is_noise() {
        let mut late = Frame::ack(Command::SaveBrick, 0, 0).encode();
        late.extend_from_slice(b"save brick get\n");

        let mut r = Reassembler::new(Command::Info);
        r.push(&late);
        assert!(r.header().is_none());

        r.push(&info_reply());
        let header = r.header().unwrap();
        assert!(validate_ack(header, Command::Info, 0, 0).is_ok());
        assert_eq!(r.noise(), late.as_slice());
        assert_eq!(r.payload(), b"current: app\n");
    }

    #[test]
    fn test_request_echo_is_not_an_ack() {
        let mut r = Reassembler::new(Command::Info);
        r.push(&crate::protocol::encode_request(Command::Info, 0, 0, &[]));
        assert!(r.header().is_none());
    }

    #[test]
    fn test_noise_only_has_no_header() {
        let mut r = Reassembler::new(Command::Info);
        r.push(&[0x20; 64]);
        assert!(r.header().is_none());
        assert_eq!(r.noise().len(), 64);
        assert!(r.payload().is_empty());
    }
}
