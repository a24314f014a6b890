//! Decoding of the bootloader's console output.
//!
//! The bootloader prints debug text on the same UART as its acks, so the
//! text arrives in arbitrary chunks that may split a UTF-8 sequence.

/// Streaming UTF-8 decoder for device console output.
#[derive(Debug, Default)]
pub struct ConsoleDecoder {
    pending: Vec<u8>,
}

impl ConsoleDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a chunk.
    ///
    /// - Valid UTF-8 is emitted as-is.
    /// - Invalid sequences become `�` and decoding continues.
    /// - An incomplete trailing sequence is kept for the next chunk.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut output = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    output.push_str(valid);
                    self.pending.clear();
                    break;
                },
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    if let Ok(valid) = std::str::from_utf8(&self.pending[..valid_up_to]) {
                        output.push_str(valid);
                    }

                    match err.error_len() {
                        Some(invalid_len) => {
                            output.push('\u{FFFD}');
                            let drain_to = (valid_up_to + invalid_len).min(self.pending.len());
                            self.pending.drain(..drain_to);
                        },
                        None => {
                            self.pending.drain(..valid_up_to);
                            break;
                        },
                    }
                },
            }
        }

        output
    }

    /// Emit whatever is still buffered, replacing an incomplete sequence.
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Normalise console text for display.
///
/// `\r\n` and lone `\r` become `\n`; other control characters except tab
/// are dropped.
pub fn clean_console_text(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n");
    let mut out = String::with_capacity(normalized.len());
    for ch in normalized.chars() {
        match ch {
            '\n' | '\t' => out.push(ch),
            '\r' => out.push('\n'),
            _ if ch.is_control() => {},
            _ => out.push(ch),
        }
    }
    out
}

/// Decode a complete reply payload into trimmed display text.
pub fn reply_text(payload: &[u8]) -> String {
    clean_console_text(&String::from_utf8_lossy(payload))
        .trim()
        .to_string()
}
