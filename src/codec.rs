//! Framing for the device's JSON object stream.
//!
//! The device writes bare JSON objects, sometimes newline-terminated and
//! sometimes not, and several can arrive in one read. Outbound commands are
//! always terminated with a single `\n`.

use crate::error::Result;
use crate::protocol::Command;
use serde_json::Value;

/// Largest incomplete frame kept while waiting for the rest of it
const MAX_PARTIAL_FRAME: usize = 64 * 1024;

/// Serialize a command as one newline-terminated line
pub fn encode_command(command: &Command) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(command)?;
    line.push(b'\n');
    Ok(line)
}

/// Decode every complete JSON value in `data`, in order.
///
/// Stops at the first malformed or truncated value; whatever follows it is
/// dropped with a warning.
pub fn decode_stream(data: &str) -> Vec<Value> {
    let parsed = parse_values(data.as_bytes());
    if let Some(err) = &parsed.error {
        tracing::warn!(
            "Failed to decode JSON chunk: {} (remaining={})",
            err,
            String::from_utf8_lossy(&data.as_bytes()[parsed.consumed..])
        );
    }
    parsed.values
}

/// Incremental decoder that carries truncated frames over to the next read
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed freshly read bytes and take every value they complete.
    ///
    /// A value cut off at the end of the input is kept for the next call.
    /// Malformed input discards the rest of the buffer.
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(bytes);

        let parsed = parse_values(&self.buffer);
        match parsed.error {
            None => self.buffer.clear(),
            Some(err) if err.is_eof() => {
                self.buffer.drain(..parsed.consumed);
                if self.buffer.len() > MAX_PARTIAL_FRAME {
                    tracing::warn!(
                        "Discarding {} bytes of unterminated JSON",
                        self.buffer.len()
                    );
                    self.buffer.clear();
                }
            }
            Some(err) => {
                tracing::warn!(
                    "Failed to decode JSON chunk: {} (remaining={})",
                    err,
                    String::from_utf8_lossy(&self.buffer[parsed.consumed..])
                );
                self.buffer.clear();
            }
        }

        parsed.values
    }

    /// Bytes held back from an incomplete frame
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

struct Parsed {
    values: Vec<Value>,
    consumed: usize,
    error: Option<serde_json::Error>,
}

fn parse_values(data: &[u8]) -> Parsed {
    let mut stream = serde_json::Deserializer::from_slice(data).into_iter::<Value>();
    let mut values = Vec::new();

    loop {
        match stream.next() {
            Some(Ok(value)) => values.push(value),
            Some(Err(error)) => {
                return Parsed {
                    values,
                    consumed: stream.byte_offset(),
                    error: Some(error),
                }
            }
            None => {
                return Parsed {
                    values,
                    consumed: stream.byte_offset(),
                    error: None,
                }
            }
        }
    }
}
