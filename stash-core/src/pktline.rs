//! Inner message framing
//!
//! ```text
//! <flag '0'|'1'><4-digit command length><command>\n<payload>
//! ```
//!
//! With flag `1` the payload is deflated on its own, except for stream
//! chunks: those are slices of one deflated buffer and are only inflated
//! once reassembled.

use crate::compression::{deflate, inflate};
use crate::error::{Result, StashError};

/// Wire name of the stream-chunk command
pub const STREAM_COMMAND: &str = "stash-send-stream";

const FLAG_LEN: usize = 1;
const COMMAND_LEN_DIGITS: usize = 4;
const HEADER_LEN: usize = FLAG_LEN + COMMAND_LEN_DIGITS;

/// One decoded pkt-line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PktLine {
    pub compressed: bool,
    pub command: String,
    pub payload: Vec<u8>,
}

impl PktLine {
    pub fn new(command: impl Into<String>, payload: Vec<u8>, compressed: bool) -> Self {
        Self {
            compressed,
            command: command.into(),
            payload,
        }
    }

    fn payload_is_chunk(&self) -> bool {
        self.command == STREAM_COMMAND
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.command.len() > 9999 || self.command.contains('\n') {
            return Err(StashError::Protocol(format!("invalid command name {:?}", self.command)));
        }
        let body = if self.compressed && !self.payload_is_chunk() {
            deflate(&self.payload)?
        } else {
            self.payload.clone()
        };
        let mut out = Vec::with_capacity(HEADER_LEN + self.command.len() + 1 + body.len());
        out.push(if self.compressed { b'1' } else { b'0' });
        out.extend_from_slice(format!("{:04}", self.command.len()).as_bytes());
        out.extend_from_slice(self.command.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(StashError::Protocol(format!("pkt-line of {} bytes is too short", data.len())));
        }
        let compressed = match data[0] {
            b'0' => false,
            b'1' => true,
            other => {
                return Err(StashError::Protocol(format!("invalid compression flag {:?}", other as char)));
            }
        };
        let digits = &data[FLAG_LEN..HEADER_LEN];
        if !digits.iter().all(u8::is_ascii_digit) {
            return Err(StashError::Protocol(format!("invalid command length {:?}", digits)));
        }
        let command_len = digits.iter().fold(0usize, |acc, d| acc * 10 + (d - b'0') as usize);
        let newline_at = HEADER_LEN + command_len;
        if data.get(newline_at) != Some(&b'\n') {
            return Err(StashError::Protocol(format!(
                "declared command length {} does not end at a newline",
                command_len
            )));
        }
        let command = std::str::from_utf8(&data[HEADER_LEN..newline_at])
            .map_err(|_| StashError::Protocol("command name is not UTF-8".into()))?
            .to_string();

        let body = &data[newline_at + 1..];
        let mut line = Self {
            compressed,
            command,
            payload: Vec::new(),
        };
        line.payload = if compressed && !line.payload_is_chunk() {
            inflate(body)?
        } else {
            body.to_vec()
        };
        Ok(line)
    }
}
