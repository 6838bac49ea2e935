//! Message framing over the tool server's stdio byte stream
//!
//! The child's stdout has no inherent message boundaries: reads return
//! arbitrarily sized chunks that may split a message anywhere or carry
//! several messages at once. Every frame is delimited explicitly, either
//! one JSON object per line (what MCP stdio servers emit) or with an
//! LSP-style `Content-Length` header.
//!
//! ```text
//! {"jsonrpc":"2.0","id":1,"result":{}}\n
//!
//! Content-Length: 36\r\n
//! \r\n
//! {"jsonrpc":"2.0","id":1,"result":{}}
//! ```

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Maximum frame size (100MB) to bound memory on a misbehaving server
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Framing strategy for one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// One JSON value per `\n`-terminated line
    #[default]
    #[serde(alias = "newline-delimited", alias = "ndjson")]
    Newline,
    /// `Content-Length: N` header block followed by an N-byte body
    ContentLength,
}

impl Framing {
    /// Wrap a serialized message body for the wire
    pub fn encode(&self, body: &[u8]) -> Vec<u8> {
        match self {
            Framing::Newline => {
                let mut out = Vec::with_capacity(body.len() + 1);
                out.extend_from_slice(body);
                out.push(b'\n');
                out
            }
            Framing::ContentLength => {
                let header = format!("Content-Length: {}\r\n\r\n", body.len());
                let mut out = Vec::with_capacity(header.len() + body.len());
                out.extend_from_slice(header.as_bytes());
                out.extend_from_slice(body);
                out
            }
        }
    }

    pub fn decoder(&self) -> FrameDecoder {
        FrameDecoder::new(*self)
    }
}

/// Incremental decoder fed with raw chunks in arrival order
#[derive(Debug)]
pub struct FrameDecoder {
    framing: Framing,
    buffer: Vec<u8>,
    /// Body length announced by an already consumed header block
    body_len: Option<usize>,
    /// Prefix of `buffer` already searched for a newline
    scanned: usize,
}

impl FrameDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: Vec::new(),
            body_len: None,
            scanned: 0,
        }
    }

    /// Append a chunk read from the stream
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet part of a complete frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next complete frame, if any.
    ///
    /// Returns `Ok(None)` when more input is needed. An error means the
    /// stream can no longer be resynchronized.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        match self.framing {
            Framing::Newline => self.next_line(),
            Framing::ContentLength => self.next_content_length(),
        }
    }

    fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let found = self.buffer[self.scanned..]
                .iter()
                .position(|b| *b == b'\n');
            let Some(pos) = found.map(|offset| self.scanned + offset) else {
                self.scanned = self.buffer.len();
                if self.buffer.len() > MAX_FRAME_SIZE {
                    return Err(Error::Protocol(format!(
                        "line exceeds maximum frame size of {} bytes",
                        MAX_FRAME_SIZE
                    )));
                }
                return Ok(None);
            };

            self.scanned = 0;
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            // Blank lines between messages carry nothing
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(line));
        }
    }

    fn next_content_length(&mut self) -> Result<Option<Vec<u8>>> {
        if self.body_len.is_none() {
            match self.parse_headers()? {
                Some(len) => self.body_len = Some(len),
                None => return Ok(None),
            }
        }

        let len = self.body_len.unwrap_or_default();
        if self.buffer.len() < len {
            return Ok(None);
        }

        self.body_len = None;
        Ok(Some(self.buffer.drain(..len).collect()))
    }

    /// Consume a complete header block and return the announced body length
    fn parse_headers(&mut self) -> Result<Option<usize>> {
        let Some((header_end, terminator_len)) = find_header_end(&self.buffer) else {
            if self.buffer.len() > 8 * 1024 {
                return Err(Error::Protocol(
                    "header block exceeds 8KB without terminator".to_string(),
                ));
            }
            return Ok(None);
        };

        let header_bytes: Vec<u8> = self.buffer.drain(..header_end + terminator_len).collect();
        let headers = String::from_utf8_lossy(&header_bytes[..header_end]);

        let mut content_length: Option<usize> = None;
        for line in headers.lines() {
            let line = line.trim();
            if let Some((key, value)) = line.split_once(':') {
                if key.trim().eq_ignore_ascii_case("Content-Length") {
                    let value = value.trim();
                    content_length = Some(value.parse().map_err(|_| {
                        Error::Protocol(format!("invalid Content-Length value: {}", value))
                    })?);
                }
                // Other headers (e.g. Content-Type) are ignored
            }
        }

        let size =
            content_length.ok_or_else(|| Error::Protocol("missing Content-Length header".to_string()))?;
        if size > MAX_FRAME_SIZE {
            return Err(Error::Protocol(format!(
                "message size {} exceeds maximum {} bytes",
                size, MAX_FRAME_SIZE
            )));
        }

        Ok(Some(size))
    }
}

/// Locate the blank line ending a header block (CRLF or bare LF)
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}
