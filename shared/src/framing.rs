//! Delimiter-terminated framing over a byte stream.
//!
//! A frame is a UTF-8 JSON document followed by a single delimiter byte. The
//! codec accumulates whatever the socket hands it and yields complete frames
//! as soon as their delimiter arrives, so a read may produce zero, one or many
//! frames and a frame may span any number of reads.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Largest payload accepted before the codec gives up on a frame.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Byte that terminates every frame. One deployment uses one delimiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delimiter {
    #[default]
    Newline,
    Pipe,
}

impl Delimiter {
    pub fn byte(self) -> u8 {
        match self {
            Delimiter::Newline => b'\n',
            Delimiter::Pipe => b'|',
        }
    }
}

impl fmt::Display for Delimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delimiter::Newline => write!(f, "newline"),
            Delimiter::Pipe => write!(f, "pipe"),
        }
    }
}

impl FromStr for Delimiter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newline" | "\\n" => Ok(Delimiter::Newline),
            "pipe" | "|" => Ok(Delimiter::Pipe),
            other => Err(format!(
                "unknown delimiter '{}', expected 'newline' or 'pipe'",
                other
            )),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("frame exceeds {limit} bytes")]
    FrameTooLong { limit: usize },
    #[error("payload contains the frame delimiter {0:?}")]
    DelimiterInPayload(char),
    #[error("failed to serialize message: {0}")]
    Serialize(String),
}

/// Serializes `message` into exactly one delimiter-terminated frame.
pub fn encode_frame<T: Serialize + ?Sized>(
    message: &T,
    delimiter: Delimiter,
) -> Result<Vec<u8>, FrameError> {
    let mut bytes =
        serde_json::to_vec(message).map_err(|e| FrameError::Serialize(e.to_string()))?;

    // Compact JSON never contains a raw newline, but '|' may appear in strings
    if bytes.contains(&delimiter.byte()) {
        return Err(FrameError::DelimiterInPayload(delimiter.byte() as char));
    }

    bytes.push(delimiter.byte());
    Ok(bytes)
}

/// Accumulate-and-scan frame decoder
///
/// Frames are sliced out of the buffer by advancing `start`; consumed bytes
/// are compacted away once per [`FrameCodec::extend`], so a read holding many
/// frames is decoded in one linear pass.
pub struct FrameCodec {
    delimiter: u8,
    max_frame_len: usize,
    buffer: Vec<u8>,
    /// Start of the first frame not yet handed out
    start: usize,
    /// Bytes of `buffer` before this index are known to be delimiter-free
    scanned: usize,
    /// Set while skipping the tail of an oversized frame
    discarding: bool,
}

impl FrameCodec {
    pub fn new(delimiter: Delimiter) -> Self {
        Self::with_max_frame_len(delimiter, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(delimiter: Delimiter, max_frame_len: usize) -> Self {
        Self {
            delimiter: delimiter.byte(),
            max_frame_len,
            buffer: Vec::new(),
            start: 0,
            scanned: 0,
            discarding: false,
        }
    }

    /// Appends freshly read bytes to the accumulation buffer.
    pub fn extend(&mut self, bytes: &[u8]) {
        if self.start > 0 {
            self.buffer.drain(..self.start);
            self.scanned -= self.start;
            self.start = 0;
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes waiting for a delimiter.
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.start
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.start = 0;
        self.scanned = 0;
    }

    /// Pops the next complete frame, if one is buffered.
    ///
    /// An oversized frame is reported once as [`FrameError::FrameTooLong`];
    /// its remaining bytes are dropped up to and including the next delimiter.
    pub fn next_frame(&mut self) -> Option<Result<String, FrameError>> {
        loop {
            let found = self.buffer[self.scanned..]
                .iter()
                .position(|&b| b == self.delimiter);

            match found {
                Some(offset) => {
                    let end = self.scanned + offset;
                    let frame_start = self.start;
                    self.start = end + 1;
                    self.scanned = self.start;

                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }

                    let frame = &self.buffer[frame_start..end];
                    if frame.len() > self.max_frame_len {
                        return Some(Err(FrameError::FrameTooLong {
                            limit: self.max_frame_len,
                        }));
                    }

                    return Some(
                        std::str::from_utf8(frame)
                            .map(str::to_owned)
                            .map_err(|_| FrameError::InvalidUtf8),
                    );
                }
                None => {
                    self.scanned = self.buffer.len();

                    if self.buffered() == 0 {
                        self.reset();
                    } else if self.buffered() > self.max_frame_len {
                        self.reset();
                        if !self.discarding {
                            self.discarding = true;
                            return Some(Err(FrameError::FrameTooLong {
                                limit: self.max_frame_len,
                            }));
                        }
                    }

                    return None;
                }
            }
        }
    }

    /// Feeds `bytes` and drains every frame they complete.
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<Result<String, FrameError>> {
        self.extend(bytes);
        std::iter::from_fn(|| self.next_frame()).collect()
    }
}
