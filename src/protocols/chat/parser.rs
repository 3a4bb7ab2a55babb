//! Chat frame codec.
//!
//! Decoding splits a byte stream into `\n`-delimited frames. It never
//! blocks and never consumes bytes past the delimiter it found; whatever
//! follows stays in the buffer for the next call.

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;

/// Frame delimiter on the wire.
pub const DELIMITER: u8 = b'\n';

/// One decoded line, delimiter stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
    #[cfg(test)]
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A line exceeded the configured maximum length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTooLarge {
    /// Configured maximum line length.
    pub limit: usize,
    /// Bytes of the offending line seen so far.
    pub buffered: usize,
}

impl fmt::Display for FrameTooLarge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "line of {} bytes exceeds limit of {} bytes",
            self.buffered, self.limit
        )
    }
}

impl std::error::Error for FrameTooLarge {}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult {
    /// A complete frame was split off the front of the buffer.
    Complete(Frame),
    /// No delimiter yet; the buffer is left untouched.
    Incomplete,
    /// The current line is longer than `max_line_len`.
    TooLarge(FrameTooLarge),
}

/// Split the next frame off the front of `buf`.
///
/// A line longer than `max_line_len` is rejected whether or not its
/// delimiter has arrived, so the outcome does not depend on how the
/// stream was chunked.
pub fn parse(buf: &mut BytesMut, max_line_len: usize) -> ParseResult {
    match buf.iter().position(|&b| b == DELIMITER) {
        Some(pos) if pos > max_line_len => ParseResult::TooLarge(FrameTooLarge {
            limit: max_line_len,
            buffered: pos,
        }),
        Some(pos) => {
            let mut line = buf.split_to(pos + 1);
            line.truncate(pos);
            ParseResult::Complete(Frame(line.freeze()))
        }
        None if buf.len() > max_line_len => ParseResult::TooLarge(FrameTooLarge {
            limit: max_line_len,
            buffered: buf.len(),
        }),
        None => ParseResult::Incomplete,
    }
}

/// Decode every complete frame currently in `buf`, in order.
///
/// Frames that precede an oversized line are still returned, alongside
/// the error, so the caller can forward them before dropping the session.
pub fn parse_all(buf: &mut BytesMut, max_line_len: usize) -> (Vec<Frame>, Option<FrameTooLarge>) {
    let mut frames = Vec::new();
    loop {
        match parse(buf, max_line_len) {
            ParseResult::Complete(frame) => frames.push(frame),
            ParseResult::Incomplete => return (frames, None),
            ParseResult::TooLarge(err) => return (frames, Some(err)),
        }
    }
}

/// Encode a frame for delivery: `<label>: <text>\n`.
pub fn encode(label: &str, frame: &Frame) -> Bytes {
    let mut out = BytesMut::with_capacity(label.len() + 2 + frame.len() + 1);
    out.extend_from_slice(label.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(frame.as_bytes());
    out.extend_from_slice(&[DELIMITER]);
    out.freeze()
}

/// Display label for a connection, derived from the remote port.
pub fn sender_label(peer: &SocketAddr) -> String {
    format!("client[{}]", peer.port())
}
