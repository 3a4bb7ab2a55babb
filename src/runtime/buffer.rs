//! Outbound frame queue.
//!
//! Each session owns one `OutboundQueue`. Frames are reference-counted
//! `Bytes`, so a broadcast shares one encoded frame across recipients.
//!
//! ## Partial Writes
//!
//! A short write advances the front frame in place; the next flush
//! resumes from the first unwritten byte. Nothing is re-sent and
//! nothing is dropped.

use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::io::{self, IoSlice, Write};

/// Maximum number of frames handed to one vectored write.
const MAX_IOVECS: usize = 64;

/// Outcome of a flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Queue is empty.
    Drained,
    /// The writer would block; bytes remain queued.
    Blocked,
}

#[derive(Debug, Default)]
pub struct OutboundQueue {
    frames: VecDeque<Bytes>,
    pending: usize,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame. Returns `true` if the queue was empty before.
    pub fn push(&mut self, frame: Bytes) -> bool {
        let was_empty = self.frames.is_empty();
        self.pending += frame.len();
        self.frames.push_back(frame);
        was_empty
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Unwritten bytes across all queued frames.
    #[cfg(test)]
    pub fn pending_bytes(&self) -> usize {
        self.pending
    }

    /// Number of frames with unwritten bytes.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Slices over the unwritten bytes, front first.
    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        self.frames
            .iter()
            .take(MAX_IOVECS)
            .map(|frame| IoSlice::new(&frame[..]))
            .collect()
    }

    /// Mark `n` bytes from the front as written.
    pub fn advance(&mut self, mut n: usize) {
        debug_assert!(n <= self.pending, "advance past queued bytes");
        self.pending -= n.min(self.pending);
        while n > 0 {
            let Some(front) = self.frames.front_mut() else {
                break;
            };
            if n < front.len() {
                front.advance(n);
                break;
            }
            n -= front.len();
            self.frames.pop_front();
        }
    }

    /// Move every queued byte into one contiguous buffer.
    pub fn take_coalesced(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pending);
        for frame in self.frames.drain(..) {
            out.extend_from_slice(&frame);
        }
        self.pending = 0;
        out
    }

    /// Write as much as `writer` accepts without blocking.
    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<Flush> {
        while !self.frames.is_empty() {
            let result = {
                let slices = self.io_slices();
                writer.write_vectored(&slices)
            };
            match result {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Blocked),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(Flush::Drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts at most `budget` bytes, then reports `WouldBlock`.
    struct Throttled {
        written: Vec<u8>,
        budget: usize,
        per_call: usize,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.budget).min(self.per_call);
            self.written.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_push_reports_empty_transition() {
        let mut queue = OutboundQueue::new();
        assert!(queue.push(Bytes::from_static(b"a\n")));
        assert!(!queue.push(Bytes::from_static(b"b\n")));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pending_bytes(), 4);
    }

    #[test]
    fn test_advance_across_frames() {
        let mut queue = OutboundQueue::new();
        queue.push(Bytes::from_static(b"abc"));
        queue.push(Bytes::from_static(b"defg"));

        queue.advance(4);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending_bytes(), 3);
        assert_eq!(queue.take_coalesced(), b"efg");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_partial_write_resumes_from_remainder() {
        let mut queue = OutboundQueue::new();
        queue.push(Bytes::from_static(b"hello\n"));
        queue.push(Bytes::from_static(b"world\n"));

        let mut writer = Throttled {
            written: Vec::new(),
            budget: 4,
            per_call: 3,
        };
        assert_eq!(queue.write_to(&mut writer).unwrap(), Flush::Blocked);
        assert_eq!(writer.written, b"hell");
        assert_eq!(queue.pending_bytes(), 8);

        writer.budget = usize::MAX;
        assert_eq!(queue.write_to(&mut writer).unwrap(), Flush::Drained);
        assert_eq!(writer.written, b"hello\nworld\n");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_write_zero_is_an_error() {
        struct Closed;
        impl Write for Closed {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut queue = OutboundQueue::new();
        queue.push(Bytes::from_static(b"x\n"));
        let err = queue.write_to(&mut Closed).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
        assert_eq!(queue.pending_bytes(), 2);
    }
}
