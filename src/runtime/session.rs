//! Per-connection session state.
//!
//! Each session tracks its lifecycle state, the undelimited tail of its
//! input, and the frames queued for it. The stream type is generic so
//! the readiness and completion backends share the same bookkeeping.

use crate::protocols::chat::parser::{parse_all, sender_label, Frame, FrameTooLarge};
use crate::runtime::buffer::{Flush, OutboundQueue};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::io::{self, Write};
use std::net::SocketAddr;

/// Stable session identifier. Never reused within one server run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, not yet registered for I/O.
    Connecting,
    /// Registered and eligible for broadcast.
    Active,
    /// Removed from the registry; handle not yet released.
    Closing,
    /// Handle released.
    Closed,
}

/// Why a session ended.
#[derive(Debug)]
pub enum CloseReason {
    EndOfStream,
    ReadError(io::Error),
    WriteError(io::Error),
    FrameTooLarge(FrameTooLarge),
    Quit,
    RegisterFailed(io::Error),
}

impl CloseReason {
    /// Whether the close points at a fault rather than a normal hang-up.
    pub fn is_fault(&self) -> bool {
        !matches!(self, CloseReason::EndOfStream | CloseReason::Quit)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::EndOfStream => write!(f, "end of stream"),
            CloseReason::ReadError(e) => write!(f, "read error: {e}"),
            CloseReason::WriteError(e) => write!(f, "write error: {e}"),
            CloseReason::FrameTooLarge(e) => write!(f, "frame too large: {e}"),
            CloseReason::Quit => write!(f, "quit"),
            CloseReason::RegisterFailed(e) => write!(f, "register failed: {e}"),
        }
    }
}

/// A single client connection.
#[derive(Debug)]
pub struct Session<S> {
    pub id: SessionId,
    pub peer: SocketAddr,
    /// Label prefixed to every frame this session sends.
    pub label: String,
    /// Owned socket handle; dropped exactly once when the session is.
    pub stream: S,
    state: SessionState,
    read_buf: BytesMut,
    write_queue: OutboundQueue,
}

impl<S> Session<S> {
    /// Create a new session in the connecting state.
    pub fn new(id: SessionId, peer: SocketAddr, stream: S) -> Self {
        Self {
            id,
            peer,
            label: sender_label(&peer),
            stream,
            state: SessionState::Connecting,
            read_buf: BytesMut::new(),
            write_queue: OutboundQueue::new(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Connecting -> Active.
    pub fn activate(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::Active;
        }
    }

    /// Active -> Closing. Returns `false` if the session was already closing.
    pub fn begin_close(&mut self) -> bool {
        match self.state {
            SessionState::Connecting | SessionState::Active => {
                self.state = SessionState::Closing;
                true
            }
            SessionState::Closing | SessionState::Closed => false,
        }
    }

    /// Closing -> Closed. Drops anything still queued.
    pub fn finish_close(&mut self) {
        self.state = SessionState::Closed;
        self.read_buf.clear();
        self.write_queue.take_coalesced();
    }

    /// Append freshly read bytes to the undelimited input.
    pub fn buffer_input(&mut self, data: &[u8]) {
        self.read_buf.extend_from_slice(data);
    }

    /// Bytes read but not yet part of a complete frame.
    #[cfg(test)]
    pub fn buffered_input(&self) -> usize {
        self.read_buf.len()
    }

    /// Split every complete frame off the input, oldest first. An
    /// oversized line stops decoding; the frames before it are kept.
    pub fn decode_frames(&mut self, max_line_len: usize) -> (Vec<Frame>, Option<FrameTooLarge>) {
        parse_all(&mut self.read_buf, max_line_len)
    }

    /// Queue an encoded frame. Returns `true` if the queue was empty.
    pub fn queue_frame(&mut self, frame: Bytes) -> bool {
        self.write_queue.push(frame)
    }

    pub fn has_pending_output(&self) -> bool {
        !self.write_queue.is_empty()
    }

    pub fn outbound_mut(&mut self) -> &mut OutboundQueue {
        &mut self.write_queue
    }
}

impl<S: Write> Session<S> {
    /// Flush queued frames to the stream until it would block.
    pub fn flush(&mut self) -> io::Result<Flush> {
        self.write_queue.write_to(&mut self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session<Vec<u8>> {
        Session::new(SessionId(7), "127.0.0.1:40001".parse().unwrap(), Vec::new())
    }

    #[test]
    fn test_session_state_transitions() {
        let mut s = session();
        assert_eq!(s.state(), SessionState::Connecting);
        assert!(!s.is_active());

        s.activate();
        assert!(s.is_active());

        assert!(s.begin_close());
        assert_eq!(s.state(), SessionState::Closing);
        assert!(!s.begin_close());

        s.finish_close();
        assert_eq!(s.state(), SessionState::Closed);

        // Closed sessions never come back.
        s.activate();
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn test_label_from_peer_port() {
        assert_eq!(session().label, "client[40001]");
    }

    #[test]
    fn test_reassembles_split_input() {
        let mut s = session();
        s.buffer_input(b"hel");
        let (frames, err) = s.decode_frames(1024);
        assert!(frames.is_empty() && err.is_none());
        assert_eq!(s.buffered_input(), 3);

        s.buffer_input(b"lo\nwor");
        let (frames, err) = s.decode_frames(1024);
        assert!(err.is_none());
        assert_eq!(frames, vec![Frame::new("hello")]);
        assert_eq!(s.buffered_input(), 3);
    }

    #[test]
    fn test_oversized_input_keeps_earlier_frames() {
        let mut s = session();
        s.buffer_input(b"hi\n");
        s.buffer_input(&[b'a'; 32]);
        let (frames, err) = s.decode_frames(16);
        assert_eq!(frames, vec![Frame::new("hi")]);
        assert_eq!(err.map(|e| e.limit), Some(16));
    }

    #[test]
    fn test_flush_writes_queued_frames() {
        let mut s = session();
        assert!(s.queue_frame(Bytes::from_static(b"a: 1\n")));
        assert!(!s.queue_frame(Bytes::from_static(b"b: 2\n")));
        assert!(s.has_pending_output());

        assert_eq!(s.flush().unwrap(), Flush::Drained);
        assert_eq!(s.stream, b"a: 1\nb: 2\n");
        assert!(!s.has_pending_output());
    }
}
