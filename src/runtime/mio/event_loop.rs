//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! ## Edge Triggering
//!
//! mio registrations are edge-triggered. A readable event is drained
//! until the socket reports `WouldBlock`; stopping earlier would leave
//! bytes behind with no further event to announce them. Frames are
//! decoded after every chunk, so buffered input never exceeds one line
//! limit plus one read chunk.
//!
//! Write interest is only held while a session has queued output. The
//! queue going from empty to non-empty re-registers `WITH_OUTPUT`;
//! draining it drops back to `IDLE`.

use crate::config::Config;
use crate::protocols::chat::parser::FrameTooLarge;
use crate::protocols::chat::{classify, Frame};
use crate::runtime::broadcast::{broadcast, Deliver};
use crate::runtime::buffer::Flush;
use crate::runtime::{CloseReason, Session, SessionId, SessionRegistry, Stats};
use bytes::Bytes;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

type MioSession = Session<TcpStream>;

fn token(id: SessionId) -> Token {
    Token(id.0 as usize)
}

/// Interest while a session has nothing queued.
const IDLE: Interest = Interest::READABLE;

/// Interest while output is queued. A session reads until it closes and
/// quit closes it at once, so write-only interest is never registered.
const WITH_OUTPUT: Interest = Interest::READABLE.add(Interest::WRITABLE);

/// Result of one non-blocking read.
enum ReadStep {
    /// Frames decoded from the chunk, then an oversized line if one was hit.
    Frames {
        frames: Vec<Frame>,
        too_large: Option<FrameTooLarge>,
    },
    Drained,
    Closed(CloseReason),
}

/// Queues frames and arms write interest on the empty -> non-empty edge.
struct MioSink<'a> {
    registry: &'a Registry,
}

impl Deliver<TcpStream> for MioSink<'_> {
    fn deliver(&mut self, session: &mut MioSession, frame: Bytes) -> io::Result<()> {
        if session.queue_frame(frame) {
            self.registry
                .reregister(&mut session.stream, token(session.id), WITH_OUTPUT)?;
        }
        Ok(())
    }
}

struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    sessions: SessionRegistry<TcpStream>,
    next_id: u64,
    scratch: Vec<u8>,
    config: Config,
    stats: Arc<Stats>,
}

/// Run the mio-based server on the calling thread.
pub fn run(listener: std::net::TcpListener, config: Config, stats: Arc<Stats>) -> io::Result<()> {
    let mut event_loop = EventLoop::new(listener, config, stats)?;
    event_loop.run()
}

impl EventLoop {
    fn new(listener: std::net::TcpListener, config: Config, stats: Arc<Stats>) -> io::Result<Self> {
        let poll = Poll::new()?;
        listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            listener,
            sessions: SessionRegistry::new(),
            next_id: 0,
            scratch: vec![0u8; config.read_chunk],
            config,
            stats,
        })
    }

    fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.config.batch_size);

        info!(
            batch_size = self.config.batch_size,
            max_line_len = self.config.max_line_len,
            "mio event loop started"
        );

        loop {
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    Token(raw) => self.handle_session_event(SessionId(raw as u64), event),
                }
            }
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.open_session(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.stats.accept_failed();
                    warn!(error = %e, "Accept failed");
                    break;
                }
            }
        }
    }

    fn open_session(&mut self, stream: TcpStream, peer: SocketAddr) {
        let id = SessionId(self.next_id);
        self.next_id += 1;

        let mut session = Session::new(id, peer, stream);
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut session.stream, token(id), IDLE)
        {
            // Never registered, so never active: dropping it closes the socket.
            let reason = CloseReason::RegisterFailed(e);
            warn!(session = %id, peer = %peer, reason = %reason, "Session rejected");
            return;
        }

        session.activate();
        info!(session = %id, peer = %peer, label = %session.label, "Session connected");
        self.sessions.add(session);
        self.stats.session_opened();
    }

    fn handle_session_event(&mut self, id: SessionId, event: &Event) {
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            self.handle_readable(id);
        }

        if event.is_writable() || event.is_write_closed() {
            self.handle_writable(id);
        }
    }

    /// Read until the socket would block, dispatching frames per chunk.
    fn handle_readable(&mut self, id: SessionId) {
        let max_line_len = self.config.max_line_len;

        loop {
            let step = {
                let Some(session) = self.sessions.get_mut(id) else {
                    return;
                };
                if !session.is_active() {
                    return;
                }
                match session.stream.read(&mut self.scratch) {
                    Ok(0) => ReadStep::Closed(CloseReason::EndOfStream),
                    Ok(n) => {
                        session.buffer_input(&self.scratch[..n]);
                        let (frames, too_large) = session.decode_frames(max_line_len);
                        ReadStep::Frames { frames, too_large }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => ReadStep::Drained,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => ReadStep::Closed(CloseReason::ReadError(e)),
                }
            };

            match step {
                ReadStep::Frames { frames, too_large } => {
                    if !self.dispatch_frames(id, frames) {
                        return;
                    }
                    if let Some(e) = too_large {
                        self.close_session(id, CloseReason::FrameTooLarge(e));
                        return;
                    }
                }
                ReadStep::Drained => return,
                ReadStep::Closed(reason) => {
                    self.close_session(id, reason);
                    return;
                }
            }
        }
    }

    /// Broadcast and act on each frame in order. Returns `false` once the
    /// sender has been closed; later frames from the same read are dropped.
    fn dispatch_frames(&mut self, id: SessionId, frames: Vec<Frame>) -> bool {
        let Some(label) = self.sessions.get(id).map(|s| s.label.clone()) else {
            return false;
        };

        for frame in frames {
            self.stats.frame_received();
            let action = classify(&frame, &self.config.quit_token, self.config.quit_policy);
            if action.forwards() {
                self.forward(id, &label, &frame);
            }
            if action.closes() {
                self.close_session(id, CloseReason::Quit);
                return false;
            }
        }
        true
    }

    fn forward(&mut self, sender: SessionId, label: &str, frame: &Frame) {
        let mut sink = MioSink {
            registry: self.poll.registry(),
        };
        let report = broadcast(&mut self.sessions, sender, label, frame, &mut sink);
        self.stats.frames_forwarded(report.delivered);

        for (peer, e) in report.failed {
            self.stats.delivery_failed();
            self.close_session(peer, CloseReason::WriteError(e));
        }
    }

    fn handle_writable(&mut self, id: SessionId) {
        let result = {
            let Some(session) = self.sessions.get_mut(id) else {
                return;
            };
            if !session.is_active() {
                return;
            }
            session.flush().and_then(|flush| {
                if flush == Flush::Drained {
                    self.poll
                        .registry()
                        .reregister(&mut session.stream, token(id), IDLE)?;
                }
                Ok(flush)
            })
        };

        match result {
            Ok(Flush::Drained) => debug!(session = %id, "Output drained"),
            Ok(Flush::Blocked) => {}
            Err(e) => self.close_session(id, CloseReason::WriteError(e)),
        }
    }

    /// Single close path. Idempotent: a session already removed is ignored.
    fn close_session(&mut self, id: SessionId, reason: CloseReason) {
        let Some(mut session) = self.sessions.remove(id) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut session.stream);
        session.finish_close();

        if let CloseReason::FrameTooLarge(_) = reason {
            self.stats.frame_too_large();
        }
        self.stats.session_closed();

        if reason.is_fault() {
            warn!(session = %id, peer = %session.peer, reason = %reason, "Session closed");
        } else {
            info!(session = %id, peer = %session.peer, reason = %reason, "Session closed");
        }
        let snapshot = self.stats.snapshot();
        debug!(
            active = snapshot.active_sessions,
            registered = self.sessions.len(),
            "Session count"
        );
    }
}
