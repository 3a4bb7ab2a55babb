//! io_uring event loop for Linux.
//!
//! Completion-based model: every accept, read and write is issued once,
//! and the handler for its completion issues the next one.
//!
//! ## Threads
//!
//! The calling thread becomes the reaper: it waits on the ring, frees
//! each completion's token and hands `(op, result)` to one of `workers`
//! threads over a channel. Completions for a session always go to the
//! same worker, so a session's own completions are handled in order.
//! Workers never wait on one another; they only contend on the session
//! registry mutex, which every registry mutation and every broadcast
//! holds for its whole duration.
//!
//! ## Accepting
//!
//! Exactly one accept is in flight. The reaper re-arms it as soon as its
//! completion is reaped, retrying briefly; if the ring keeps refusing the
//! submission the backend fails instead of running without accepts.
//!
//! ## Closing
//!
//! A session closes on the first of EOF, read error, write error,
//! oversized line or quit. It is removed from the registry under the
//! lock, its socket is shut down so outstanding operations complete,
//! and the handle is released when the session drops. Completions that
//! arrive afterwards only release their buffers.

use super::machine::{resume_offset, step, submission_len, Action, Completion, LinkState};
use super::ring::Ring;
use super::token::{Op, TokenAllocator};
use crate::config::Config;
use crate::protocols::chat::classify;
use crate::runtime::broadcast::{broadcast, Deliver};
use crate::runtime::{CloseReason, Session, SessionId, SessionRegistry, Stats};
use bytes::Bytes;
use io_uring::{opcode, types};
use std::io;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Socket plus completion state for one session.
pub struct Conn {
    pub socket: TcpStream,
    pub link: LinkState,
}

impl Conn {
    fn new(socket: TcpStream) -> Self {
        Self {
            socket,
            link: LinkState::new(),
        }
    }

    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

type UringSession = Session<Conn>;

/// A reaped completion handed to a worker.
struct Completed {
    op: Op,
    result: i32,
}

struct Shared {
    ring: Ring,
    ops: Mutex<TokenAllocator>,
    sessions: Mutex<SessionRegistry<Conn>>,
    listener: TcpListener,
    next_id: AtomicU64,
    config: Config,
    stats: Arc<Stats>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn os_error(result: i32) -> io::Error {
    io::Error::from_raw_os_error(-result)
}

const ACCEPT_REARM_ATTEMPTS: u32 = 5;
const ACCEPT_REARM_BACKOFF: Duration = Duration::from_millis(10);

/// Call `submit` until it succeeds, sleeping `backoff` between attempts.
/// Returns the last error once `attempts` tries have failed.
fn retry<F>(attempts: u32, backoff: Duration, mut submit: F) -> io::Result<()>
where
    F: FnMut() -> io::Result<()>,
{
    let mut last = None;
    for attempt in 1..=attempts {
        match submit() {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(attempt, error = %e, "Submission failed");
                last = Some(e);
                if attempt < attempts {
                    thread::sleep(backoff);
                }
            }
        }
    }
    Err(last.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no attempts made")))
}

/// Run the io_uring-based server.
pub fn run(listener: TcpListener, config: Config, stats: Arc<Stats>) -> io::Result<()> {
    let ring = Ring::new(config.ring_size)?;
    // Accepts are parked in the kernel; a non-blocking listener would
    // make them fail with EAGAIN on older kernels.
    listener.set_nonblocking(false)?;
    let workers = config.workers;
    let batch_size = config.batch_size;

    info!(
        workers,
        ring_size = config.ring_size,
        max_line_len = config.max_line_len,
        "Starting io_uring runtime"
    );

    let shared = Arc::new(Shared {
        ring,
        ops: Mutex::new(TokenAllocator::new(1024)),
        sessions: Mutex::new(SessionRegistry::new()),
        listener,
        next_id: AtomicU64::new(0),
        config,
        stats,
    });

    let mut senders: Vec<Sender<Completed>> = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || worker_loop(worker_id, shared, rx))?;
        senders.push(tx);
    }

    shared.arm_accept()?;

    let mut next_worker = 0usize;
    let mut batch = Vec::with_capacity(batch_size);

    loop {
        shared.ring.reap(&mut batch, batch_size)?;

        for (token, result) in batch.drain(..) {
            let op = match lock(&shared.ops).free(token) {
                Some(op) => op,
                None => {
                    warn!("Unknown token in completion: {}", token);
                    continue;
                }
            };

            if matches!(op, Op::Accept) {
                shared.arm_accept()?;
            }

            let worker = match op.session() {
                Some(id) => id.0 as usize % senders.len(),
                None => {
                    next_worker = next_worker.wrapping_add(1);
                    next_worker % senders.len()
                }
            };

            if senders[worker].send(Completed { op, result }).is_err() {
                error!(worker, "Worker exited");
                return Err(io::Error::new(io::ErrorKind::Other, "worker pool stopped"));
            }
        }
    }
}

fn worker_loop(worker_id: usize, shared: Arc<Shared>, rx: Receiver<Completed>) {
    debug!(worker = worker_id, "Worker started");
    while let Ok(Completed { op, result }) = rx.recv() {
        match op {
            Op::Accept => shared.on_accept(result),
            Op::Read { session, buf } => shared.on_read(session, result, buf),
            Op::Write {
                session,
                buf,
                offset,
            } => shared.on_write(session, result, buf, offset),
        }
    }
    debug!(worker = worker_id, "Worker stopped");
}

/// Queues frames and starts a write when none is in flight.
struct UringSink<'a> {
    shared: &'a Shared,
}

impl Deliver<Conn> for UringSink<'_> {
    fn deliver(&mut self, session: &mut UringSession, frame: Bytes) -> io::Result<()> {
        session.queue_frame(frame);
        let (link, action) = step(session.stream.link, Completion::Enqueued);
        session.stream.link = link;
        if action == Action::SubmitWrite {
            let buf = session.outbound_mut().take_coalesced();
            self.shared
                .submit_write(session.id, session.stream.fd(), buf, 0)?;
        }
        Ok(())
    }
}

impl Shared {
    /// Feed one event to a session's state machine.
    ///
    /// Returns `Action::None` for sessions that are no longer registered.
    fn advance(
        sessions: &mut SessionRegistry<Conn>,
        id: SessionId,
        event: Completion,
    ) -> Action {
        let Some(session) = sessions.get_mut(id) else {
            return Action::None;
        };
        let (link, action) = step(session.stream.link, event);
        session.stream.link = link;
        action
    }

    /// Register the session for an accept completion. The reaper has
    /// already re-armed the accept.
    fn on_accept(&self, result: i32) {
        if result < 0 {
            let e = os_error(result);
            self.stats.accept_failed();
            warn!(error = %e, "Accept failed");
            return;
        }

        // SAFETY: a successful accept completion returns a new socket we own.
        let socket = unsafe { TcpStream::from_raw_fd(result) };
        let peer = match socket.peer_addr() {
            Ok(peer) => peer,
            Err(e) => {
                self.stats.accept_failed();
                warn!(error = %e, "Accepted socket has no peer address");
                return;
            }
        };

        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut session = Session::new(id, peer, Conn::new(socket));

        // Holding the lock keeps the first read's completion from being
        // handled before the session is registered.
        let mut sessions = lock(&self.sessions);

        let (link, action) = step(session.stream.link, Completion::Accepted);
        session.stream.link = link;
        if action == Action::SubmitRead {
            let buf = vec![0u8; self.config.read_chunk];
            if let Err(e) = self.submit_read(id, session.stream.fd(), buf) {
                let reason = CloseReason::RegisterFailed(e);
                warn!(session = %id, peer = %peer, reason = %reason, "Session rejected");
                return;
            }
        }

        session.activate();
        info!(session = %id, peer = %peer, label = %session.label, "Session connected");
        sessions.add(session);
        self.stats.session_opened();
    }

    fn on_read(&self, id: SessionId, result: i32, buf: Vec<u8>) {
        let mut sessions = lock(&self.sessions);

        match Self::advance(&mut sessions, id, Completion::ReadDone { result }) {
            Action::Decode => {}
            Action::Close => {
                let reason = if result == 0 {
                    CloseReason::EndOfStream
                } else {
                    CloseReason::ReadError(os_error(result))
                };
                self.close_session(&mut sessions, id, reason);
                return;
            }
            // Late completion for a closed session.
            _ => return,
        }

        let n = result as usize;
        debug!(session = %id, bytes = n, "Read completed");
        let (label, decoded) = match sessions.get_mut(id) {
            Some(session) => {
                session.buffer_input(&buf[..n]);
                (
                    session.label.clone(),
                    session.decode_frames(self.config.max_line_len),
                )
            }
            None => return,
        };

        let (frames, too_large) = decoded;
        let mut close = None;
        for frame in frames {
            self.stats.frame_received();
            let action = classify(&frame, &self.config.quit_token, self.config.quit_policy);
            if action.forwards() {
                let mut sink = UringSink { shared: self };
                let report = broadcast(&mut sessions, id, &label, &frame, &mut sink);
                self.stats.frames_forwarded(report.delivered);
                for (peer, e) in report.failed {
                    self.stats.delivery_failed();
                    self.close_session(&mut sessions, peer, CloseReason::WriteError(e));
                }
            }
            if action.closes() {
                close = Some(CloseReason::Quit);
                break;
            }
        }
        // Frames ahead of an oversized line were forwarded above.
        if close.is_none() {
            close = too_large.map(CloseReason::FrameTooLarge);
        }

        let event = Completion::Decoded {
            close: close.is_some(),
        };
        match Self::advance(&mut sessions, id, event) {
            Action::SubmitRead => {
                let fd = match sessions.get(id) {
                    Some(session) => session.stream.fd(),
                    None => return,
                };
                if let Err(e) = self.submit_read(id, fd, buf) {
                    self.close_session(&mut sessions, id, CloseReason::ReadError(e));
                }
            }
            Action::Close => {
                let reason = close.unwrap_or(CloseReason::Quit);
                self.close_session(&mut sessions, id, reason);
            }
            _ => {}
        }
    }

    fn on_write(&self, id: SessionId, result: i32, buf: Vec<u8>, offset: usize) {
        let mut sessions = lock(&self.sessions);

        let next = resume_offset(buf.len(), offset, result);
        let remaining = buf.len() - next;
        let (queued, fd) = match sessions.get(id) {
            Some(session) => (session.has_pending_output(), session.stream.fd()),
            // Late completion for a closed session; the buffer drops here.
            None => return,
        };

        debug!(session = %id, result, remaining, "Write completed");
        let event = Completion::WriteDone {
            result,
            remaining,
            queued,
        };
        let submitted = match Self::advance(&mut sessions, id, event) {
            Action::SubmitWrite if remaining > 0 => self.submit_write(id, fd, buf, next),
            Action::SubmitWrite => match sessions.get_mut(id) {
                Some(session) => {
                    let coalesced = session.outbound_mut().take_coalesced();
                    self.submit_write(id, fd, coalesced, 0)
                }
                None => Ok(()),
            },
            Action::Close => {
                let e = if result == 0 {
                    io::Error::new(io::ErrorKind::WriteZero, "write returned 0")
                } else {
                    os_error(result)
                };
                Err(e)
            }
            _ => Ok(()),
        };

        if let Err(e) = submitted {
            self.close_session(&mut sessions, id, CloseReason::WriteError(e));
        }
    }

    /// Put an accept in flight, or fail once retries are exhausted.
    fn arm_accept(&self) -> io::Result<()> {
        retry(ACCEPT_REARM_ATTEMPTS, ACCEPT_REARM_BACKOFF, || self.submit_accept()).map_err(|e| {
            error!(error = %e, "Failed to arm accept");
            e
        })
    }

    fn submit_accept(&self) -> io::Result<()> {
        let token = lock(&self.ops).alloc(Op::Accept);

        let accept = opcode::Accept::new(
            types::Fd(self.listener.as_raw_fd()),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
        .build()
        .user_data(token);

        // SAFETY: accept references no user memory.
        unsafe { self.ring.push(&accept) }.map_err(|e| {
            lock(&self.ops).free(token);
            e
        })
    }

    fn submit_read(&self, id: SessionId, fd: RawFd, mut buf: Vec<u8>) -> io::Result<()> {
        let ptr = buf.as_mut_ptr();
        let len = submission_len(buf.len());
        // Moving the Vec into the table keeps its heap allocation in place.
        let token = lock(&self.ops).alloc(Op::Read { session: id, buf });

        let recv = opcode::Recv::new(types::Fd(fd), ptr, len)
            .build()
            .user_data(token);

        // SAFETY: the buffer is owned by the token table until the
        // completion for `token` is reaped.
        unsafe { self.ring.push(&recv) }.map_err(|e| {
            lock(&self.ops).free(token);
            e
        })
    }

    fn submit_write(&self, id: SessionId, fd: RawFd, buf: Vec<u8>, offset: usize) -> io::Result<()> {
        let ptr = buf[offset..].as_ptr();
        let len = submission_len(buf.len() - offset);
        let token = lock(&self.ops).alloc(Op::Write {
            session: id,
            buf,
            offset,
        });

        let write = opcode::Write::new(types::Fd(fd), ptr, len)
            .build()
            .user_data(token);

        // SAFETY: as for reads, the token table owns the buffer.
        unsafe { self.ring.push(&write) }.map_err(|e| {
            lock(&self.ops).free(token);
            e
        })
    }

    /// Single close path. Idempotent: a session already removed is ignored.
    fn close_session(
        &self,
        sessions: &mut SessionRegistry<Conn>,
        id: SessionId,
        reason: CloseReason,
    ) {
        let Some(mut session) = sessions.remove(id) else {
            return;
        };
        // Forces any outstanding read or write to complete.
        let _ = session.stream.socket.shutdown(Shutdown::Both);
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
            registered = sessions.len(),
            "Session count"
        );
    }
}
