//! Event-driven runtime for the chat server.
//!
//! Two interchangeable backends drive the same session model:
//! - `mio`: readiness-based, one thread (epoll on Linux, kqueue on macOS)
//! - `uring`: completion-based, io_uring with a worker pool (Linux only)
//!
//! Both share common abstractions:
//! - `Session`: per-connection state and lifecycle
//! - `SessionRegistry`: the set of active sessions
//! - `broadcast`: fan-out of a frame to every other session
//! - `OutboundQueue`: queued frames with partial-write tracking

mod broadcast;
mod buffer;
mod registry;
mod session;
mod stats;

mod mio;

#[cfg(target_os = "linux")]
mod uring;

pub(crate) use registry::SessionRegistry;
pub(crate) use session::{CloseReason, Session, SessionId};
pub use stats::Stats;

use crate::config::{Backend, Config};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

/// Owns the listening socket and runs the configured backend.
pub struct Dispatcher {
    listener: TcpListener,
    config: Config,
    stats: Arc<Stats>,
}

impl Dispatcher {
    /// Bind the listening endpoint. Failure here is fatal to the server.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let listener = create_listener(config.listen, config.backlog)?;
        Ok(Self {
            listener,
            config: config.clone(),
            stats: Arc::new(Stats::new()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Run the event loop on the calling thread. Returns only on a
    /// backend-fatal error.
    pub fn run(self) -> io::Result<()> {
        match self.config.backend {
            Backend::Mio => mio::run(self.listener, self.config, self.stats),
            Backend::Uring => run_uring(self.listener, self.config, self.stats),
        }
    }
}

#[cfg(target_os = "linux")]
fn run_uring(listener: TcpListener, config: Config, stats: Arc<Stats>) -> io::Result<()> {
    uring::run(listener, config, stats)
}

#[cfg(not(target_os = "linux"))]
fn run_uring(_listener: TcpListener, _config: Config, _stats: Arc<Stats>) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "the uring backend is only available on Linux",
    ))
}

/// Create the listening socket with SO_REUSEADDR so restarts do not wait
/// out TIME_WAIT.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
