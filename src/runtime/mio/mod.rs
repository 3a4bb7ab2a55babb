//! mio-based event loop implementation.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).
//! One thread owns the poll, the listener and every session.

mod event_loop;

use crate::config::Config;
use crate::runtime::Stats;
use std::net::TcpListener;
use std::sync::Arc;

/// Run the server using the mio backend.
pub fn run(listener: TcpListener, config: Config, stats: Arc<Stats>) -> std::io::Result<()> {
    event_loop::run(listener, config, stats)
}
