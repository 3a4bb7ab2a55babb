//! Linux io_uring event loop implementation.
//!
//! Completion-based I/O: each operation is submitted once and its
//! completion, delivered on a worker pool, re-arms the next one.

mod event_loop;
mod machine;
mod ring;
mod token;

use crate::config::Config;
use crate::runtime::Stats;
use std::net::TcpListener;
use std::sync::Arc;

/// Run the server using the io_uring backend.
pub fn run(listener: TcpListener, config: Config, stats: Arc<Stats>) -> std::io::Result<()> {
    event_loop::run(listener, config, stats)
}
