//! muxchat: a multiplexed broadcast chat server
//!
//! Clients exchange newline-terminated text lines; every line a client
//! sends is forwarded to every other connected client, prefixed with the
//! sender's label.
//!
//! Features:
//! - Readiness backend (mio: epoll/kqueue) on a single thread
//! - Completion backend (io_uring) with a configurable worker pool
//! - Partial-frame reassembly with a bounded line length
//! - `quit` control line to leave the room
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocols;
mod runtime;

use config::Config;
use runtime::Dispatcher;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        backend = ?config.backend,
        workers = config.workers,
        max_line_len = config.max_line_len,
        quit_policy = ?config.quit_policy,
        "Starting muxchat server"
    );

    let dispatcher = match Dispatcher::bind(&config) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!(listen = %config.listen, error = %e, "Failed to bind");
            return Err(e.into());
        }
    };

    info!(addr = %dispatcher.local_addr()?, backend = ?config.backend, "Listening");

    let stats = dispatcher.stats();
    if let Err(e) = dispatcher.run() {
        error!(error = %e, stats = ?stats.snapshot(), "Event loop failed");
        return Err(e.into());
    }
    Ok(())
}
