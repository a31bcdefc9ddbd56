//! Readiness-driven runtime.
//!
//! A single thread multiplexes the listening socket and every client
//! connection through one poller (epoll on Linux, kqueue on macOS):
//! - `Transport`: non-blocking socket capability set
//! - `LineBuffer`: inbound bytes, drained one complete line at a time
//! - `BufferedConnection` / `ConnectionRegistry`: per-connection state
//! - `Reactor`: the poll / accept / read / write / reap loop

mod buffer;
mod connection;
mod event_loop;
mod listener;
mod transport;

use event_loop::Reactor;
use listener::create_listener;

use crate::config::Config;
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{error, info};

/// Bind the configured address and serve until interrupted.
pub fn run(config: Config) -> std::io::Result<()> {
    let addr = config.addr()?;

    let listener = create_listener(addr, config.backlog).map_err(|e| {
        error!(addr = %addr, error = %e, "Failed to bind listener");
        e
    })?;

    let mut reactor = Reactor::new(
        listener,
        config.max_connections,
        config.events_capacity,
        config.max_buffer_size,
    )?;
    reactor.watch_signals(&[SIGINT, SIGTERM])?;

    info!(
        addr = %reactor.local_addr()?,
        backlog = config.backlog,
        max_connections = config.max_connections,
        max_buffer_size = config.max_buffer_size,
        "Listening"
    );

    reactor.run()?;

    info!("Server stopped");
    Ok(())
}
