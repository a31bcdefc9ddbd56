//! echo-reactor: a single-threaded TCP line echo server
//!
//! Every newline-terminated line a client sends is written back to that
//! client unchanged. All clients are served from one thread by a
//! readiness-based reactor loop instead of a thread per connection.
//!
//! Features:
//! - Partial lines are held until their newline arrives
//! - Partial writes resume where they left off
//! - Clean shutdown on SIGINT/SIGTERM
//! - Configuration via CLI arguments or TOML file

mod config;
mod runtime;

use config::Config;
use tracing::info;
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
        host = %config.host,
        port = config.port,
        backlog = config.backlog,
        max_connections = config.max_connections,
        "Starting echo-reactor"
    );

    runtime::run(config)?;
    Ok(())
}
