//! bmeter-server: broadcasts synthetic frames to every connected client.
//!
//! Configuration via CLI arguments or TOML file; see `--help`.

use bmeter::config::ServerConfig;
use bmeter::server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = ServerConfig::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let addr = config.bind;
    let server = Server::bind(config)
        .inspect_err(|e| error!(addr = %addr, error = %e, "Failed to open listener"))?;
    let stats = server.run()?;
    info!(
        failed_ticks = stats.failed_ticks,
        closed_on_error = stats.sessions_closed_on_error,
        closed_on_shutdown = stats.sessions_closed_on_shutdown,
        "...Finished"
    );
    Ok(())
}
