//! bmeter-client: opens connections to a bmeter server and discards the data.
//!
//! Configuration via CLI arguments or TOML file; see `--help`.

use bmeter::client::LoadClient;
use bmeter::config::ClientConfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = ClientConfig::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let client = LoadClient::new(config)
        .inspect_err(|e| error!(error = %e, "Failed to set up event loop"))?;
    let stats = client.run()?;
    info!(
        closed = stats.connections_closed,
        live = stats.live_connections,
        "...Finished"
    );
    Ok(())
}
