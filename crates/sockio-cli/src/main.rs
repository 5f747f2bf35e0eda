//! # sockio
//!
//! Command line client for socket.io servers.
//!
//! ## Usage
//!
//! ```bash
//! # Connect with default settings
//! sockio
//!
//! # Run with custom config
//! sockio --config /path/to/sockio.toml
//!
//! # Override the server URL
//! SOCKIO_URL=https://rt.example.com sockio
//! ```
//!
//! Each line read from stdin is emitted as `<namespace> <event> [json]`,
//! e.g. `/chat message {"text":"hi"}`.

mod config;
mod metrics;
mod session;

use anyhow::{bail, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sockio=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut args = std::env::args().skip(1);
    let config = match (args.next().as_deref(), args.next()) {
        (None, _) => config::Config::load()?,
        (Some("--config"), Some(path)) => config::Config::from_file(path)?,
        (Some(other), _) => bail!("Unexpected argument: {other} (usage: sockio [--config PATH])"),
    };

    tracing::info!("Connecting to {}", config.client.url);

    session::run(config).await
}
