use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use switchyard::{Server, ServerConfig, instances};

#[derive(Parser)]
#[command(name = "switchyard", version, about = "HTTP server with a searchable live-client registry")]
struct Cli {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Plain listening address, repeatable; a trailing '+' searches upward for a free port
    #[arg(long = "listen")]
    listen: Vec<String>,
    /// TLS listening address, repeatable
    #[arg(long = "listen-tls")]
    listen_tls: Vec<String>,
    /// Instance name
    #[arg(long)]
    name: Option<String>,
}

/// Overrides are applied before validation; `Server::new` validates once.
fn load_config(cli: &Cli) -> Result<ServerConfig> {
    let mut config = match &cli.config {
        Some(path) => ServerConfig::read_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ServerConfig::default(),
    };
    config.apply_overrides(&cli.listen, &cli.listen_tls, cli.name.as_deref());
    Ok(config)
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigquit = signal(SignalKind::quit())?;
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
            _ = sigquit.recv() => {},
            _ = tokio::signal::ctrl_c() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let level = config.logging.level.clone();
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let server = Server::new(config)?;
    instances::register(server.name().to_string(), server.clone());

    server.start().await?;
    for (transport, address) in server.bound_addresses() {
        info!(scheme = transport.scheme(), %address, "listening");
    }

    wait_for_shutdown_signal().await?;
    info!("shutdown signal received");

    server.stop()?;
    server.wait_for_shutdown().await;
    instances::remove(server.name());
    Ok(())
}
