use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use rover_signal::config::{Cli, Command};
use rover_signal::util::init_log;
use rover_signal::{peer, server, RelayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_log();

    match cli.command {
        Command::Server(args) => {
            let config = RelayConfig::from(args);
            config.validate()?;

            info!("Starting signaling relay...");
            let listener = TcpListener::bind(config.listen).await?;
            server::run(listener, &config).await?;
        }
        Command::Peer(args) => {
            info!("Starting WebRTC peer as {:?}...", args.role);
            peer::run(args).await?;
            info!("Peer completed successfully");
        }
    }

    Ok(())
}
