use clap::Parser;
use fleetcast_server::config::{Args, ServerConfig};
use fleetcast_server::network::Server;
use log::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from(Args::parse());

    info!("Starting fleet presence server on {}", config.bind_addr);
    info!(
        "Snapshot every {:?} to {}",
        config.snapshot_interval,
        config.snapshot_path.display()
    );
    if let Some(staleness) = config.staleness {
        info!("Entities go offline after {:?} without a report", staleness);
    }

    let server = Server::new(config).await?;
    server.run().await?;

    Ok(())
}
