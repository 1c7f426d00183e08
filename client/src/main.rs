use clap::{Parser, Subcommand};
use fleetcast_client::network::{ClientError, FleetClient};
use fleetcast_client::simulation::RandomWalk;
use fleetcast_shared::{ChannelMessage, PositionReport};
use log::{info, warn};
use rand::Rng;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base URL of the presence server
    #[arg(short = 's', long, env = "FLEETCAST_SERVER", default_value = "http://127.0.0.1:5050")]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a single position report
    Report {
        #[arg(long)]
        id: String,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lng: f64,
        #[arg(short = 'a', long)]
        accuracy: Option<f64>,
        /// Report the entity as offline
        #[arg(long)]
        offline: bool,
    },

    /// Drive one simulated device on a random walk
    Simulate {
        #[arg(long)]
        id: String,

        /// Starting latitude (random if omitted)
        #[arg(long, allow_hyphen_values = true)]
        lat: Option<f64>,

        /// Starting longitude (random if omitted)
        #[arg(long, allow_hyphen_values = true)]
        lng: Option<f64>,

        /// Stop after this many reports (runs forever if omitted)
        #[arg(short = 'c', long)]
        count: Option<u64>,

        /// Milliseconds between reports
        #[arg(short = 'i', long, default_value = "1000")]
        interval_ms: u64,

        /// Maximum step per report in degrees
        #[arg(long, default_value = "0.01")]
        step_deg: f64,
    },

    /// Print the current presence set
    List,

    /// Print realtime updates as they arrive
    Watch,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let client = FleetClient::new(&args.server);
    info!("Using server {}", client.base_url());

    match args.command {
        Command::Report {
            id,
            lat,
            lng,
            accuracy,
            offline,
        } => {
            let mut report = PositionReport::new(id.clone(), lat, lng).with_online(!offline);
            if let Some(accuracy) = accuracy {
                report = report.with_accuracy(accuracy);
            }
            match client.report(&report).await {
                Ok(()) => println!("success: {} at ({}, {})", id, lat, lng),
                Err(ClientError::Rejected(message)) => println!("error: {}", message),
                Err(e) => return Err(e.into()),
            }
        }
        Command::Simulate {
            id,
            lat,
            lng,
            count,
            interval_ms,
            step_deg,
        } => {
            let mut rng = rand::thread_rng();
            let lat = lat.unwrap_or_else(|| rng.gen_range(-60.0..60.0));
            let lng = lng.unwrap_or_else(|| rng.gen_range(-170.0..170.0));
            let walk = RandomWalk::new(id, lat, lng, step_deg);
            simulate(&client, walk, interval_ms, count).await;
        }
        Command::List => {
            for user in client.list().await? {
                match user.location {
                    Some(loc) => println!(
                        "{}\t{:.6}\t{:.6}\t{}\t{}",
                        user.id,
                        loc.lat,
                        loc.lng,
                        loc.accuracy,
                        if user.online { "online" } else { "offline" }
                    ),
                    None => println!("{}\t-\t-\t-\toffline", user.id),
                }
            }
        }
        Command::Watch => {
            client
                .watch(|message| {
                    match message {
                        ChannelMessage::Message { msg } => info!("Server says: {}", msg),
                        ChannelMessage::LocationUpdate {
                            id,
                            lat,
                            lng,
                            accuracy,
                            online,
                        } => println!(
                            "{}\t{:.6}\t{:.6}\t{}\t{}",
                            id,
                            lat,
                            lng,
                            accuracy,
                            if online { "online" } else { "offline" }
                        ),
                    }
                    true
                })
                .await?;
        }
    }

    Ok(())
}

async fn simulate(
    client: &FleetClient,
    mut walk: RandomWalk,
    interval_ms: u64,
    count: Option<u64>,
) {
    let mut rng = rand::thread_rng();
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    let mut sent = 0u64;

    info!("Simulating device every {}ms", interval_ms);

    while count.map_or(true, |limit| sent < limit) {
        interval.tick().await;

        let report = walk.step(&mut rng);
        match client.report(&report).await {
            Ok(()) => {
                let (lat, lng) = walk.position();
                info!("Reported ({:.5}, {:.5})", lat, lng);
            }
            Err(e) => warn!("Report {} failed: {}", walk.produced(), e),
        }
        sent += 1;
    }

    info!("Simulation finished after {} reports", sent);
}
