//! Command-line and environment configuration

use crate::hub::{HubConfig, OverflowPolicy};
use clap::{Parser, ValueEnum};
use fleetcast_shared::{DEFAULT_PORT, DEFAULT_SNAPSHOT_INTERVAL_SECS};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OverflowArg {
    DropOldest,
    DropNewest,
}

impl From<OverflowArg> for OverflowPolicy {
    fn from(arg: OverflowArg) -> Self {
        match arg {
            OverflowArg::DropOldest => OverflowPolicy::DropOldest,
            OverflowArg::DropNewest => OverflowPolicy::DropNewest,
        }
    }
}

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
pub struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, env = "FLEETCAST_HOST", default_value = "0.0.0.0")]
    pub host: String,
    /// Server port to listen on
    #[clap(short, long, env = "FLEETCAST_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// Directory for durable presence records; in-memory only when unset
    #[clap(long, env = "FLEETCAST_DATA_DIR")]
    pub data_dir: Option<PathBuf>,
    /// Where the rendered fleet snapshot is written
    #[clap(long, env = "FLEETCAST_SNAPSHOT_PATH", default_value = "templates/map.html")]
    pub snapshot_path: PathBuf,
    /// Seconds between snapshot renders
    #[clap(long, env = "FLEETCAST_SNAPSHOT_INTERVAL", default_value_t = DEFAULT_SNAPSHOT_INTERVAL_SECS)]
    pub snapshot_interval: u64,
    /// Events buffered per observer before the overflow policy applies
    #[clap(long, env = "FLEETCAST_OBSERVER_BUFFER", default_value = "64")]
    pub observer_buffer: usize,
    /// Which event to drop when an observer's buffer is full
    #[clap(long, env = "FLEETCAST_OVERFLOW", value_enum, default_value = "drop-oldest")]
    pub overflow: OverflowArg,
    /// How long an observer may stay backed up before it is disconnected
    #[clap(long, env = "FLEETCAST_DELIVERY_TIMEOUT_MS", default_value = "5000")]
    pub delivery_timeout_ms: u64,
    /// Seconds without a report before an entity is marked offline
    #[clap(long, env = "FLEETCAST_STALENESS")]
    pub staleness: Option<u64>,
    /// Snapshot map center latitude
    #[clap(long, env = "FLEETCAST_MAP_LAT", default_value = "0", allow_hyphen_values = true)]
    pub map_lat: f64,
    /// Snapshot map center longitude
    #[clap(long, env = "FLEETCAST_MAP_LNG", default_value = "0", allow_hyphen_values = true)]
    pub map_lng: f64,
    /// Snapshot map zoom level
    #[clap(long, env = "FLEETCAST_MAP_ZOOM", default_value = "2")]
    pub map_zoom: u8,
}

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub data_dir: Option<PathBuf>,
    pub snapshot_path: PathBuf,
    pub snapshot_interval: Duration,
    pub hub: HubConfig,
    pub staleness: Option<Duration>,
    pub map_center: (f64, f64),
    pub map_zoom: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{}", DEFAULT_PORT),
            data_dir: None,
            snapshot_path: PathBuf::from("templates/map.html"),
            snapshot_interval: Duration::from_secs(DEFAULT_SNAPSHOT_INTERVAL_SECS),
            hub: HubConfig::default(),
            staleness: None,
            map_center: (0.0, 0.0),
            map_zoom: 2,
        }
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            bind_addr: format!("{}:{}", args.host, args.port),
            data_dir: args.data_dir,
            snapshot_path: args.snapshot_path,
            snapshot_interval: Duration::from_secs(args.snapshot_interval.max(1)),
            hub: HubConfig {
                buffer_capacity: args.observer_buffer.max(1),
                overflow: args.overflow.into(),
                delivery_timeout: Duration::from_millis(args.delivery_timeout_ms),
            },
            staleness: args.staleness.map(Duration::from_secs),
            map_center: (args.map_lat, args.map_lng),
            map_zoom: args.map_zoom,
        }
    }
}
