//! # Fleet Presence Server Library
//!
//! This library provides the presence/broadcast engine behind the fleet
//! tracker. It ingests position reports from mobile devices, keeps the
//! authoritative presence state of every device, pushes each accepted
//! change to all connected observers, and periodically renders a map
//! snapshot of the whole fleet.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Presence State
//! The server holds the definitive location, liveness and last-seen time of
//! every tracked entity. A record is created by the first accepted report
//! for an id and is never deleted, only marked offline.
//!
//! ### Durable Writes
//! Every change is mirrored to a persistent backend before it becomes
//! visible. A failed mirror write rejects the report and leaves the
//! in-memory state untouched.
//!
//! ### Realtime Fan-out
//! Each accepted report produces exactly one event, delivered to every
//! connected observer through its own bounded buffer. Slow observers lose
//! events or get disconnected; they never slow down reporters or peers.
//!
//! ### Fleet Snapshot
//! Independent of traffic, a scheduler renders the full fleet on a fixed
//! cadence and atomically replaces the published artifact.
//!
//! ## Module Organization
//!
//! - `store`: sharded in-memory presence map with durability mirror
//! - `persistence`: backend trait, in-memory and file-backed backends
//! - `updater`: report validation, application, staleness policy
//! - `hub`: observer registry and per-observer bounded delivery
//! - `snapshot`: renderer and artifact traits, HTML map, periodic scheduler
//! - `query`: read-only view of the presence set
//! - `network`: axum routes, realtime WebSocket channel, server lifecycle
//! - `config`: command line / environment configuration
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use fleetcast_server::config::ServerConfig;
//! use fleetcast_server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         bind_addr: "127.0.0.1:5050".to_string(),
//!         ..Default::default()
//!     };
//!
//!     // Runs until Ctrl+C, then drains in-flight reports
//!     Server::new(config).await?.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod hub;
pub mod network;
pub mod persistence;
pub mod presence;
pub mod query;
pub mod snapshot;
pub mod store;
pub mod updater;
pub mod utils;

pub use error::{BackendError, PresenceError, RenderError};
pub use hub::{BroadcastHub, HubConfig, ObserverHandle, OverflowPolicy};
pub use presence::{PresenceEvent, PresenceRecord};
pub use query::QueryService;
pub use snapshot::SnapshotScheduler;
pub use store::PresenceStore;
pub use updater::PresenceUpdater;
