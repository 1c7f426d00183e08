//! # Fleet Client Library
//!
//! Client-side access to a fleet presence server, used by the `fleetcast`
//! command line tool and by the workspace integration tests.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! - Posting position reports to the ingress endpoint
//! - Listing the current presence set
//! - Tailing the realtime channel over WebSocket
//!
//! ### Simulation Module (`simulation`)
//! - Random-walk position generator for a simulated device, always
//!   producing in-range coordinates

pub mod network;
pub mod simulation;
