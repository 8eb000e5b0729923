//! Worldsim
//!
//! An authoritative tile-world server and a predicting client that share one
//! movement model, synchronised over a batched binary protocol on TCP.
//!
//! - `server` runs the fixed-timestep simulation and streams state to clients
//! - `client` predicts its own entity and replicates everyone else
//! - `net` holds the wire format and the tick synchronisation both sides use

pub mod config;
pub mod util;
pub mod game;
pub mod net;
pub mod metrics;
pub mod server;
pub mod client;
