//! Server tick systems, run in declaration order by `ServerSimulation::tick`

pub mod client_update;
pub mod connection;
pub mod input;
pub mod movement;
