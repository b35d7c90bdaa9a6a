pub mod chunker;
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod data_structures;
mod macros;
pub mod protocol;
pub mod shutdown;
pub mod swarm;
pub mod tracker;
pub mod transport;
