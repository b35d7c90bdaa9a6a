mod manager;
mod swarm;

pub use manager::{Action, SwarmManager};
pub use swarm::Swarm;
