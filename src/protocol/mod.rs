mod envelope;
mod frame;

pub use envelope::{Envelope, PeerSummary};
pub use frame::Frame;
