use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// What a session link reports upward, keyed by the peer id it was opened
/// for. Frames for one peer arrive in send order; nothing is guaranteed
/// across peers.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A local candidate to relay to the remote side.
    Candidate(String),
    Connected,
    ChannelOpen,
    Frame(Bytes),
    Disconnected,
    Failed,
    Closed,
}

/// One reliable, ordered, bidirectional stream to a single peer, driven by
/// session descriptions and candidates that the caller relays through the
/// tracker. This is the seam to the external ICE/DTLS stack.
#[async_trait]
pub trait SessionLink: Send + Sync {
    async fn create_offer(&mut self, ice_restart: bool) -> Result<String>;
    async fn accept_offer(&mut self, offer: &str) -> Result<String>;
    async fn accept_answer(&mut self, answer: &str) -> Result<()>;
    async fn add_remote_candidate(&mut self, candidate: &str) -> Result<()>;
    async fn send(&mut self, frame: Bytes) -> Result<()>;
    async fn close(&mut self);
}

pub trait LinkFactory: Send + Sync {
    /// Open a fresh link toward `peer_id`; its events land on `events`
    /// tagged with that id.
    fn open(
        &mut self,
        peer_id: &str,
        events: mpsc::Sender<(String, LinkEvent)>,
    ) -> Box<dyn SessionLink>;
}
