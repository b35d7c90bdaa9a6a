use crate::chunker::Package;
use bytes::Bytes;

/// What the engine pushes to the embedding scene. Fire-and-forget; a
/// missing or slow consumer never wedges the transfer machinery.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    PeerConnected {
        peer_id: String,
    },
    PeerDisconnected {
        peer_id: String,
    },
    /// Full artifact reassembled and verified; the consumer loads the blob
    /// and applies the placement from the package.
    ModelReceived {
        package: Package,
        data: Bytes,
    },
    /// 0..=100, monotonic within one transfer.
    DownloadProgress {
        content: String,
        percent: f32,
    },
}
