use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub peer_id: String,
    pub complete: bool,
}

/// Signaling envelope between a participant and the tracker. The session
/// descriptions and candidates are opaque payloads; the tracker only routes
/// on `to`. Anything that fails to parse is an unknown type to be logged
/// and dropped, never answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    #[serde(rename_all = "camelCase")]
    Welcome { peer_id: String },
    Announce {
        content: String,
        complete: bool,
    },
    AnnounceResponse {
        content: String,
        peers: Vec<PeerSummary>,
    },
    #[serde(rename_all = "camelCase")]
    PeerJoinedSwarm {
        content: String,
        peer_id: String,
        complete: bool,
        peers: Vec<PeerSummary>,
    },
    #[serde(rename_all = "camelCase")]
    PeerLeftSwarm { content: String, peer_id: String },
    Leave {
        content: String,
    },
    RequestConnection {
        #[serde(default)]
        from: String,
    },
    Offer {
        from: String,
        to: String,
        payload: String,
    },
    Answer {
        from: String,
        to: String,
        payload: String,
    },
    IceCandidate {
        from: String,
        to: String,
        payload: String,
    },
}

impl Envelope {
    pub fn decode(raw: &str) -> Result<Envelope> {
        serde_json::from_str(raw).context("malformed signaling envelope")
    }

    pub fn encode(&self) -> String {
        // all variants are plain strings and bools, serialization can't fail
        serde_json::to_string(self).unwrap_or_default()
    }
}
