use super::swarm::{PendingRequest, Swarm};
use crate::chunker::{self, Package, Piece};
use crate::constants::{PIPELINE_BUDGET, REQUEST_TIMEOUT};
use crate::data_structures::Bitmap;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tracing::{debug, warn};

/// What the policy wants done. The manager never touches the network
/// itself; the coordinator dispatches these.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    RequestChunk {
        peer: String,
        content: String,
        index: usize,
    },
    SendPiece {
        peer: String,
        piece: Piece,
    },
    BroadcastHave {
        content: String,
        index: usize,
    },
    Progress {
        content: String,
        percent: f32,
    },
    Complete {
        content: String,
    },
}

/// Piece accounting and selection for every active content. Peer bitfields
/// are owned by the coordinator and passed in per call; deterministic peer
/// scan order comes from the ordered map.
pub struct SwarmManager {
    swarms: HashMap<String, Swarm>,
}

impl SwarmManager {
    pub fn new() -> Self {
        Self {
            swarms: HashMap::new(),
        }
    }

    pub fn contains(&self, content: &str) -> bool {
        self.swarms.contains_key(content)
    }

    pub fn get(&self, content: &str) -> Option<&Swarm> {
        self.swarms.get(content)
    }

    pub fn is_leeching(&self, content: &str) -> bool {
        self.swarms
            .get(content)
            .map(|swarm| !swarm.is_seeder())
            .unwrap_or(false)
    }

    /// Contents we hold at least one piece of and can push to a fresh peer.
    pub fn sharable(&self) -> Vec<String> {
        let mut contents: Vec<String> = self
            .swarms
            .values()
            .filter(|swarm| swarm.owned.weight() > 0)
            .map(|swarm| swarm.content_id().to_string())
            .collect();
        contents.sort();
        contents
    }

    pub fn leeching_contents(&self) -> Vec<String> {
        let mut contents: Vec<String> = self
            .swarms
            .values()
            .filter(|swarm| !swarm.is_seeder())
            .map(|swarm| swarm.content_id().to_string())
            .collect();
        contents.sort();
        contents
    }

    /// Contents with their completeness, for (re-)announcing.
    pub fn announceable(&self) -> Vec<(String, bool)> {
        let mut contents: Vec<(String, bool)> = self
            .swarms
            .values()
            .map(|swarm| (swarm.content_id().to_string(), swarm.is_seeder()))
            .collect();
        contents.sort();
        contents
    }

    pub fn create_seeder(&mut self, package: Package, pieces: Vec<Piece>) {
        let content = package.content_id.clone();
        self.swarms.insert(content, Swarm::seeder(package, pieces));
    }

    /// Returns false (and changes nothing) when the content is already
    /// known; duplicate metadata is a no-op.
    pub fn create_leecher(&mut self, package: Package, now: Instant) -> bool {
        if self.swarms.contains_key(&package.content_id) {
            return false;
        }

        let content = package.content_id.clone();
        self.swarms.insert(content, Swarm::leecher(package, now));
        true
    }

    pub fn remove(&mut self, content: &str) {
        self.swarms.remove(content);
    }

    pub fn clear(&mut self) {
        self.swarms.clear();
    }

    /// A verified inbound piece. Emits `BroadcastHave` and `Progress`, then
    /// either `Complete` or the next wave of requests. A piece that fails
    /// its checksum only releases the request slot.
    pub fn handle_piece(
        &mut self,
        peer: &str,
        piece: Piece,
        bits: &BTreeMap<String, Bitmap>,
        now: Instant,
    ) -> Vec<Action> {
        let content = piece.content_id.clone();

        let Some(swarm) = self.swarms.get_mut(&content) else {
            warn!("piece {} for unknown content {}", piece.index, content);
            return Vec::new();
        };

        if piece.index >= swarm.total {
            warn!(
                "piece index {} out of range for {} (total {})",
                piece.index, content, swarm.total
            );
            return Vec::new();
        }

        if !chunker::verify(&piece) {
            warn!(
                "checksum mismatch on piece {} of {} from {}",
                piece.index, content, peer
            );
            swarm.requested.remove(&piece.index);
            return Vec::new();
        }

        if swarm.owned.get(piece.index) {
            debug!("duplicate piece {} of {} from {}", piece.index, content, peer);
            swarm.requested.remove(&piece.index);
            return Vec::new();
        }

        let index = piece.index;
        swarm.requested.remove(&index);
        swarm.owned.change(index, true);
        swarm.received.insert(index, piece);

        let mut actions = vec![
            Action::BroadcastHave {
                content: content.clone(),
                index,
            },
            Action::Progress {
                content: content.clone(),
                percent: swarm.progress_percent(),
            },
        ];

        if swarm.is_seeder() {
            actions.push(Action::Complete { content });
        } else {
            actions.extend(self.request_more(&content, bits, now));
        }

        actions
    }

    /// Rarest-first selection across every known peer, pipelined up to the
    /// per-peer budget. Peers are visited in ascending id order and needed
    /// pieces in ascending (rarity, index) order.
    pub fn request_more(
        &mut self,
        content: &str,
        bits: &BTreeMap<String, Bitmap>,
        now: Instant,
    ) -> Vec<Action> {
        let Some(swarm) = self.swarms.get_mut(content) else {
            return Vec::new();
        };

        let mut needed: Vec<usize> = (0..swarm.total).filter(|i| swarm.wants(*i)).collect();
        if needed.is_empty() {
            return Vec::new();
        }

        let rarity =
            |index: usize| bits.values().filter(|bitfield| bitfield.get(index)).count();
        needed.sort_by_key(|index| (rarity(*index), *index));

        let mut actions = Vec::new();
        for (peer, bitfield) in bits {
            if bitfield.is_empty() {
                continue;
            }

            let mut in_flight = swarm.in_flight_to(peer);

            for index in &needed {
                if in_flight >= PIPELINE_BUDGET {
                    break;
                }
                if swarm.requested.contains_key(index) || !bitfield.get(*index) {
                    continue;
                }

                swarm.requested.insert(
                    *index,
                    PendingRequest {
                        peer: peer.clone(),
                        at: now,
                    },
                );
                actions.push(Action::RequestChunk {
                    peer: peer.clone(),
                    content: content.to_string(),
                    index: *index,
                });
                in_flight += 1;
            }
        }

        actions
    }

    /// Single bootstrap request toward a peer whose bitfield we just
    /// learned; the pipeline widens once pieces start flowing back.
    pub fn request_from_peer(
        &mut self,
        peer: &str,
        content: &str,
        bitfield: &Bitmap,
        now: Instant,
    ) -> Vec<Action> {
        let Some(swarm) = self.swarms.get_mut(content) else {
            return Vec::new();
        };

        let Some(index) = (0..swarm.total).find(|i| swarm.wants(*i) && bitfield.get(*i)) else {
            return Vec::new();
        };

        swarm.requested.insert(
            index,
            PendingRequest {
                peer: peer.to_string(),
                at: now,
            },
        );

        vec![Action::RequestChunk {
            peer: peer.to_string(),
            content: content.to_string(),
            index,
        }]
    }

    /// Serve an owned piece back; anything else is log-only.
    pub fn handle_request(&mut self, peer: &str, content: &str, index: usize) -> Vec<Action> {
        let Some(swarm) = self.swarms.get(content) else {
            debug!("request from {} for unknown content {}", peer, content);
            return Vec::new();
        };

        if !swarm.owned.get(index) {
            debug!("request from {} for piece {} we don't own", peer, index);
            return Vec::new();
        }

        let Some(piece) = swarm.received.get(&index) else {
            warn!("owned piece {} of {} has no stored bytes", index, content);
            return Vec::new();
        };

        vec![Action::SendPiece {
            peer: peer.to_string(),
            piece: piece.clone(),
        }]
    }

    /// Drop requests that have aged out so the next selection pass can
    /// re-assign them to any peer.
    pub fn release_timed_out(&mut self, content: &str, now: Instant) {
        let Some(swarm) = self.swarms.get_mut(content) else {
            return;
        };

        swarm.requested.retain(|index, request| {
            let keep = now.duration_since(request.at) < REQUEST_TIMEOUT;
            if !keep {
                debug!("request for piece {} to {} timed out", index, request.peer);
            }
            keep
        });
    }

    /// Release every in-flight request pointed at a departed peer, across
    /// all contents.
    pub fn release_peer(&mut self, peer: &str) {
        for swarm in self.swarms.values_mut() {
            swarm.requested.retain(|_, request| request.peer != peer);
        }
    }

    /// All stored pieces of a content, ready for reassembly.
    pub fn stored_pieces(&self, content: &str) -> Vec<Piece> {
        self.swarms
            .get(content)
            .map(|swarm| swarm.received.values().cloned().collect())
            .unwrap_or_default()
    }
}
