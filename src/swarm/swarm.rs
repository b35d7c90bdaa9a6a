use crate::chunker::{Package, Piece};
use crate::data_structures::Bitmap;
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub peer: String,
    pub at: Instant,
}

/// Per-content transfer state. `owned` only ever grows; a piece index is
/// never both owned and requested; `received` keeps verified bytes around
/// so they can be served after reassembly.
#[derive(Debug)]
pub struct Swarm {
    pub package: Package,
    pub owned: Bitmap,
    pub requested: HashMap<usize, PendingRequest>,
    pub received: HashMap<usize, Piece>,
    pub total: usize,
    pub started_at: Option<Instant>,
}

impl Swarm {
    pub fn seeder(package: Package, pieces: Vec<Piece>) -> Self {
        let total = package.total_pieces();

        let mut owned = Bitmap::new(total);
        let mut received = HashMap::with_capacity(total);
        for piece in pieces {
            owned.change(piece.index, true);
            received.insert(piece.index, piece);
        }

        Self {
            package,
            owned,
            requested: HashMap::new(),
            received,
            total,
            started_at: None,
        }
    }

    pub fn leecher(package: Package, now: Instant) -> Self {
        let total = package.total_pieces();

        Self {
            package,
            owned: Bitmap::new(total),
            requested: HashMap::new(),
            received: HashMap::with_capacity(total),
            total,
            started_at: Some(now),
        }
    }

    pub fn content_id(&self) -> &str {
        &self.package.content_id
    }

    pub fn is_seeder(&self) -> bool {
        self.owned.weight() == self.total
    }

    pub fn progress_percent(&self) -> f32 {
        self.owned.weight() as f32 * 100.0 / self.total as f32
    }

    pub fn wants(&self, index: usize) -> bool {
        index < self.total && !self.owned.get(index) && !self.requested.contains_key(&index)
    }

    pub fn in_flight_to(&self, peer: &str) -> usize {
        self.requested
            .values()
            .filter(|request| request.peer == peer)
            .count()
    }
}
