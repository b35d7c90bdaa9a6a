use crate::constants::PIECE_SIZE;
use crate::unsigned_ceil_div;
use anyhow::{bail, Result};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

const CHECKSUM_MOD: u32 = 65521;

/// Where the reassembled mesh lands in the scene.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub position: [f32; 3],
    pub rotation: [f32; 3],
    pub scale: [f32; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub producer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub created_at_ms: u64,
    pub total_bytes: usize,
    pub piece_count: usize,
}

/// Immutable artifact descriptor. Travels ahead of the pieces so receivers
/// can size their bookkeeping before any data arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub content_id: String,
    pub placement: Placement,
    pub provenance: Provenance,
}

impl Package {
    pub fn total_pieces(&self) -> usize {
        self.provenance.piece_count
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Piece {
    pub content_id: String,
    pub index: usize,
    pub total: usize,
    pub data: Bytes,
    pub checksum: u32,
}

/// Two interleaved modular sums, packed high/low. Detects channel or
/// encoding corruption; carries no authenticity.
pub fn rolling_checksum(data: &[u8]) -> u32 {
    let mut a: u32 = 1;
    let mut b: u32 = 0;

    for x in data {
        a = (a + *x as u32) % CHECKSUM_MOD;
        b = (b + a) % CHECKSUM_MOD;
    }

    (b << 16) | a
}

pub fn verify(piece: &Piece) -> bool {
    rolling_checksum(&piece.data) == piece.checksum
}

/// Slice an artifact into checksummed pieces under a fresh content id.
pub fn prepare(
    data: Bytes,
    placement: Placement,
    producer: &str,
    prompt: Option<String>,
) -> Result<(Package, Vec<Piece>)> {
    if data.is_empty() {
        bail!("refusing to prepare an empty artifact");
    }

    let finite = placement
        .position
        .iter()
        .chain(placement.rotation.iter())
        .chain(placement.scale.iter())
        .all(|v| v.is_finite());
    if !finite {
        bail!("placement must be finite");
    }

    let total = unsigned_ceil_div!(data.len(), PIECE_SIZE);
    let content_id = fresh_content_id();

    let mut pieces = Vec::with_capacity(total);
    for index in 0..total {
        let start = index * PIECE_SIZE;
        let end = data.len().min(start + PIECE_SIZE);
        let chunk = data.slice(start..end);

        pieces.push(Piece {
            content_id: content_id.clone(),
            index,
            total,
            checksum: rolling_checksum(&chunk),
            data: chunk,
        });
    }

    let package = Package {
        content_id,
        placement,
        provenance: Provenance {
            producer: producer.to_string(),
            prompt,
            created_at_ms: now_ms(),
            total_bytes: data.len(),
            piece_count: total,
        },
    };

    Ok((package, pieces))
}

/// Concatenate pieces back into the artifact. Demands a full contiguous
/// cover with the right length at every position.
pub fn assemble(mut pieces: Vec<Piece>) -> Result<Bytes> {
    let Some(first) = pieces.first() else {
        bail!("no pieces to assemble");
    };
    let total = first.total;

    pieces.sort_by_key(|piece| piece.index);

    if pieces.len() != total {
        bail!("expected {} pieces, have {}", total, pieces.len());
    }

    let mut assembled = BytesMut::new();
    for (position, piece) in pieces.iter().enumerate() {
        if piece.index != position {
            bail!("missing piece {}", position);
        }

        let full = piece.data.len() == PIECE_SIZE;
        let last = position == total - 1;
        if !full && !last {
            bail!(
                "piece {} has {} bytes, expected {}",
                position,
                piece.data.len(),
                PIECE_SIZE
            );
        }
        if piece.data.is_empty() {
            bail!("piece {} is empty", position);
        }

        assembled.extend_from_slice(&piece.data);
    }

    Ok(assembled.freeze())
}

/// Unique within a session; timestamp plus randomness, nothing stronger.
fn fresh_content_id() -> String {
    format!("{:x}-{:08x}", now_ms(), rand::random::<u32>())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placement() -> Placement {
        Placement {
            position: [1.0, 2.0, 3.0],
            rotation: [0.0, 0.5, 0.0],
            scale: [1.0, 1.0, 1.0],
        }
    }

    fn artifact(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
    }

    #[test]
    fn checksum_reference_value() {
        assert_eq!(0x11e60398, rolling_checksum(b"Wikipedia"));
        assert_eq!(1, rolling_checksum(b""));
    }

    #[test]
    fn round_trip() {
        let data = artifact(32 * 1024);
        let (package, pieces) = prepare(data.clone(), placement(), "prod-1", None).unwrap();

        assert_eq!(3, package.total_pieces());
        assert_eq!(3, pieces.len());
        assert_eq!(PIECE_SIZE, pieces[0].data.len());
        assert_eq!(PIECE_SIZE, pieces[1].data.len());
        assert_eq!(32 * 1024 - 2 * PIECE_SIZE, pieces[2].data.len());
        assert!(pieces.iter().all(verify));

        assert_eq!(data, assemble(pieces).unwrap());
    }

    #[test]
    fn single_byte_artifact() {
        let (package, pieces) = prepare(artifact(1), placement(), "prod-1", None).unwrap();

        assert_eq!(1, package.total_pieces());
        assert_eq!(0, pieces[0].index);
        assert_eq!(1, assemble(pieces).unwrap().len());
    }

    #[test]
    fn exact_multiple_has_full_last_piece() {
        let data = artifact(2 * PIECE_SIZE);
        let (_, pieces) = prepare(data.clone(), placement(), "prod-1", None).unwrap();

        assert_eq!(2, pieces.len());
        assert!(pieces.iter().all(|piece| piece.data.len() == PIECE_SIZE));
        assert_eq!(data, assemble(pieces).unwrap());
    }

    #[test]
    fn empty_artifact_is_rejected() {
        assert!(prepare(Bytes::new(), placement(), "prod-1", None).is_err());
    }

    #[test]
    fn non_finite_placement_is_rejected() {
        let mut bad = placement();
        bad.scale[1] = f32::NAN;

        assert!(prepare(artifact(16), bad, "prod-1", None).is_err());
    }

    #[test]
    fn corrupted_piece_fails_verification() {
        let (_, mut pieces) = prepare(artifact(64), placement(), "prod-1", None).unwrap();

        let mut bytes = pieces[0].data.to_vec();
        bytes[10] ^= 0xff;
        pieces[0].data = bytes.into();

        assert!(!verify(&pieces[0]));
    }

    #[test]
    fn assemble_rejects_missing_piece() {
        let (_, mut pieces) = prepare(artifact(40 * 1024), placement(), "prod-1", None).unwrap();

        pieces.remove(1);

        assert!(assemble(pieces).is_err());
    }

    #[test]
    fn assemble_rejects_short_middle_piece() {
        let (_, mut pieces) = prepare(artifact(40 * 1024), placement(), "prod-1", None).unwrap();

        pieces[0].data = pieces[0].data.slice(0..100);

        assert!(assemble(pieces).is_err());
    }

    #[test]
    fn content_ids_do_not_collide() {
        let (a, _) = prepare(artifact(8), placement(), "prod-1", None).unwrap();
        let (b, _) = prepare(artifact(8), placement(), "prod-1", None).unwrap();

        assert_ne!(a.content_id, b.content_id);
    }

    #[test]
    fn prompt_is_carried() {
        let (package, _) =
            prepare(artifact(8), placement(), "prod-1", Some("a red chair".into())).unwrap();

        assert_eq!(Some("a red chair".to_string()), package.provenance.prompt);
        assert_eq!(8, package.provenance.total_bytes);
    }
}
