use crate::chunker::{Package, Piece};
use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One frame = one value on a peer channel. Piece and bitfield bytes ride
/// as base64 so the frame survives text-only channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    Metadata {
        package: Package,
    },
    Bitfield {
        content: String,
        #[serde(with = "base64_bytes")]
        bits: Bytes,
    },
    Have {
        content: String,
        index: usize,
    },
    Request {
        content: String,
        index: usize,
    },
    Piece {
        content: String,
        index: usize,
        total: usize,
        #[serde(with = "base64_bytes")]
        data: Bytes,
        checksum: u32,
    },
}

impl Frame {
    pub fn decode(raw: &[u8]) -> Result<Frame> {
        serde_json::from_slice(raw).context("malformed p2p frame")
    }

    pub fn encode(&self) -> Bytes {
        // frames are composed of strings, numbers and raw byte buffers,
        // serialization can't fail
        serde_json::to_vec(self).unwrap_or_default().into()
    }

    pub fn piece(piece: Piece) -> Frame {
        Frame::Piece {
            content: piece.content_id,
            index: piece.index,
            total: piece.total,
            data: piece.data,
            checksum: piece.checksum,
        }
    }
}

impl From<Frame> for Option<Piece> {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Piece {
                content,
                index,
                total,
                data,
                checksum,
            } => Some(Piece {
                content_id: content,
                index,
                total,
                data,
                checksum,
            }),
            _ => None,
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
