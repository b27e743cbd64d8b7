//! Node-program kinds and their wire-serializable payloads.
//!
//! Each payload family is a tagged variant; the fixed [`REGISTRY`] order
//! drives per-kind blob serialization. Adding a kind means a new variant in
//! each enum and a new registry entry.

use std::io::Cursor;

use bytes::BytesMut;

use crate::codec::{self, Wire};
use crate::element::NodeHandle;
use crate::error::{CResult, Error};

/// The traversals shards know how to run.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u16)]
pub enum ProgKind {
    Reachability = 0,
    Dijkstra = 1,
    Clustering = 2,
}

/// Registry of program kinds in wire order. Program-state blobs enumerate
/// kinds in exactly this order.
pub const REGISTRY: [ProgKind; 3] = [ProgKind::Reachability, ProgKind::Dijkstra, ProgKind::Clustering];

impl ProgKind {
    pub fn tag(self) -> u16 {
        self as u16
    }

    pub fn from_tag(tag: u16) -> CResult<Self> {
        match tag {
            0 => Ok(ProgKind::Reachability),
            1 => Ok(ProgKind::Dijkstra),
            2 => Ok(ProgKind::Clustering),
            t => Err(Error::Parse(format!("unknown program kind tag {}", t))),
        }
    }
}

/// Per-start-node arguments of a program request. The kind is carried once
/// per message, so params encode untagged and decode by kind.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgParams {
    Reachability { dest: NodeHandle, max_hops: u64 },
    Dijkstra { dest: NodeHandle, weight_key: Vec<u8> },
    Clustering { outgoing: bool },
}

impl ProgParams {
    pub fn kind(&self) -> ProgKind {
        match self {
            ProgParams::Reachability { .. } => ProgKind::Reachability,
            ProgParams::Dijkstra { .. } => ProgKind::Dijkstra,
            ProgParams::Clustering { .. } => ProgKind::Clustering,
        }
    }

    pub fn wire_size(&self) -> u64 {
        match self {
            ProgParams::Reachability { dest, .. } => codec::bytes_size(dest) + 8,
            ProgParams::Dijkstra { dest, weight_key } => {
                codec::bytes_size(dest) + codec::bytes_size(weight_key)
            }
            ProgParams::Clustering { .. } => 1,
        }
    }

    pub fn pack(&self, buf: &mut BytesMut) {
        match self {
            ProgParams::Reachability { dest, max_hops } => {
                codec::put_bytes(buf, dest);
                max_hops.pack(buf);
            }
            ProgParams::Dijkstra { dest, weight_key } => {
                codec::put_bytes(buf, dest);
                codec::put_bytes(buf, weight_key);
            }
            ProgParams::Clustering { outgoing } => {
                (*outgoing as u8).pack(buf);
            }
        }
    }

    pub fn unpack(kind: ProgKind, cur: &mut Cursor<&[u8]>) -> CResult<Self> {
        match kind {
            ProgKind::Reachability => Ok(ProgParams::Reachability {
                dest: codec::read_bytes(cur)?,
                max_hops: codec::read_u64(cur)?,
            }),
            ProgKind::Dijkstra => Ok(ProgParams::Dijkstra {
                dest: codec::read_bytes(cur)?,
                weight_key: codec::read_bytes(cur)?,
            }),
            ProgKind::Clustering => {
                Ok(ProgParams::Clustering { outgoing: codec::read_u8(cur)? != 0 })
            }
        }
    }

}

/// Per-node traversal state, owned by the shard's state store between
/// message rounds of one request.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgState {
    Reachability { visited: bool, out_count: u64, reachable: bool },
    Dijkstra { visited: bool, dist: u64 },
    Clustering { nbr_count: u64, edge_count: u64 },
}

impl ProgState {
    pub fn kind(&self) -> ProgKind {
        match self {
            ProgState::Reachability { .. } => ProgKind::Reachability,
            ProgState::Dijkstra { .. } => ProgKind::Dijkstra,
            ProgState::Clustering { .. } => ProgKind::Clustering,
        }
    }

    pub fn wire_size(&self) -> u64 {
        match self {
            ProgState::Reachability { .. } => 1 + 8 + 1,
            ProgState::Dijkstra { .. } => 1 + 8,
            ProgState::Clustering { .. } => 8 + 8,
        }
    }

    pub fn pack(&self, buf: &mut BytesMut) {
        match self {
            ProgState::Reachability { visited, out_count, reachable } => {
                (*visited as u8).pack(buf);
                out_count.pack(buf);
                (*reachable as u8).pack(buf);
            }
            ProgState::Dijkstra { visited, dist } => {
                (*visited as u8).pack(buf);
                dist.pack(buf);
            }
            ProgState::Clustering { nbr_count, edge_count } => {
                nbr_count.pack(buf);
                edge_count.pack(buf);
            }
        }
    }

    pub fn unpack(kind: ProgKind, cur: &mut Cursor<&[u8]>) -> CResult<Self> {
        match kind {
            ProgKind::Reachability => Ok(ProgState::Reachability {
                visited: codec::read_u8(cur)? != 0,
                out_count: codec::read_u64(cur)?,
                reachable: codec::read_u8(cur)? != 0,
            }),
            ProgKind::Dijkstra => Ok(ProgState::Dijkstra {
                visited: codec::read_u8(cur)? != 0,
                dist: codec::read_u64(cur)?,
            }),
            ProgKind::Clustering => Ok(ProgState::Clustering {
                nbr_count: codec::read_u64(cur)?,
                edge_count: codec::read_u64(cur)?,
            }),
        }
    }
}

/// Program-specific result payload held by the shard result cache.
#[derive(Clone, Debug, PartialEq)]
pub enum CachePayload {
    Reachability { reachable: bool },
    Dijkstra { dist: u64 },
    Clustering { nbr_count: u64, edge_count: u64 },
}

impl CachePayload {
    pub fn kind(&self) -> ProgKind {
        match self {
            CachePayload::Reachability { .. } => ProgKind::Reachability,
            CachePayload::Dijkstra { .. } => ProgKind::Dijkstra,
            CachePayload::Clustering { .. } => ProgKind::Clustering,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registry_tags_are_stable() {
        for (i, kind) in REGISTRY.iter().enumerate() {
            assert_eq!(kind.tag() as usize, i);
            assert_eq!(ProgKind::from_tag(kind.tag()).unwrap(), *kind);
        }
        assert!(ProgKind::from_tag(3).is_err());
    }

    #[test]
    fn params_roundtrip_by_kind() {
        let cases = vec![
            ProgParams::Reachability { dest: b"t".to_vec(), max_hops: 4 },
            ProgParams::Dijkstra { dest: b"t".to_vec(), weight_key: b"w".to_vec() },
            ProgParams::Clustering { outgoing: false },
        ];
        for params in cases {
            let mut buf = bytes::BytesMut::new();
            params.pack(&mut buf);
            assert_eq!(buf.len() as u64, params.wire_size());
            let mut cur = std::io::Cursor::new(&buf[..]);
            assert_eq!(ProgParams::unpack(params.kind(), &mut cur).unwrap(), params);
        }
    }

    #[test]
    fn state_decode_needs_matching_kind() {
        let state = ProgState::Dijkstra { visited: true, dist: 9 };
        let mut buf = bytes::BytesMut::new();
        state.pack(&mut buf);
        let mut cur = std::io::Cursor::new(&buf[..]);
        assert_eq!(ProgState::unpack(ProgKind::Dijkstra, &mut cur).unwrap(), state);
        // a clustering decode of the same bytes reads different fields
        let mut cur = std::io::Cursor::new(&buf[..]);
        assert!(matches!(
            ProgState::unpack(ProgKind::Clustering, &mut cur),
            Ok(ProgState::Clustering { .. }) | Err(_)
        ));
    }
}
