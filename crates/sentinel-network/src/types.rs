//! Network types

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// 32-byte beacon-chain root
pub type Root = [u8; 32];

/// 4-byte fork digest
pub type ForkDigest = [u8; 4];

/// Peer identifier (32 bytes), equal to the peer's discovery node id
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

/// Discovery node id
pub type NodeId = PeerId;

impl PeerId {
    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate random peer ID
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// XOR distance to another id, big-endian
    pub fn distance(&self, other: &PeerId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Bit length of the XOR distance (1..=256), `None` for identical ids
    pub fn log2_distance(&self, other: &PeerId) -> Option<usize> {
        let distance = self.distance(other);
        let leading = distance
            .iter()
            .position(|b| *b != 0)
            .map(|i| i * 8 + distance[i].leading_zeros() as usize)?;
        Some(256 - leading)
    }

    /// Order `a` and `b` by XOR distance to `self`
    pub fn cmp_distance(&self, a: &PeerId, b: &PeerId) -> Ordering {
        self.distance(a).cmp(&self.distance(b))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id() {
        let id = PeerId::random();
        let id2 = PeerId::from_bytes(*id.as_bytes());
        assert_eq!(id, id2);
    }

    #[test]
    fn test_peer_id_display() {
        let id = PeerId::from_bytes([0xAB; 32]);
        assert_eq!(format!("{}", id), "abababababababab");
        assert!(format!("{:?}", id).contains("PeerId("));
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let id = PeerId::random();
        assert_eq!(id.distance(&id), [0u8; 32]);
        assert_eq!(id.log2_distance(&id), None);
    }

    #[test]
    fn test_log2_distance() {
        let a = PeerId::from_bytes([0u8; 32]);
        let mut bytes = [0u8; 32];
        bytes[31] = 1;
        assert_eq!(a.log2_distance(&PeerId::from_bytes(bytes)), Some(1));

        bytes[31] = 0;
        bytes[0] = 0x80;
        assert_eq!(a.log2_distance(&PeerId::from_bytes(bytes)), Some(256));

        bytes[0] = 0x01;
        assert_eq!(a.log2_distance(&PeerId::from_bytes(bytes)), Some(249));
    }

    #[test]
    fn test_cmp_distance() {
        let target = PeerId::from_bytes([0u8; 32]);
        let near = PeerId::from_bytes([1u8; 32]);
        let far = PeerId::from_bytes([0xF0; 32]);
        assert_eq!(target.cmp_distance(&near, &far), Ordering::Less);
        assert_eq!(target.cmp_distance(&far, &near), Ordering::Greater);
        assert_eq!(target.cmp_distance(&near, &near), Ordering::Equal);
    }

    #[test]
    fn test_peer_id_hash() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(PeerId::from_bytes([1u8; 32]));
        set.insert(PeerId::from_bytes([2u8; 32]));
        set.insert(PeerId::from_bytes([1u8; 32]));
        assert_eq!(set.len(), 2);
    }
}
