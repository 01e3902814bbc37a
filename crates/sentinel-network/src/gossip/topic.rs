//! Gossip topic names
//!
//! Topics follow `/eth2/{fork_digest_hex}/{name}/ssz_snappy`.

use std::fmt;
use std::str::FromStr;

use crate::error::GossipError;
use crate::types::ForkDigest;

const TOPIC_PREFIX: &str = "eth2";
const ENCODING_POSTFIX: &str = "ssz_snappy";

/// Well-known gossip topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GossipKind {
    /// Signed beacon blocks
    BeaconBlock,
    /// Light-client finality updates
    LightClientFinalityUpdate,
    /// Light-client optimistic updates
    LightClientOptimisticUpdate,
}

impl GossipKind {
    /// All well-known kinds
    pub const ALL: [GossipKind; 3] = [
        GossipKind::BeaconBlock,
        GossipKind::LightClientFinalityUpdate,
        GossipKind::LightClientOptimisticUpdate,
    ];

    /// Topic name segment
    pub fn name(&self) -> &'static str {
        match self {
            Self::BeaconBlock => "beacon_block",
            Self::LightClientFinalityUpdate => "light_client_finality_update",
            Self::LightClientOptimisticUpdate => "light_client_optimistic_update",
        }
    }

    /// Look up by name segment
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

/// A fork-scoped gossip topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GossipTopic {
    /// Fork digest the topic belongs to
    pub fork_digest: ForkDigest,
    /// Name segment
    pub name: String,
}

impl GossipTopic {
    /// Topic for `kind` on `fork_digest`
    pub fn new(fork_digest: ForkDigest, kind: GossipKind) -> Self {
        Self {
            fork_digest,
            name: kind.name().to_string(),
        }
    }

    /// Well-known kind, if any
    pub fn kind(&self) -> Option<GossipKind> {
        GossipKind::from_name(&self.name)
    }
}

impl fmt::Display for GossipTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/{}/{}/{}/{}",
            TOPIC_PREFIX,
            hex::encode(self.fork_digest),
            self.name,
            ENCODING_POSTFIX
        )
    }
}

impl FromStr for GossipTopic {
    type Err = GossipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || GossipError::InvalidTopic(s.to_string());
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            ["", TOPIC_PREFIX, digest, name, ENCODING_POSTFIX] if !name.is_empty() => {
                let bytes = hex::decode(digest).map_err(|_| invalid())?;
                let fork_digest: ForkDigest = bytes.try_into().map_err(|_| invalid())?;
                Ok(Self {
                    fork_digest,
                    name: name.to_string(),
                })
            }
            _ => Err(invalid()),
        }
    }
}

/// Full topic string for `kind` on `fork_digest`
pub fn topic_name(fork_digest: &ForkDigest, kind: GossipKind) -> String {
    GossipTopic::new(*fork_digest, kind).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_format() {
        assert_eq!(
            topic_name(&[0x4a, 0x26, 0xc5, 0x8b], GossipKind::BeaconBlock),
            "/eth2/4a26c58b/beacon_block/ssz_snappy"
        );
    }

    #[test]
    fn test_topic_parse() {
        let topic: GossipTopic = "/eth2/01020304/light_client_finality_update/ssz_snappy"
            .parse()
            .unwrap();
        assert_eq!(topic.fork_digest, [1, 2, 3, 4]);
        assert_eq!(topic.kind(), Some(GossipKind::LightClientFinalityUpdate));
    }

    #[test]
    fn test_topic_parse_rejects() {
        for bad in [
            "/eth2/0102/beacon_block/ssz_snappy",
            "/eth2/01020304/beacon_block/ssz",
            "eth2/01020304/beacon_block/ssz_snappy",
            "/eth2/zzzzzzzz/beacon_block/ssz_snappy",
            "/eth2/01020304//ssz_snappy",
        ] {
            assert!(bad.parse::<GossipTopic>().is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_unknown_kind_still_parses() {
        let topic: GossipTopic = "/eth2/00000000/custom/ssz_snappy".parse().unwrap();
        assert_eq!(topic.kind(), None);
    }
}
