//! Gossip messages and RPC wire format

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sentinel_crypto::sha256;

use crate::codec::decompress_gossip;
use crate::error::{CodecError, CodecResult};
use crate::messages::Ssz;
use crate::types::PeerId;

/// 20-byte gossip message id
pub type MessageId = [u8; 20];

/// Domain for payloads that decompress
pub const MESSAGE_DOMAIN_VALID_SNAPPY: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

/// Domain for payloads that fail to decompress
pub const MESSAGE_DOMAIN_INVALID_SNAPPY: [u8; 4] = [0x00, 0x00, 0x00, 0x00];

/// `sha256(domain || len(topic) as u64 LE || topic || data)[..20]`
pub fn compute_message_id(domain: [u8; 4], topic: &str, data: &[u8]) -> MessageId {
    let mut buf = Vec::with_capacity(4 + 8 + topic.len() + data.len());
    buf.extend_from_slice(&domain);
    buf.extend_from_slice(&(topic.len() as u64).to_le_bytes());
    buf.extend_from_slice(topic.as_bytes());
    buf.extend_from_slice(data);
    let digest = sha256(&buf);
    let mut id = [0u8; 20];
    id.copy_from_slice(&digest[..20]);
    id
}

/// Decompress a wire payload and derive its id
///
/// Returns the decompressed bytes when decompression succeeded.
pub fn message_id_for_wire(topic: &str, compressed: &[u8], max_len: usize) -> (MessageId, Option<Bytes>) {
    match decompress_gossip(compressed, max_len) {
        Ok(data) => (
            compute_message_id(MESSAGE_DOMAIN_VALID_SNAPPY, topic, &data),
            Some(data),
        ),
        Err(_) => (
            compute_message_id(MESSAGE_DOMAIN_INVALID_SNAPPY, topic, compressed),
            None,
        ),
    }
}

/// A gossip message delivered to the local consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipMessage {
    /// Topic the message arrived on
    pub topic: String,
    /// Decompressed payload
    pub data: Bytes,
    /// Peer that forwarded it (ourselves for local publishes)
    pub source: PeerId,
    /// Content id
    pub id: MessageId,
}

const TAG_PUBLISH: u8 = 0;
const TAG_SUBSCRIBE: u8 = 1;
const TAG_UNSUBSCRIBE: u8 = 2;

/// Gossip RPC exchanged over a gossip stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipRpc {
    /// Broadcast payload, snappy compressed
    Publish {
        /// Topic
        topic: String,
        /// Compressed payload
        data: Bytes,
    },
    /// Sender joined these topics
    Subscribe {
        /// Topics
        topics: Vec<String>,
    },
    /// Sender left these topics
    Unsubscribe {
        /// Topics
        topics: Vec<String>,
    },
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut &[u8]) -> CodecResult<String> {
    if buf.remaining() < 2 {
        return Err(CodecError::Schema("missing string length".into()));
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(CodecError::Schema("string truncated".into()));
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|e| CodecError::Schema(e.to_string()))?
        .to_string();
    buf.advance(len);
    Ok(s)
}

fn get_topics(buf: &mut &[u8]) -> CodecResult<Vec<String>> {
    if buf.remaining() < 2 {
        return Err(CodecError::Schema("missing topic count".into()));
    }
    let count = buf.get_u16_le() as usize;
    let mut topics = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        topics.push(get_string(buf)?);
    }
    if buf.has_remaining() {
        return Err(CodecError::TrailingBytes(buf.remaining()));
    }
    Ok(topics)
}

impl Ssz for GossipRpc {
    const FIXED_SIZE: Option<usize> = None;

    fn ssz_encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Publish { topic, data } => {
                buf.put_u8(TAG_PUBLISH);
                put_string(buf, topic);
                buf.put_slice(data);
            }
            Self::Subscribe { topics } | Self::Unsubscribe { topics } => {
                buf.put_u8(if matches!(self, Self::Subscribe { .. }) {
                    TAG_SUBSCRIBE
                } else {
                    TAG_UNSUBSCRIBE
                });
                buf.put_u16_le(topics.len() as u16);
                for topic in topics {
                    put_string(buf, topic);
                }
            }
        }
    }

    fn ssz_decode(bytes: &[u8]) -> CodecResult<Self> {
        let mut buf = bytes;
        if !buf.has_remaining() {
            return Err(CodecError::Schema("empty rpc".into()));
        }
        match buf.get_u8() {
            TAG_PUBLISH => {
                let topic = get_string(&mut buf)?;
                Ok(Self::Publish {
                    topic,
                    data: Bytes::copy_from_slice(buf),
                })
            }
            TAG_SUBSCRIBE => Ok(Self::Subscribe {
                topics: get_topics(&mut buf)?,
            }),
            TAG_UNSUBSCRIBE => Ok(Self::Unsubscribe {
                topics: get_topics(&mut buf)?,
            }),
            tag => Err(CodecError::Schema(format!("unknown rpc tag {}", tag))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::compress_gossip;

    #[test]
    fn test_message_id_layout() {
        let topic = "/eth2/00000000/beacon_block/ssz_snappy";
        let mut preimage = vec![1, 0, 0, 0];
        preimage.extend_from_slice(&(topic.len() as u64).to_le_bytes());
        preimage.extend_from_slice(topic.as_bytes());
        preimage.extend_from_slice(b"block");
        let expected = sha256(&preimage);

        let id = compute_message_id(MESSAGE_DOMAIN_VALID_SNAPPY, topic, b"block");
        assert_eq!(&id[..], &expected[..20]);
    }

    #[test]
    fn test_wire_id_uses_decompressed_data() {
        let compressed = compress_gossip(b"payload", 1024).unwrap();
        let (id, data) = message_id_for_wire("t", &compressed, 1024);
        assert_eq!(data.as_deref(), Some(&b"payload"[..]));
        assert_eq!(id, compute_message_id(MESSAGE_DOMAIN_VALID_SNAPPY, "t", b"payload"));
    }

    #[test]
    fn test_wire_id_invalid_snappy() {
        let garbage = [0xFFu8; 8];
        let (id, data) = message_id_for_wire("t", &garbage, 1024);
        assert!(data.is_none());
        assert_eq!(id, compute_message_id(MESSAGE_DOMAIN_INVALID_SNAPPY, "t", &garbage));
    }

    #[test]
    fn test_rpc_roundtrip() {
        let rpcs = [
            GossipRpc::Publish {
                topic: "a".into(),
                data: Bytes::from_static(b"xyz"),
            },
            GossipRpc::Subscribe {
                topics: vec!["a".into(), "b".into()],
            },
            GossipRpc::Unsubscribe { topics: vec![] },
        ];
        for rpc in rpcs {
            assert_eq!(GossipRpc::ssz_decode(&rpc.to_ssz_bytes()).unwrap(), rpc);
        }
    }

    #[test]
    fn test_rpc_rejects_trailing_and_unknown() {
        let mut bytes = GossipRpc::Subscribe {
            topics: vec!["a".into()],
        }
        .to_ssz_bytes()
        .to_vec();
        bytes.push(0);
        assert!(matches!(
            GossipRpc::ssz_decode(&bytes),
            Err(CodecError::TrailingBytes(1))
        ));
        assert!(GossipRpc::ssz_decode(&[9]).is_err());
        assert!(GossipRpc::ssz_decode(&[]).is_err());
    }
}
