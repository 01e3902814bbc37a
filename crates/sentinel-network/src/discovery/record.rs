//! Signed node records
//!
//! RLP layout: `[signature, seq, public_key, ip, udp_port, tcp_port, capabilities]`.
//! The signature covers keccak256 of the same list without the signature.
//! Textual form is `enr:` followed by the hex encoding.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use rlp::{Rlp, RlpStream};
use sentinel_crypto::{
    keccak256, public_key_from_compressed, public_key_to_node_id, verify, Signature,
    COMPRESSED_PUBLIC_KEY_LENGTH,
};

use super::identity::NodeIdentity;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::types::NodeId;

/// Textual prefix of an encoded record
pub const RECORD_PREFIX: &str = "enr:";

/// Largest accepted encoded record
pub const MAX_RECORD_SIZE: usize = 300;

/// Node serves gossip
pub const CAP_GOSSIP: u64 = 1 << 0;
/// Node serves request/response protocols
pub const CAP_REQRESP: u64 = 1 << 1;
/// Node serves light-client data
pub const CAP_LIGHT_CLIENT: u64 = 1 << 2;

/// Signed, immutable description of a node's endpoints
#[derive(Clone, PartialEq, Eq)]
pub struct NodeRecord {
    seq: u64,
    public_key: [u8; COMPRESSED_PUBLIC_KEY_LENGTH],
    ip: IpAddr,
    udp_port: u16,
    tcp_port: u16,
    capabilities: u64,
    signature: Signature,
    node_id: NodeId,
}

fn ip_bytes(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn content_digest(
    seq: u64,
    public_key: &[u8],
    ip: &IpAddr,
    udp_port: u16,
    tcp_port: u16,
    capabilities: u64,
) -> [u8; 32] {
    let mut stream = RlpStream::new_list(6);
    stream.append(&seq);
    stream.append(&public_key.to_vec());
    stream.append(&ip_bytes(ip));
    stream.append(&udp_port);
    stream.append(&tcp_port);
    stream.append(&capabilities);
    keccak256(&stream.out())
}

fn malformed(e: impl fmt::Display) -> DiscoveryError {
    DiscoveryError::MalformedRecord(e.to_string())
}

impl NodeRecord {
    /// Build and sign a record with `identity`
    pub fn signed(
        identity: &NodeIdentity,
        seq: u64,
        ip: IpAddr,
        udp_port: u16,
        tcp_port: u16,
        capabilities: u64,
    ) -> DiscoveryResult<Self> {
        let public_key = identity.compressed_public_key();
        let digest = content_digest(seq, &public_key, &ip, udp_port, tcp_port, capabilities);
        let signature = identity.sign(&digest)?;
        Ok(Self {
            seq,
            public_key,
            ip,
            udp_port,
            tcp_port,
            capabilities,
            signature,
            node_id: identity.node_id(),
        })
    }

    /// Re-sign with a new endpoint and the next sequence number
    pub fn with_endpoint(
        &self,
        identity: &NodeIdentity,
        ip: IpAddr,
        udp_port: u16,
        tcp_port: u16,
    ) -> DiscoveryResult<Self> {
        Self::signed(identity, self.seq + 1, ip, udp_port, tcp_port, self.capabilities)
    }

    /// Sequence number
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Node id derived from the embedded public key
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// IP address
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Discovery (UDP) endpoint
    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    /// Transport (TCP) endpoint
    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    /// Capability flags
    pub fn capabilities(&self) -> u64 {
        self.capabilities
    }

    /// Whether every bit of `flags` is set
    pub fn has_capability(&self, flags: u64) -> bool {
        self.capabilities & flags == flags
    }

    /// RLP encoding
    pub fn encode(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(7);
        stream.append(&self.signature.to_bytes().to_vec());
        stream.append(&self.seq);
        stream.append(&self.public_key.to_vec());
        stream.append(&ip_bytes(&self.ip));
        stream.append(&self.udp_port);
        stream.append(&self.tcp_port);
        stream.append(&self.capabilities);
        stream.out().to_vec()
    }

    /// Decode and verify an RLP-encoded record
    pub fn decode(bytes: &[u8]) -> DiscoveryResult<Self> {
        if bytes.len() > MAX_RECORD_SIZE {
            return Err(malformed(format!("record of {} bytes", bytes.len())));
        }
        let rlp = Rlp::new(bytes);
        if !rlp.is_list() {
            return Err(malformed("not a list"));
        }
        let info = rlp.payload_info().map_err(malformed)?;
        if info.total() != bytes.len() {
            return Err(malformed("trailing bytes"));
        }
        if rlp.item_count().map_err(malformed)? != 7 {
            return Err(malformed("expected 7 fields"));
        }

        let signature: Vec<u8> = rlp.val_at(0).map_err(malformed)?;
        let seq: u64 = rlp.val_at(1).map_err(malformed)?;
        let public_key: Vec<u8> = rlp.val_at(2).map_err(malformed)?;
        let ip: Vec<u8> = rlp.val_at(3).map_err(malformed)?;
        let udp_port: u16 = rlp.val_at(4).map_err(malformed)?;
        let tcp_port: u16 = rlp.val_at(5).map_err(malformed)?;
        let capabilities: u64 = rlp.val_at(6).map_err(malformed)?;

        let ip = match ip.len() {
            4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&ip);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&ip);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            n => return Err(malformed(format!("ip of {} bytes", n))),
        };

        let signature = Signature::from_slice(&signature).map_err(malformed)?;
        let key = public_key_from_compressed(&public_key).map_err(malformed)?;
        let digest = content_digest(seq, &public_key, &ip, udp_port, tcp_port, capabilities);
        if !verify(&digest, &signature, &key).unwrap_or(false) {
            return Err(DiscoveryError::InvalidSignature);
        }

        let mut compressed = [0u8; COMPRESSED_PUBLIC_KEY_LENGTH];
        compressed.copy_from_slice(&public_key);
        Ok(Self {
            seq,
            public_key: compressed,
            ip,
            udp_port,
            tcp_port,
            capabilities,
            signature,
            node_id: NodeId::from_bytes(public_key_to_node_id(&key)),
        })
    }

    /// Textual `enr:<hex>` form
    pub fn to_text(&self) -> String {
        format!("{}{}", RECORD_PREFIX, hex::encode(self.encode()))
    }
}

impl FromStr for NodeRecord {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .trim()
            .strip_prefix(RECORD_PREFIX)
            .ok_or_else(|| malformed("missing enr: prefix"))?;
        let bytes = hex::decode(body).map_err(malformed)?;
        Self::decode(&bytes)
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl fmt::Debug for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRecord")
            .field("node_id", &self.node_id)
            .field("seq", &self.seq)
            .field("udp", &self.udp_addr())
            .field("tcp_port", &self.tcp_port)
            .finish()
    }
}
