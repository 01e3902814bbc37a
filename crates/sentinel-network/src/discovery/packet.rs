//! Discovery UDP packets

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::record::NodeRecord;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::types::NodeId;

/// Largest datagram accepted or produced
pub const MAX_PACKET_SIZE: usize = 1280;

/// Records carried per `Nodes` packet
pub const RECORDS_PER_PACKET: usize = 4;

/// Packet body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketBody {
    /// Liveness check carrying the sender's encoded record
    Ping {
        /// Sender record (RLP)
        record: Vec<u8>,
    },
    /// Reply to `Ping`
    Pong {
        /// Responder's record sequence number
        enr_seq: u64,
        /// Sender IP as observed by the responder
        observed_ip: IpAddr,
        /// Sender port as observed by the responder
        observed_port: u16,
    },
    /// Request for the nodes closest to `target`
    FindNode {
        /// Lookup target
        target: [u8; 32],
    },
    /// One chunk of a `FindNode` reply
    Nodes {
        /// Total number of `Nodes` packets in this reply
        total: u8,
        /// Encoded records (RLP)
        records: Vec<Vec<u8>>,
    },
}

/// Discovery packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Request id echoed in replies
    pub request_id: u64,
    /// Body
    pub body: PacketBody,
}

impl Packet {
    /// Serialize to a datagram
    pub fn encode(&self) -> DiscoveryResult<Vec<u8>> {
        let bytes = bincode::serialize(self).map_err(|e| DiscoveryError::Packet(e.to_string()))?;
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(DiscoveryError::Packet(format!(
                "packet of {} bytes exceeds {}",
                bytes.len(),
                MAX_PACKET_SIZE
            )));
        }
        Ok(bytes)
    }

    /// Parse a datagram
    pub fn decode(bytes: &[u8]) -> DiscoveryResult<Self> {
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(DiscoveryError::Packet(format!(
                "datagram of {} bytes exceeds {}",
                bytes.len(),
                MAX_PACKET_SIZE
            )));
        }
        bincode::deserialize(bytes).map_err(|e| DiscoveryError::Packet(e.to_string()))
    }

    /// Build a `FindNode` request
    pub fn find_node(request_id: u64, target: NodeId) -> Self {
        Self {
            request_id,
            body: PacketBody::FindNode {
                target: *target.as_bytes(),
            },
        }
    }

    /// Split `records` into `Nodes` replies
    pub fn nodes(request_id: u64, records: &[NodeRecord]) -> Vec<Self> {
        if records.is_empty() {
            return vec![Self {
                request_id,
                body: PacketBody::Nodes {
                    total: 1,
                    records: Vec::new(),
                },
            }];
        }
        let chunks: Vec<&[NodeRecord]> = records.chunks(RECORDS_PER_PACKET).collect();
        let total = chunks.len().min(u8::MAX as usize) as u8;
        chunks
            .into_iter()
            .take(total as usize)
            .map(|chunk| Self {
                request_id,
                body: PacketBody::Nodes {
                    total,
                    records: chunk.iter().map(NodeRecord::encode).collect(),
                },
            })
            .collect()
    }
}
