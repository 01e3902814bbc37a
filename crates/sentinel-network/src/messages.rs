//! Request/response message schemas
//!
//! Every message has a fixed little-endian layout. Decoding requires the
//! input to match the layout exactly; short input and trailing bytes are
//! both schema violations.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CodecError, CodecResult};
use crate::types::{ForkDigest, Root};

/// Maximum length of an error message payload
pub const MAX_ERROR_MESSAGE_LEN: usize = 256;

/// Fixed-schema serialization
pub trait Ssz: Sized {
    /// Encoded size for fixed-size types, `None` for variable-size types
    const FIXED_SIZE: Option<usize>;

    /// Append the encoded form to `buf`
    fn ssz_encode(&self, buf: &mut BytesMut);

    /// Decode from exactly `bytes`
    fn ssz_decode(bytes: &[u8]) -> CodecResult<Self>;

    /// Encode into a fresh buffer
    fn to_ssz_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::FIXED_SIZE.unwrap_or(64));
        self.ssz_encode(&mut buf);
        buf.freeze()
    }
}

/// Check `bytes` against a fixed size
fn expect_len(bytes: &[u8], expected: usize) -> CodecResult<()> {
    match bytes.len().cmp(&expected) {
        std::cmp::Ordering::Less => Err(CodecError::Schema(format!(
            "expected {} bytes, got {}",
            expected,
            bytes.len()
        ))),
        std::cmp::Ordering::Greater => Err(CodecError::TrailingBytes(bytes.len() - expected)),
        std::cmp::Ordering::Equal => Ok(()),
    }
}

fn get_array<const N: usize>(buf: &mut &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    out
}

/// Liveness check carrying a sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ping {
    /// Sequence number
    pub id: u64,
}

impl Ssz for Ping {
    const FIXED_SIZE: Option<usize> = Some(8);

    fn ssz_encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.id);
    }

    fn ssz_decode(bytes: &[u8]) -> CodecResult<Self> {
        expect_len(bytes, 8)?;
        let mut buf = bytes;
        Ok(Self { id: buf.get_u64_le() })
    }
}

/// Chain status handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status {
    /// Current fork digest
    pub fork_digest: ForkDigest,
    /// Latest finalized root
    pub finalized_root: Root,
    /// Latest finalized epoch
    pub finalized_epoch: u64,
    /// Head block root
    pub head_root: Root,
    /// Head slot
    pub head_slot: u64,
}

impl Ssz for Status {
    const FIXED_SIZE: Option<usize> = Some(4 + 32 + 8 + 32 + 8);

    fn ssz_encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.fork_digest);
        buf.put_slice(&self.finalized_root);
        buf.put_u64_le(self.finalized_epoch);
        buf.put_slice(&self.head_root);
        buf.put_u64_le(self.head_slot);
    }

    fn ssz_decode(bytes: &[u8]) -> CodecResult<Self> {
        expect_len(bytes, 84)?;
        let mut buf = bytes;
        Ok(Self {
            fork_digest: get_array(&mut buf),
            finalized_root: get_array(&mut buf),
            finalized_epoch: buf.get_u64_le(),
            head_root: get_array(&mut buf),
            head_slot: buf.get_u64_le(),
        })
    }
}

/// Node metadata (v2 layout)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Metadata {
    /// Metadata sequence number
    pub seq_number: u64,
    /// Attestation subnet bitfield
    pub attnets: [u8; 8],
    /// Sync committee subnet bitfield
    pub syncnets: u8,
}

impl Ssz for Metadata {
    const FIXED_SIZE: Option<usize> = Some(17);

    fn ssz_encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.seq_number);
        buf.put_slice(&self.attnets);
        buf.put_u8(self.syncnets);
    }

    fn ssz_decode(bytes: &[u8]) -> CodecResult<Self> {
        expect_len(bytes, 17)?;
        let mut buf = bytes;
        Ok(Self {
            seq_number: buf.get_u64_le(),
            attnets: get_array(&mut buf),
            syncnets: buf.get_u8(),
        })
    }
}

/// Disconnect notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Goodbye {
    /// Reason code
    pub reason: u64,
}

impl Goodbye {
    /// Client shutting down
    pub const CLIENT_SHUTDOWN: u64 = 1;
    /// Irrelevant network
    pub const IRRELEVANT_NETWORK: u64 = 2;
    /// Generic fault
    pub const FAULT: u64 = 3;
    /// Too many peers
    pub const TOO_MANY_PEERS: u64 = 129;
    /// Peer score too low
    pub const BANNED: u64 = 251;
}

impl Ssz for Goodbye {
    const FIXED_SIZE: Option<usize> = Some(8);

    fn ssz_encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.reason);
    }

    fn ssz_decode(bytes: &[u8]) -> CodecResult<Self> {
        expect_len(bytes, 8)?;
        let mut buf = bytes;
        Ok(Self {
            reason: buf.get_u64_le(),
        })
    }
}

/// Request for a contiguous slot range of blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlocksByRangeRequest {
    /// First slot
    pub start_slot: u64,
    /// Number of blocks
    pub count: u64,
    /// Slot step, must be at least 1
    pub step: u64,
}

impl Ssz for BlocksByRangeRequest {
    const FIXED_SIZE: Option<usize> = Some(24);

    fn ssz_encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.start_slot);
        buf.put_u64_le(self.count);
        buf.put_u64_le(self.step);
    }

    fn ssz_decode(bytes: &[u8]) -> CodecResult<Self> {
        expect_len(bytes, 24)?;
        let mut buf = bytes;
        Ok(Self {
            start_slot: buf.get_u64_le(),
            count: buf.get_u64_le(),
            step: buf.get_u64_le(),
        })
    }
}

/// Opaque signed beacon block
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SignedBlock(pub Bytes);

impl Ssz for SignedBlock {
    const FIXED_SIZE: Option<usize> = None;

    fn ssz_encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.0);
    }

    fn ssz_decode(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.is_empty() {
            return Err(CodecError::Schema("empty block".into()));
        }
        Ok(Self(Bytes::copy_from_slice(bytes)))
    }
}

/// Error message carried by non-success responses
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorMessage(pub String);

impl ErrorMessage {
    /// Build from text, truncated to the maximum length on a char boundary
    pub fn new(text: impl Into<String>) -> Self {
        let mut text = text.into();
        if text.len() > MAX_ERROR_MESSAGE_LEN {
            let mut end = MAX_ERROR_MESSAGE_LEN;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
        }
        Self(text)
    }
}

impl Ssz for ErrorMessage {
    const FIXED_SIZE: Option<usize> = None;

    fn ssz_encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self.0.as_bytes());
    }

    fn ssz_decode(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() > MAX_ERROR_MESSAGE_LEN {
            return Err(CodecError::Schema(format!(
                "error message of {} bytes exceeds {}",
                bytes.len(),
                MAX_ERROR_MESSAGE_LEN
            )));
        }
        Ok(Self(String::from_utf8_lossy(bytes).into_owned()))
    }
}

/// Kind tag for [`ProtocolMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// [`Ping`]
    Ping,
    /// [`Status`]
    Status,
    /// [`Metadata`]
    Metadata,
    /// [`Goodbye`]
    Goodbye,
    /// [`BlocksByRangeRequest`]
    BlocksByRange,
    /// [`SignedBlock`]
    SignedBlock,
    /// [`ErrorMessage`]
    Error,
}

/// Any message the request/response protocols carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    /// Ping
    Ping(Ping),
    /// Status
    Status(Status),
    /// Metadata
    Metadata(Metadata),
    /// Goodbye
    Goodbye(Goodbye),
    /// Blocks-by-range request
    BlocksByRange(BlocksByRangeRequest),
    /// Signed block
    SignedBlock(SignedBlock),
    /// Error message
    Error(ErrorMessage),
}

impl ProtocolMessage {
    /// Kind tag
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Ping(_) => MessageKind::Ping,
            Self::Status(_) => MessageKind::Status,
            Self::Metadata(_) => MessageKind::Metadata,
            Self::Goodbye(_) => MessageKind::Goodbye,
            Self::BlocksByRange(_) => MessageKind::BlocksByRange,
            Self::SignedBlock(_) => MessageKind::SignedBlock,
            Self::Error(_) => MessageKind::Error,
        }
    }

    /// Encode the schema bytes
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Ping(m) => m.to_ssz_bytes(),
            Self::Status(m) => m.to_ssz_bytes(),
            Self::Metadata(m) => m.to_ssz_bytes(),
            Self::Goodbye(m) => m.to_ssz_bytes(),
            Self::BlocksByRange(m) => m.to_ssz_bytes(),
            Self::SignedBlock(m) => m.to_ssz_bytes(),
            Self::Error(m) => m.to_ssz_bytes(),
        }
    }

    /// Decode schema bytes as `kind`
    pub fn decode(kind: MessageKind, bytes: &[u8]) -> CodecResult<Self> {
        Ok(match kind {
            MessageKind::Ping => Self::Ping(Ping::ssz_decode(bytes)?),
            MessageKind::Status => Self::Status(Status::ssz_decode(bytes)?),
            MessageKind::Metadata => Self::Metadata(Metadata::ssz_decode(bytes)?),
            MessageKind::Goodbye => Self::Goodbye(Goodbye::ssz_decode(bytes)?),
            MessageKind::BlocksByRange => {
                Self::BlocksByRange(BlocksByRangeRequest::ssz_decode(bytes)?)
            }
            MessageKind::SignedBlock => Self::SignedBlock(SignedBlock::ssz_decode(bytes)?),
            MessageKind::Error => Self::Error(ErrorMessage::ssz_decode(bytes)?),
        })
    }
}
