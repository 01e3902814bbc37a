//! Snappy-compressed, varint length-prefixed frame codec
//!
//! Wire format:
//!
//! ```text
//! request:  [varint(len)] [snappy raw block (len bytes)]
//! response: [status: u8] [varint(len)] [snappy raw block (len bytes)]
//! ```
//!
//! `len` is the compressed length. It is checked against the configured
//! maximum before any payload is buffered, and the snappy-declared
//! uncompressed length is checked again before decompression.

use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

use crate::error::{CodecError, CodecResult};
use crate::messages::{ErrorMessage, MessageKind, ProtocolMessage, Ssz};

/// Maximum uncompressed request/response payload (10 MiB)
pub const MAX_CHUNK_SIZE: usize = 10 * 1024 * 1024;

/// Maximum uncompressed gossip payload (10 MiB)
pub const GOSSIP_MAX_SIZE: usize = 10 * 1024 * 1024;

/// Longest LEB128 encoding of a u64
const MAX_VARINT_LEN: usize = 10;

/// Response status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    /// 0
    Success,
    /// 1
    InvalidRequest,
    /// 2
    ServerError,
    /// 3
    ResourceUnavailable,
    /// Any other value
    Unknown(u8),
}

impl ResponseCode {
    /// Wire value
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Success => 0,
            Self::InvalidRequest => 1,
            Self::ServerError => 2,
            Self::ResourceUnavailable => 3,
            Self::Unknown(code) => *code,
        }
    }

    /// Whether this is the success code
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<u8> for ResponseCode {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Success,
            1 => Self::InvalidRequest,
            2 => Self::ServerError,
            3 => Self::ResourceUnavailable,
            other => Self::Unknown(other),
        }
    }
}

/// Whether frames carry a status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// No status byte
    Request,
    /// Leading status byte
    Response,
}

/// A decompressed frame before schema decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Status (always `Success` for requests)
    pub code: ResponseCode,
    /// Uncompressed payload
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, Default)]
enum DecodeState {
    #[default]
    ReadingStatus,
    ReadingLength {
        code: u8,
    },
    ReadingPayload {
        code: u8,
        length: usize,
    },
}

/// Frame-level codec: status, varint length and snappy block
#[derive(Debug)]
pub struct FrameCodec {
    kind: FrameKind,
    max_len: usize,
    state: DecodeState,
}

impl FrameCodec {
    /// Create a codec for `kind` frames bounded by `max_len` uncompressed bytes
    pub fn new(kind: FrameKind, max_len: usize) -> Self {
        Self {
            kind,
            max_len,
            state: DecodeState::default(),
        }
    }

    /// Request codec
    pub fn request(max_len: usize) -> Self {
        Self::new(FrameKind::Request, max_len)
    }

    /// Response codec
    pub fn response(max_len: usize) -> Self {
        Self::new(FrameKind::Response, max_len)
    }

    /// Frame kind
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    fn max_compressed_len(&self) -> usize {
        match snap::raw::max_compress_len(self.max_len) {
            0 => self.max_len,
            n => n,
        }
    }
}

/// Read a LEB128 varint from the front of `src` without consuming it
fn peek_varint(src: &[u8]) -> CodecResult<Option<(u64, usize)>> {
    match src.iter().take(MAX_VARINT_LEN).position(|b| b & 0x80 == 0) {
        Some(end) => {
            let mut slice = &src[..=end];
            let value =
                prost::encoding::decode_varint(&mut slice).map_err(|_| CodecError::InvalidVarint)?;
            Ok(Some((value, end + 1)))
        }
        None if src.len() >= MAX_VARINT_LEN => Err(CodecError::InvalidVarint),
        None => Ok(None),
    }
}

fn compress(payload: &[u8]) -> CodecResult<Vec<u8>> {
    snap::raw::Encoder::new()
        .compress_vec(payload)
        .map_err(|e| CodecError::Snappy(e.to_string()))
}

fn decompress(compressed: &[u8], max_len: usize) -> CodecResult<Bytes> {
    let declared =
        snap::raw::decompress_len(compressed).map_err(|e| CodecError::Snappy(e.to_string()))?;
    if declared > max_len {
        return Err(CodecError::DecompressedTooLarge {
            declared,
            max: max_len,
        });
    }
    snap::raw::Decoder::new()
        .decompress_vec(compressed)
        .map(Bytes::from)
        .map_err(|e| CodecError::Snappy(e.to_string()))
}

impl Decoder for FrameCodec {
    type Item = RawFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::ReadingStatus => {
                    let code = match self.kind {
                        FrameKind::Request => 0,
                        FrameKind::Response => {
                            if src.is_empty() {
                                return Ok(None);
                            }
                            src.get_u8()
                        }
                    };
                    self.state = DecodeState::ReadingLength { code };
                }
                DecodeState::ReadingLength { code } => {
                    let Some((declared, consumed)) = peek_varint(src)? else {
                        return Ok(None);
                    };
                    let max = self.max_compressed_len();
                    if declared > max as u64 {
                        return Err(CodecError::FrameTooLarge { declared, max });
                    }
                    src.advance(consumed);
                    self.state = DecodeState::ReadingPayload {
                        code,
                        length: declared as usize,
                    };
                }
                DecodeState::ReadingPayload { code, length } => {
                    if src.len() < length {
                        src.reserve(length - src.len());
                        return Ok(None);
                    }
                    let compressed = src.split_to(length);
                    self.state = DecodeState::ReadingStatus;
                    let payload = decompress(&compressed, self.max_len)?;
                    return Ok(Some(RawFrame {
                        code: ResponseCode::from(code),
                        payload,
                    }));
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && matches!(self.state, DecodeState::ReadingStatus) => Ok(None),
            None => Err(CodecError::Truncated),
        }
    }
}

impl Encoder<RawFrame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: RawFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > self.max_len {
            return Err(CodecError::DecompressedTooLarge {
                declared: item.payload.len(),
                max: self.max_len,
            });
        }
        let compressed = compress(&item.payload)?;

        dst.reserve(1 + MAX_VARINT_LEN + compressed.len());
        match self.kind {
            FrameKind::Request if !item.code.is_success() => {
                return Err(CodecError::UnexpectedErrorChunk)
            }
            FrameKind::Request => {}
            FrameKind::Response => dst.put_u8(item.code.as_u8()),
        }
        prost::encoding::encode_varint(compressed.len() as u64, dst);
        dst.extend_from_slice(&compressed);
        Ok(())
    }
}

/// One response chunk: a message or an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk<T> {
    /// Status 0 with a message
    Success(T),
    /// Non-zero status with an error message
    Error(ResponseCode, ErrorMessage),
}

/// A decoded chunk together with its uncompressed bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedChunk<T> {
    /// Typed chunk
    pub chunk: Chunk<T>,
    /// Uncompressed payload bytes
    pub raw: Bytes,
}

/// Typed codec for one message schema
#[derive(Debug)]
pub struct SszSnappyCodec<T> {
    frames: FrameCodec,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Ssz> SszSnappyCodec<T> {
    /// Request codec
    pub fn request(max_len: usize) -> Self {
        Self {
            frames: FrameCodec::request(max_len),
            _marker: PhantomData,
        }
    }

    /// Response codec
    pub fn response(max_len: usize) -> Self {
        Self {
            frames: FrameCodec::response(max_len),
            _marker: PhantomData,
        }
    }

    fn typed(frame: RawFrame) -> CodecResult<DecodedChunk<T>> {
        let chunk = if frame.code.is_success() {
            Chunk::Success(T::ssz_decode(&frame.payload)?)
        } else {
            Chunk::Error(frame.code, ErrorMessage::ssz_decode(&frame.payload)?)
        };
        Ok(DecodedChunk {
            chunk,
            raw: frame.payload,
        })
    }
}

impl<T: Ssz> Decoder for SszSnappyCodec<T> {
    type Item = DecodedChunk<T>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.frames.decode(src)?.map(Self::typed).transpose()
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.frames.decode_eof(src)?.map(Self::typed).transpose()
    }
}

impl<T: Ssz> Encoder<Chunk<T>> for SszSnappyCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: Chunk<T>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = match item {
            Chunk::Success(message) => RawFrame {
                code: ResponseCode::Success,
                payload: message.to_ssz_bytes(),
            },
            Chunk::Error(code, message) => RawFrame {
                code,
                payload: message.to_ssz_bytes(),
            },
        };
        self.frames.encode(frame, dst)
    }
}

/// A fully decoded single-frame message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    /// Status (always `Success` for requests)
    pub code: ResponseCode,
    /// Decoded message; `ProtocolMessage::Error` for non-success responses
    pub message: ProtocolMessage,
    /// Uncompressed payload bytes
    pub raw: Bytes,
}

/// Encode `message` as one frame
pub fn encode(kind: FrameKind, code: ResponseCode, message: &ProtocolMessage) -> CodecResult<Bytes> {
    let mut dst = BytesMut::new();
    FrameCodec::new(kind, MAX_CHUNK_SIZE).encode(
        RawFrame {
            code,
            payload: message.encode(),
        },
        &mut dst,
    )?;
    Ok(dst.freeze())
}

/// Decode exactly one frame from `bytes` as `message_kind`
pub fn decode(
    kind: FrameKind,
    message_kind: MessageKind,
    bytes: &[u8],
    max_len: usize,
) -> CodecResult<DecodedMessage> {
    let mut codec = FrameCodec::new(kind, max_len);
    let mut src = BytesMut::from(bytes);
    let frame = codec.decode(&mut src)?.ok_or(CodecError::Truncated)?;
    if !src.is_empty() {
        return Err(CodecError::TrailingBytes(src.len()));
    }
    let message = if frame.code.is_success() {
        ProtocolMessage::decode(message_kind, &frame.payload)?
    } else {
        ProtocolMessage::Error(ErrorMessage::ssz_decode(&frame.payload)?)
    };
    Ok(DecodedMessage {
        code: frame.code,
        message,
        raw: frame.payload,
    })
}

/// Compress a gossip payload
pub fn compress_gossip(data: &[u8], max_len: usize) -> CodecResult<Bytes> {
    if data.len() > max_len {
        return Err(CodecError::DecompressedTooLarge {
            declared: data.len(),
            max: max_len,
        });
    }
    compress(data).map(Bytes::from)
}

/// Decompress a gossip payload, bounded by `max_len`
pub fn decompress_gossip(data: &[u8], max_len: usize) -> CodecResult<Bytes> {
    decompress(data, max_len)
}

/// Write a request frame and flush
pub async fn write_request<W, T>(io: &mut W, message: T, max_len: usize) -> CodecResult<()>
where
    W: AsyncWrite + Unpin,
    T: Ssz,
{
    let mut framed = FramedWrite::new(io, SszSnappyCodec::<T>::request(max_len));
    framed.send(Chunk::Success(message)).await
}

/// Write one response chunk and flush
pub async fn write_response_chunk<W, T>(io: &mut W, chunk: Chunk<T>, max_len: usize) -> CodecResult<()>
where
    W: AsyncWrite + Unpin,
    T: Ssz,
{
    let mut framed = FramedWrite::new(io, SszSnappyCodec::<T>::response(max_len));
    framed.send(chunk).await
}

/// Read exactly one request frame, then read to EOF
///
/// The requester closes its write half after the frame; any byte that
/// follows, buffered or late, is rejected. The drain reads at most one more
/// bounded frame.
pub async fn read_request<R, T>(io: &mut R, max_len: usize) -> CodecResult<(T, Bytes)>
where
    R: AsyncRead + Unpin,
    T: Ssz,
{
    let mut framed = FramedRead::new(io, SszSnappyCodec::<T>::request(max_len));
    let decoded = framed.next().await.ok_or(CodecError::Truncated)??;
    match framed.next().await {
        None => {}
        Some(Err(CodecError::Io(e))) => return Err(CodecError::Io(e)),
        Some(_) => return Err(CodecError::TrailingBytes(framed.read_buffer().len().max(1))),
    }
    match decoded.chunk {
        Chunk::Success(message) => Ok((message, decoded.raw)),
        Chunk::Error(..) => Err(CodecError::UnexpectedErrorChunk),
    }
}

/// Wrap a stream for reading consecutive response chunks
pub fn response_reader<R, T>(io: R, max_len: usize) -> FramedRead<R, SszSnappyCodec<T>>
where
    R: AsyncRead + Unpin,
    T: Ssz,
{
    FramedRead::new(io, SszSnappyCodec::<T>::response(max_len))
}

/// Read the next response chunk; `None` at a clean end of stream
pub async fn read_response_chunk<R, T>(
    reader: &mut FramedRead<R, SszSnappyCodec<T>>,
) -> CodecResult<Option<DecodedChunk<T>>>
where
    R: AsyncRead + Unpin,
    T: Ssz,
{
    reader.next().await.transpose()
}
