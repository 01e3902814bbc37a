//! Wire codec tests for sentinel-network
//!
//! Test categories:
//! 1. Round-trip for every registered message kind (property based)
//! 2. Size limits enforced before decompression
//! 3. Streaming helpers over in-memory pipes

use bytes::{BufMut, Bytes, BytesMut};
use proptest::prelude::*;
use sentinel_network::codec::{
    self, read_request, read_response_chunk, response_reader, write_request, write_response_chunk,
    Chunk, FrameKind, ResponseCode, MAX_CHUNK_SIZE,
};
use sentinel_network::messages::{
    BlocksByRangeRequest, ErrorMessage, Goodbye, Metadata, Ping, ProtocolMessage, SignedBlock, Status,
};
use sentinel_network::CodecError;

// =============================================================================
// Strategies
// =============================================================================

fn arb_root() -> impl Strategy<Value = [u8; 32]> {
    prop::array::uniform32(any::<u8>())
}

fn arb_message() -> impl Strategy<Value = ProtocolMessage> {
    prop_oneof![
        any::<u64>().prop_map(|id| ProtocolMessage::Ping(Ping { id })),
        (
            prop::array::uniform4(any::<u8>()),
            arb_root(),
            any::<u64>(),
            arb_root(),
            any::<u64>()
        )
            .prop_map(|(fork_digest, finalized_root, finalized_epoch, head_root, head_slot)| {
                ProtocolMessage::Status(Status {
                    fork_digest,
                    finalized_root,
                    finalized_epoch,
                    head_root,
                    head_slot,
                })
            }),
        (any::<u64>(), prop::array::uniform8(any::<u8>()), any::<u8>()).prop_map(
            |(seq_number, attnets, syncnets)| ProtocolMessage::Metadata(Metadata {
                seq_number,
                attnets,
                syncnets,
            })
        ),
        any::<u64>().prop_map(|reason| ProtocolMessage::Goodbye(Goodbye { reason })),
        (any::<u64>(), any::<u64>(), any::<u64>()).prop_map(|(start_slot, count, step)| {
            ProtocolMessage::BlocksByRange(BlocksByRangeRequest {
                start_slot,
                count,
                step,
            })
        }),
        prop::collection::vec(any::<u8>(), 1..4096)
            .prop_map(|bytes| ProtocolMessage::SignedBlock(SignedBlock(Bytes::from(bytes)))),
        "[a-zA-Z0-9 ]{0,200}".prop_map(|s| ProtocolMessage::Error(ErrorMessage::new(s))),
    ]
}

// =============================================================================
// Round-trip
// =============================================================================

proptest! {
    #[test]
    fn prop_response_roundtrip(message in arb_message()) {
        let code = if matches!(message, ProtocolMessage::Error(_)) {
            ResponseCode::ServerError
        } else {
            ResponseCode::Success
        };
        let frame = codec::encode(FrameKind::Response, code, &message).unwrap();
        prop_assert_eq!(frame[0], code.as_u8());

        let decoded = codec::decode(FrameKind::Response, message.kind(), &frame, MAX_CHUNK_SIZE).unwrap();
        prop_assert_eq!(decoded.code, code);
        let expected_raw = message.encode();
        prop_assert_eq!(decoded.raw, expected_raw);
        prop_assert_eq!(decoded.message, message);
    }

    #[test]
    fn prop_request_roundtrip(message in arb_message()) {
        prop_assume!(!matches!(message, ProtocolMessage::Error(_)));
        let frame = codec::encode(FrameKind::Request, ResponseCode::Success, &message).unwrap();
        let decoded = codec::decode(FrameKind::Request, message.kind(), &frame, MAX_CHUNK_SIZE).unwrap();
        prop_assert_eq!(decoded.message, message);
    }
}

// =============================================================================
// Limits
// =============================================================================

#[test]
fn test_ping_wire_layout() {
    let frame = codec::encode(
        FrameKind::Response,
        ResponseCode::Success,
        &ProtocolMessage::Ping(Ping { id: 1 }),
    )
    .unwrap();
    // status, compressed length, then a snappy block declaring 8 bytes
    assert_eq!(frame[0], 0);
    assert_eq!(frame[1] as usize, frame.len() - 2);
    assert_eq!(frame[2], 8);
}

#[test]
fn test_declared_length_over_limit_rejected_without_payload() {
    let mut frame = BytesMut::new();
    prost::encoding::encode_varint(1 << 30, &mut frame);
    let err = codec::decode(FrameKind::Request, ping_kind(), &frame, 1024).unwrap_err();
    assert!(matches!(err, CodecError::FrameTooLarge { .. }), "{:?}", err);
}

#[test]
fn test_decompressed_length_over_limit_rejected() {
    let block = ProtocolMessage::SignedBlock(SignedBlock(Bytes::from(vec![0u8; 4096])));
    let frame = codec::encode(FrameKind::Request, ResponseCode::Success, &block).unwrap();
    // zeros compress well, so only the snappy header exceeds the limit
    let err = codec::decode(FrameKind::Request, block.kind(), &frame, 1024).unwrap_err();
    assert!(
        matches!(err, CodecError::DecompressedTooLarge { declared: 4096, max: 1024 }),
        "{:?}",
        err
    );
}

#[test]
fn test_trailing_bytes_rejected() {
    let mut frame = BytesMut::from(
        &codec::encode(
            FrameKind::Request,
            ResponseCode::Success,
            &ProtocolMessage::Ping(Ping { id: 5 }),
        )
        .unwrap()[..],
    );
    frame.put_u8(0);
    assert!(codec::decode(FrameKind::Request, ping_kind(), &frame, MAX_CHUNK_SIZE).is_err());
}

#[test]
fn test_schema_violation() {
    // a Status payload decoded as Ping has the wrong length
    let frame = codec::encode(
        FrameKind::Request,
        ResponseCode::Success,
        &ProtocolMessage::Status(Status::default()),
    )
    .unwrap();
    assert!(matches!(
        codec::decode(FrameKind::Request, ping_kind(), &frame, MAX_CHUNK_SIZE),
        Err(CodecError::TrailingBytes(_))
    ));
}

fn ping_kind() -> sentinel_network::messages::MessageKind {
    ProtocolMessage::Ping(Ping::default()).kind()
}

// =============================================================================
// Streaming helpers
// =============================================================================

#[tokio::test]
async fn test_stream_request_and_chunks() {
    let (mut client, mut server) = tokio::io::duplex(64 * 1024);

    write_request(&mut client, BlocksByRangeRequest { start_slot: 1, count: 2, step: 1 }, MAX_CHUNK_SIZE)
        .await
        .unwrap();
    tokio::io::AsyncWriteExt::shutdown(&mut client).await.unwrap();
    let (request, raw): (BlocksByRangeRequest, _)= read_request(&mut server, MAX_CHUNK_SIZE).await.unwrap();
    assert_eq!(request.count, 2);
    assert_eq!(raw.len(), 24);

    for i in 0..2u8 {
        write_response_chunk(&mut server, Chunk::Success(SignedBlock(Bytes::from(vec![i; 3]))), MAX_CHUNK_SIZE)
            .await
            .unwrap();
    }
    write_response_chunk::<_, SignedBlock>(
        &mut server,
        Chunk::Error(ResponseCode::ResourceUnavailable, ErrorMessage::new("pruned")),
        MAX_CHUNK_SIZE,
    )
    .await
    .unwrap();
    drop(server);

    let mut reader = response_reader::<_, SignedBlock>(client, MAX_CHUNK_SIZE);
    let mut blocks = Vec::new();
    let mut error = None;
    while let Some(decoded) = read_response_chunk(&mut reader).await.unwrap() {
        match decoded.chunk {
            Chunk::Success(block) => blocks.push(block),
            Chunk::Error(code, message) => error = Some((code, message)),
        }
    }
    assert_eq!(blocks.len(), 2);
    assert_eq!(
        error,
        Some((ResponseCode::ResourceUnavailable, ErrorMessage::new("pruned")))
    );
}

#[tokio::test]
async fn test_stream_truncated_frame() {
    let (mut client, server) = tokio::io::duplex(1024);
    let frame = codec::encode(
        FrameKind::Response,
        ResponseCode::Success,
        &ProtocolMessage::Ping(Ping { id: 9 }),
    )
    .unwrap();
    tokio::io::AsyncWriteExt::write_all(&mut client, &frame[..frame.len() - 1])
        .await
        .unwrap();
    drop(client);

    let mut reader = response_reader::<_, Ping>(server, MAX_CHUNK_SIZE);
    assert!(matches!(
        read_response_chunk(&mut reader).await,
        Err(CodecError::Truncated)
    ));
}
