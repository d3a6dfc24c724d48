// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Protocol unit tests

use super::*;
use yare::parameterized;

#[test]
fn encode_decode_roundtrip_container_use() {
    let request = Request::ContainerUse {
        request: ContainerUseRequest::Acquire {
            targets: HashMap::from([
                ("db".to_string(), UseOperation::InitSharedLock),
                ("vol".to_string(), UseOperation::Lock),
            ]),
        },
    };

    let encoded = encode(&request).expect("encode failed");
    let decoded: Request = decode(&encoded).expect("decode failed");

    assert_eq!(request, decoded);
}

#[test]
fn request_wire_shape_is_tagged() {
    let request = Request::Build {
        key: "app:1".to_string(),
        operation: LockOperation::Lock,
    };
    let value: serde_json::Value = serde_json::from_slice(&encode(&request).unwrap()).unwrap();
    assert_eq!(
        value,
        serde_json::json!({"type": "Build", "key": "app:1", "operation": "lock"})
    );

    let release: Request = decode(br#"{"type":"ContainerUse","request":{"type":"Release"}}"#)
        .expect("decode failed");
    assert_eq!(
        release,
        Request::ContainerUse {
            request: ContainerUseRequest::Release
        }
    );
}

#[test]
fn lock_result_defaults_acquire_init() {
    let result: LockResult = decode(br#"{"state":"shared_locked"}"#).unwrap();
    assert_eq!(result.state, LockState::SharedLocked);
    assert!(!result.acquire_init);
}

#[test]
fn encode_returns_json_without_length_prefix() {
    let response = Response::Pong;
    let encoded = encode(&response).expect("encode failed");

    let json_str = std::str::from_utf8(&encoded).expect("should be valid UTF-8");
    assert!(
        json_str.starts_with('{'),
        "should be JSON object: {}",
        json_str
    );
}

#[parameterized(
    namespace = { Request::Namespace { operation: LockOperation::Lock }, Some(StreamKind::Namespace) },
    build = { Request::Build { key: "k".into(), operation: LockOperation::Unlock }, Some(StreamKind::Build) },
    setup = { Request::ContainerSetup { key: "k".into(), operation: LockOperation::Lock }, Some(StreamKind::ContainerSetup) },
    container_use = { Request::ContainerUse { request: ContainerUseRequest::Release }, Some(StreamKind::ContainerUse) },
    ping = { Request::Ping, None },
    interrupt = { Request::Interrupt, None },
)]
fn stream_kind_of_request(request: Request, expected: Option<StreamKind>) {
    assert_eq!(request.stream_kind(), expected);
}

#[parameterized(
    lock = { true, false, UseOperation::Lock },
    shared = { false, false, UseOperation::SharedLock },
    init = { true, true, UseOperation::InitLock },
    init_shared = { false, true, UseOperation::InitSharedLock },
)]
fn use_operation_matches_container_mode(exclusive: bool, want_init: bool, op: UseOperation) {
    assert_eq!(UseOperation::new(exclusive, want_init), op);
    let mode = ContainerMode::from(op);
    assert_eq!(mode.exclusive(), exclusive);
    assert_eq!(mode.want_init(), want_init);
}

#[parameterized(
    misuse = { LockError::misuse("double lock"), ErrorCode::InvalidArgument },
    cancelled = { LockError::Cancelled, ErrorCode::Cancelled },
    deadline = { LockError::DeadlineExceeded, ErrorCode::Cancelled },
    transport = { LockError::Transport("reset".into()), ErrorCode::Unavailable },
    init = { LockError::Init("unhealthy".into()), ErrorCode::Internal },
)]
fn lock_errors_map_to_codes(err: LockError, expected: ErrorCode) {
    match Response::from(&err) {
        Response::Error { code, .. } => assert_eq!(code, expected),
        other => panic!("expected error response, got {:?}", other),
    }
}

#[test]
fn invalid_argument_round_trips_as_misuse() {
    let Response::Error { code, message } = Response::from(&LockError::misuse("not locked")) else {
        panic!("expected error response");
    };
    assert_eq!(code.into_lock_error(message), LockError::misuse("not locked"));
    assert_eq!(
        ErrorCode::Unavailable.into_lock_error("gone".into()),
        LockError::Rejected {
            code: "unavailable".into(),
            message: "gone".into()
        }
    );
}

#[tokio::test]
async fn read_write_message_roundtrip() {
    let original = b"hello world";

    let mut buffer = Vec::new();
    write_message(&mut buffer, original)
        .await
        .expect("write failed");

    // write_message adds 4-byte length prefix
    assert_eq!(buffer.len(), 4 + original.len());
    let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    assert_eq!(len, original.len());

    let mut cursor = std::io::Cursor::new(buffer);
    let read_back = read_message(&mut cursor).await.expect("read failed");

    assert_eq!(read_back, original);
}

#[tokio::test]
async fn read_message_on_eof_is_connection_closed() {
    let mut empty = std::io::Cursor::new(Vec::<u8>::new());
    assert!(matches!(
        read_message(&mut empty).await,
        Err(ProtocolError::ConnectionClosed)
    ));

    // prefix promises more than the body holds
    let mut truncated = std::io::Cursor::new(vec![0, 0, 0, 10, b'{']);
    assert!(matches!(
        read_message(&mut truncated).await,
        Err(ProtocolError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn oversized_frame_is_rejected() {
    let size = (MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes();
    let mut cursor = std::io::Cursor::new(size.to_vec());
    assert!(matches!(
        read_message(&mut cursor).await,
        Err(ProtocolError::MessageTooLarge { .. })
    ));
}

#[tokio::test]
async fn read_request_times_out() {
    let (_client, server) = tokio::io::duplex(64);
    let mut server = server;
    let result = read_request(&mut server, Duration::from_millis(20)).await;
    assert!(matches!(result, Err(ProtocolError::Timeout)));
}
