// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire protocol between moord and its clients
//!
//! Every frame is a 4-byte big-endian length followed by a JSON body. A
//! connection carries either one unary request (hello, ping, status,
//! interrupt) or one lock stream, whose lifetime is the lease on whatever
//! the stream holds.

use std::collections::HashMap;
use std::time::Duration;

use moor_core::{ContainerMode, LockError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Version reported in the hello handshake and status
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default timeout for a single frame read or write
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest accepted frame body
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Operation on a single-key stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockOperation {
    Lock,
    Unlock,
}

/// How one container key is requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UseOperation {
    Lock,
    SharedLock,
    InitLock,
    InitSharedLock,
}

impl UseOperation {
    pub fn new(exclusive: bool, want_init: bool) -> Self {
        match (exclusive, want_init) {
            (true, false) => Self::Lock,
            (false, false) => Self::SharedLock,
            (true, true) => Self::InitLock,
            (false, true) => Self::InitSharedLock,
        }
    }
}

impl From<UseOperation> for ContainerMode {
    fn from(op: UseOperation) -> Self {
        match op {
            UseOperation::Lock => ContainerMode::Lock,
            UseOperation::SharedLock => ContainerMode::SharedLock,
            UseOperation::InitLock => ContainerMode::InitLock,
            UseOperation::InitSharedLock => ContainerMode::InitSharedLock,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Unlocked,
    Locked,
    SharedLocked,
}

/// Per-key outcome of a container-use request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockResult {
    pub state: LockState,
    #[serde(default)]
    pub acquire_init: bool,
}

impl LockResult {
    pub fn unlocked() -> Self {
        Self {
            state: LockState::Unlocked,
            acquire_init: false,
        }
    }
}

/// Messages on a container-use stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContainerUseRequest {
    Acquire {
        targets: HashMap<String, UseOperation>,
    },
    /// Outcome of the setup for a key this stream was elected to initialize
    Init { key: String, succeeded: bool },
    Release,
}

/// Request from client to daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    Hello { version: String },
    Ping,
    Status,
    /// Ask the coordinator to shut down gracefully
    Interrupt,
    Namespace { operation: LockOperation },
    Build { key: String, operation: LockOperation },
    ContainerSetup { key: String, operation: LockOperation },
    ContainerUse { request: ContainerUseRequest },
}

impl Request {
    /// The lock stream this request belongs to, if any
    pub fn stream_kind(&self) -> Option<StreamKind> {
        match self {
            Request::Namespace { .. } => Some(StreamKind::Namespace),
            Request::Build { .. } => Some(StreamKind::Build),
            Request::ContainerSetup { .. } => Some(StreamKind::ContainerSetup),
            Request::ContainerUse { .. } => Some(StreamKind::ContainerUse),
            Request::Hello { .. } | Request::Ping | Request::Status | Request::Interrupt => None,
        }
    }
}

/// Kinds of lock stream; a connection is bound to one by its first message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Namespace,
    Build,
    ContainerSetup,
    ContainerUse,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamKind::Namespace => "namespace",
            StreamKind::Build => "build",
            StreamKind::ContainerSetup => "container-setup",
            StreamKind::ContainerUse => "container-use",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidArgument,
    Cancelled,
    Unavailable,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::Internal => "internal",
        }
    }

    /// Turn a remote error back into the error class a local caller sees
    pub fn into_lock_error(self, message: String) -> LockError {
        match self {
            ErrorCode::InvalidArgument => LockError::Misuse(message),
            ErrorCode::Cancelled => LockError::Cancelled,
            code => LockError::Rejected {
                code: code.as_str().to_string(),
                message,
            },
        }
    }
}

/// Response from daemon to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Hello {
        version: String,
    },
    Pong,
    Lock {
        state: LockState,
    },
    Acquire {
        results: HashMap<String, LockResult>,
    },
    Status {
        uptime_secs: u64,
        sessions_active: usize,
        version: String,
    },
    ShuttingDown,
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl Response {
    pub fn invalid(message: impl Into<String>) -> Self {
        Response::Error {
            code: ErrorCode::InvalidArgument,
            message: message.into(),
        }
    }
}

impl From<&LockError> for Response {
    fn from(err: &LockError) -> Self {
        let code = match err {
            LockError::Misuse(_) => ErrorCode::InvalidArgument,
            LockError::Cancelled | LockError::DeadlineExceeded => ErrorCode::Cancelled,
            LockError::Transport(_) => ErrorCode::Unavailable,
            LockError::Init(_) | LockError::Rejected { .. } => ErrorCode::Internal,
        };
        let message = match err {
            LockError::Misuse(message) => message.clone(),
            other => other.to_string(),
        };
        Response::Error { code, message }
    }
}

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}

/// Serialize a message to JSON (no length prefix)
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(message)?)
}

/// Deserialize a message from JSON
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Read one length-prefixed frame
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    }

    let size = u32::from_be_bytes(len_buf) as usize;
    if size > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; size];
    match reader.read_exact(&mut body).await {
        Ok(_) => Ok(body),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(ProtocolError::ConnectionClosed)
        }
        Err(e) => Err(e.into()),
    }
}

/// Write one length-prefixed frame
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), ProtocolError> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: data.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and decode a request, failing if none arrives within `timeout`
pub async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut R,
    timeout: Duration,
) -> Result<Request, ProtocolError> {
    let bytes = tokio::time::timeout(timeout, read_message(reader))
        .await
        .map_err(|_| ProtocolError::Timeout)??;
    decode(&bytes)
}

/// Encode and write a response within `timeout`
pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &Response,
    timeout: Duration,
) -> Result<(), ProtocolError> {
    let data = encode(response)?;
    tokio::time::timeout(timeout, write_message(writer, &data))
        .await
        .map_err(|_| ProtocolError::Timeout)?
}

/// Encode and write a request within `timeout`
pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request: &Request,
    timeout: Duration,
) -> Result<(), ProtocolError> {
    let data = encode(request)?;
    tokio::time::timeout(timeout, write_message(writer, &data))
        .await
        .map_err(|_| ProtocolError::Timeout)?
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
