// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client side of the coordinator protocol
//!
//! Each lock session is its own connection. Closing the connection releases
//! whatever the session holds, so a crashed test process cannot wedge others.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use moor_core::{Context, Control, InitFuture, LockError, Unlock};
use thiserror::Error;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::{debug, warn};

use crate::lifecycle::{Config, LifecycleError};
use crate::protocol::{
    self, ContainerUseRequest, ErrorCode, LockOperation, LockResult, LockState, ProtocolError,
    Request, Response, StreamKind, UseOperation,
};

// Timeout configuration (env vars in milliseconds)
fn parse_duration_ms(var: &str) -> Option<Duration> {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Timeout for a single request/response exchange (hello, status, unlock)
pub fn timeout_ipc() -> Duration {
    parse_duration_ms("MOOR_TIMEOUT_IPC_MS").unwrap_or(Duration::from_secs(5))
}

/// Timeout for connecting to the coordinator socket
pub fn timeout_connect() -> Duration {
    parse_duration_ms("MOOR_TIMEOUT_CONNECT_MS").unwrap_or(Duration::from_secs(5))
}

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Coordinator not running")]
    DaemonNotRunning,

    #[error("Timed out connecting to coordinator")]
    ConnectTimeout,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Coordinator rejected request ({}): {message}", code.as_str())]
    Rejected { code: ErrorCode, message: String },

    #[error("Unexpected response from coordinator")]
    UnexpectedResponse,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] LifecycleError),
}

impl From<ClientError> for LockError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Rejected { code, message } => code.into_lock_error(message),
            other => LockError::Transport(other.to_string()),
        }
    }
}

/// Answer to a status request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub uptime_secs: u64,
    pub sessions_active: usize,
    pub version: String,
}

/// Coordinator client
#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    socket_path: PathBuf,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl CoordinatorClient {
    /// Client for the coordinator listening on `socket_path`
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            connect_timeout: timeout_connect(),
            io_timeout: timeout_ipc(),
        }
    }

    /// Client for the coordinator serving `project_root`
    pub fn for_project(project_root: &Path) -> Result<Self, ClientError> {
        let config = Config::for_project(project_root)?;
        Ok(Self::new(config.socket_path))
    }

    pub fn with_timeouts(mut self, connect: Duration, io: Duration) -> Self {
        self.connect_timeout = connect;
        self.io_timeout = io;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn connect(&self) -> Result<Connection, ClientError> {
        if !self.socket_path.exists() {
            return Err(ClientError::DaemonNotRunning);
        }
        let stream = tokio::time::timeout(
            self.connect_timeout,
            UnixStream::connect(&self.socket_path),
        )
        .await
        .map_err(|_| ClientError::ConnectTimeout)??;
        Ok(Connection::new(stream, self.io_timeout))
    }

    /// Send a unary request on a fresh connection
    async fn send(&self, request: Request) -> Result<Response, ClientError> {
        let mut conn = self.connect().await?;
        let response = conn.exchange(&request, self.io_timeout).await?;
        match response {
            Response::Error { code, message } => Err(ClientError::Rejected { code, message }),
            other => Ok(other),
        }
    }

    /// Get coordinator version via Hello handshake
    pub async fn hello(&self) -> Result<String, ClientError> {
        match self
            .send(Request::Hello {
                version: protocol::PROTOCOL_VERSION.to_string(),
            })
            .await?
        {
            Response::Hello { version } => Ok(version),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        match self.send(Request::Ping).await? {
            Response::Pong => Ok(()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn status(&self) -> Result<StatusReport, ClientError> {
        match self.send(Request::Status).await? {
            Response::Status {
                uptime_secs,
                sessions_active,
                version,
            } => Ok(StatusReport {
                uptime_secs,
                sessions_active,
                version,
            }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Request graceful coordinator shutdown
    pub async fn interrupt(&self) -> Result<(), ClientError> {
        match self.send(Request::Interrupt).await? {
            Response::ShuttingDown => Ok(()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn namespace_session(&self) -> Result<NamespaceSession, ClientError> {
        Ok(NamespaceSession {
            conn: self.connect().await?,
        })
    }

    pub async fn build_session(&self) -> Result<KeyedSession, ClientError> {
        Ok(KeyedSession {
            conn: self.connect().await?,
            kind: StreamKind::Build,
        })
    }

    pub async fn container_setup_session(&self) -> Result<KeyedSession, ClientError> {
        Ok(KeyedSession {
            conn: self.connect().await?,
            kind: StreamKind::ContainerSetup,
        })
    }

    pub async fn container_session(&self) -> Result<ContainerSession, ClientError> {
        Ok(ContainerSession {
            conn: self.connect().await?,
        })
    }
}

/// One open stream. Dropped on any failed call, which the coordinator
/// treats as the session ending.
#[derive(Debug)]
struct Connection {
    io: Option<(OwnedReadHalf, OwnedWriteHalf)>,
    io_timeout: Duration,
}

impl Connection {
    fn new(stream: UnixStream, io_timeout: Duration) -> Self {
        Self {
            io: Some(stream.into_split()),
            io_timeout,
        }
    }

    /// Unary exchange bounded by `timeout` on both legs
    async fn exchange(
        &mut self,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response, ClientError> {
        let (reader, writer) = self
            .io
            .as_mut()
            .ok_or(ClientError::Protocol(ProtocolError::ConnectionClosed))?;
        protocol::write_request(writer, request, timeout).await?;
        let frame = tokio::time::timeout(timeout, protocol::read_message(reader))
            .await
            .map_err(|_| ProtocolError::Timeout)??;
        Ok(protocol::decode(&frame)?)
    }

    /// Stream call whose wait for the response is bounded by `ctx`
    async fn call(&mut self, ctx: &Context, request: &Request) -> Result<Response, LockError> {
        let Some((reader, writer)) = self.io.as_mut() else {
            return Err(LockError::Transport("session connection closed".to_string()));
        };
        let io_timeout = self.io_timeout;

        let result: Result<Response, LockError> = async {
            protocol::write_request(writer, request, io_timeout)
                .await
                .map_err(ClientError::from)?;
            let frame = ctx
                .run(protocol::read_message(reader))
                .await?
                .map_err(ClientError::from)?;
            Ok(protocol::decode(&frame).map_err(ClientError::from)?)
        }
        .await;

        match result {
            Ok(Response::Error { code, message }) => Err(code.into_lock_error(message)),
            Ok(response) => Ok(response),
            Err(e) => {
                // The response may still arrive; drop the stream so the
                // coordinator releases instead of granting to nobody.
                debug!(error = %e, "closing session connection");
                self.io = None;
                Err(e)
            }
        }
    }
}

fn expect_lock_state(response: Response, expected: LockState) -> Result<(), LockError> {
    match response {
        Response::Lock { state } if state == expected => Ok(()),
        other => Err(LockError::Transport(format!(
            "unexpected response: {other:?}"
        ))),
    }
}

fn expect_results(response: Response) -> Result<HashMap<String, LockResult>, LockError> {
    match response {
        Response::Acquire { results } => Ok(results),
        other => Err(LockError::Transport(format!(
            "unexpected response: {other:?}"
        ))),
    }
}

/// Namespace lock stream
#[derive(Debug)]
pub struct NamespaceSession {
    conn: Connection,
}

impl NamespaceSession {
    pub async fn lock(&mut self, ctx: &Context) -> Result<(), LockError> {
        let request = Request::Namespace {
            operation: LockOperation::Lock,
        };
        expect_lock_state(self.conn.call(ctx, &request).await?, LockState::Locked)
    }

    pub async fn unlock(&mut self, ctx: &Context) -> Result<(), LockError> {
        let request = Request::Namespace {
            operation: LockOperation::Unlock,
        };
        expect_lock_state(self.conn.call(ctx, &request).await?, LockState::Unlocked)
    }
}

/// Build or container-setup lock stream
#[derive(Debug)]
pub struct KeyedSession {
    conn: Connection,
    kind: StreamKind,
}

impl KeyedSession {
    fn request(&self, key: &str, operation: LockOperation) -> Request {
        let key = key.to_string();
        match self.kind {
            StreamKind::Build => Request::Build { key, operation },
            _ => Request::ContainerSetup { key, operation },
        }
    }

    pub async fn lock(&mut self, ctx: &Context, key: &str) -> Result<(), LockError> {
        let request = self.request(key, LockOperation::Lock);
        expect_lock_state(self.conn.call(ctx, &request).await?, LockState::Locked)
    }

    pub async fn unlock(&mut self, ctx: &Context, key: &str) -> Result<(), LockError> {
        let request = self.request(key, LockOperation::Unlock);
        expect_lock_state(self.conn.call(ctx, &request).await?, LockState::Unlocked)
    }
}

/// Container-use stream: acquire a batch, report inits, release
#[derive(Debug)]
pub struct ContainerSession {
    conn: Connection,
}

impl ContainerSession {
    pub async fn acquire(
        &mut self,
        ctx: &Context,
        targets: HashMap<String, UseOperation>,
    ) -> Result<HashMap<String, LockResult>, LockError> {
        let request = Request::ContainerUse {
            request: ContainerUseRequest::Acquire { targets },
        };
        expect_results(self.conn.call(ctx, &request).await?)
    }

    /// Report the setup outcome for a key this session initializes
    pub async fn init(
        &mut self,
        ctx: &Context,
        key: &str,
        succeeded: bool,
    ) -> Result<LockResult, LockError> {
        let request = Request::ContainerUse {
            request: ContainerUseRequest::Init {
                key: key.to_string(),
                succeeded,
            },
        };
        let results = expect_results(self.conn.call(ctx, &request).await?)?;
        results
            .get(key)
            .copied()
            .ok_or_else(|| LockError::Transport(format!("no result for {key:?}")))
    }

    pub async fn release(&mut self, ctx: &Context) -> Result<(), LockError> {
        let request = Request::ContainerUse {
            request: ContainerUseRequest::Release,
        };
        expect_results(self.conn.call(ctx, &request).await?).map(drop)
    }
}

/// [`Control`] backed by a remote coordinator.
///
/// Unlike [`Locker`](moor_core::Locker), calling an [`Unlock`] returned here
/// does not release synchronously: the unlock request is sent on a spawned
/// task, so the coordinator may still report the key held for a moment after
/// the call returns. Callers that must observe the release before moving on
/// should hold a session from [`CoordinatorClient`] and await its `unlock` or
/// `release` directly.
#[derive(Debug, Clone)]
pub struct RemoteControl {
    client: CoordinatorClient,
}

impl RemoteControl {
    pub fn new(client: CoordinatorClient) -> Self {
        Self { client }
    }

    fn cleanup_ctx(&self) -> Context {
        Context::with_timeout(self.client.io_timeout)
    }

    fn io_timeout(&self) -> Duration {
        self.client.io_timeout
    }
}

/// Send the explicit unlock in the background. Without a runtime the
/// session is dropped instead, and the disconnect releases it.
fn release_later<F>(release: F) -> Unlock
where
    F: Future<Output = Result<(), LockError>> + Send + 'static,
{
    Unlock::new(move || match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                if let Err(e) = release.await {
                    warn!(error = %e, "explicit unlock failed, releasing by disconnect");
                }
            });
        }
        Err(_) => drop(release),
    })
}

#[async_trait]
impl Control for RemoteControl {
    async fn lock_for_namespace(&self, ctx: &Context) -> Result<Unlock, LockError> {
        let mut session = self.client.namespace_session().await?;
        session.lock(ctx).await?;
        let io = self.io_timeout();
        Ok(release_later(async move {
            session.unlock(&Context::with_timeout(io)).await
        }))
    }

    async fn lock_for_build(&self, ctx: &Context, key: &str) -> Result<Unlock, LockError> {
        let mut session = self.client.build_session().await?;
        session.lock(ctx, key).await?;
        let io = self.io_timeout();
        let key = key.to_string();
        Ok(release_later(async move {
            session.unlock(&Context::with_timeout(io), &key).await
        }))
    }

    async fn lock_for_container_setup(
        &self,
        ctx: &Context,
        key: &str,
    ) -> Result<Unlock, LockError> {
        let mut session = self.client.container_setup_session().await?;
        session.lock(ctx, key).await?;
        let io = self.io_timeout();
        let key = key.to_string();
        Ok(release_later(async move {
            session.unlock(&Context::with_timeout(io), &key).await
        }))
    }

    async fn lock_for_container_use(
        &self,
        ctx: &Context,
        key: &str,
        exclusive: bool,
        init: Option<InitFuture>,
    ) -> Result<Unlock, LockError> {
        let mut session = self.client.container_session().await?;
        let operation = UseOperation::new(exclusive, init.is_some());
        let results = session
            .acquire(ctx, HashMap::from([(key.to_string(), operation)]))
            .await?;
        let initializer = results.get(key).is_some_and(|r| r.acquire_init);

        if let (true, Some(init)) = (initializer, init) {
            let outcome = match ctx.run(init).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(LockError::Init(e.to_string())),
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                warn!(key, error = %e, "container init failed");
                let cleanup = self.cleanup_ctx();
                if let Err(report) = session.init(&cleanup, key, false).await {
                    debug!(key, error = %report, "init failure report not delivered");
                }
                if let Err(release) = session.release(&cleanup).await {
                    debug!(key, error = %release, "release not delivered, closing session");
                }
                return Err(e);
            }
            session.init(ctx, key, true).await?;
        }

        let io = self.io_timeout();
        Ok(release_later(async move {
            session.release(&Context::with_timeout(io)).await
        }))
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
