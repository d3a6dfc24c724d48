// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Socket server and connection handling.
//!
//! One task per connection. A reader task owns the read half and cancels the
//! connection's context on EOF, so a client that disconnects mid-wait aborts
//! its wait, and the session releases its holds when the handler returns.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use moor_core::{Context, Locker};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::lifecycle::Settings;
use crate::protocol::{self, ProtocolError, Request, Response, PROTOCOL_VERSION};
use crate::session::Session;

/// Accepts connections and serves them from one shared [`Locker`]
#[derive(Debug)]
pub struct Server {
    locker: Arc<Locker>,
    settings: Settings,
    start_time: Instant,
    sessions_active: AtomicUsize,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(locker: Arc<Locker>, settings: Settings) -> Self {
        Self {
            locker,
            settings,
            start_time: Instant::now(),
            sessions_active: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn locker(&self) -> &Arc<Locker> {
        &self.locker
    }

    /// Canceling this token stops the accept loop and every open session
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of connections currently bound to a lock stream
    pub fn sessions_active(&self) -> usize {
        self.sessions_active.load(Ordering::SeqCst)
    }

    /// Accept connections until shutdown is requested, then give open
    /// sessions up to `release_grace` to wind down.
    pub async fn run(self: Arc<Self>, listener: UnixListener) {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = listener.accept() => match result {
                    Ok((stream, _)) => {
                        let server = Arc::clone(&self);
                        connections.spawn(async move {
                            if let Err(e) = server.handle_connection(stream).await {
                                error!("Error handling connection: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
        drop(listener);

        let open = connections.len();
        if open > 0 {
            info!(open, "waiting for sessions to release");
        }
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(self.settings.release_grace, drain)
            .await
            .is_err()
        {
            warn!(
                open = connections.len(),
                "sessions still open after grace period, aborting"
            );
            connections.shutdown().await;
        }
        info!("accept loop stopped");
    }

    /// Serve one connection until EOF, error, or shutdown
    async fn handle_connection(self: Arc<Self>, stream: UnixStream) -> Result<(), ServerError> {
        let (mut reader, mut writer) = stream.into_split();
        let closed = self.shutdown.child_token();
        let (tx, mut rx) = mpsc::channel::<Result<Request, ProtocolError>>(8);

        let _reader = AbortOnDrop(tokio::spawn({
            let closed = closed.clone();
            async move {
                loop {
                    let frame = match protocol::read_message(&mut reader).await {
                        Ok(frame) => frame,
                        Err(ProtocolError::ConnectionClosed) => break,
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            break;
                        }
                    };
                    let request = protocol::decode::<Request>(&frame);
                    let malformed = request.is_err();
                    if tx.send(request).await.is_err() || malformed {
                        break;
                    }
                }
                closed.cancel();
            }
        }));

        let ctx = Context::from_token(closed.clone());
        let mut session = Session::new(Arc::clone(&self.locker));
        let mut active: Option<ActiveSession<'_>> = None;
        debug!(session = %session.id(), "connection opened");

        loop {
            let request = tokio::select! {
                biased;
                message = rx.recv() => match message {
                    Some(Ok(request)) => request,
                    Some(Err(e)) => {
                        let response = Response::invalid(format!("malformed request: {e}"));
                        let _ = protocol::write_response(&mut writer, &response, self.settings.io_timeout).await;
                        return Err(e.into());
                    }
                    None => break,
                },
                _ = closed.cancelled() => break,
            };

            let response = match request {
                Request::Hello { version } => {
                    if version != PROTOCOL_VERSION {
                        debug!(client = %version, "client version differs");
                    }
                    Response::Hello {
                        version: PROTOCOL_VERSION.to_string(),
                    }
                }
                Request::Ping => Response::Pong,
                Request::Status => Response::Status {
                    uptime_secs: self.start_time.elapsed().as_secs(),
                    sessions_active: self.sessions_active(),
                    version: PROTOCOL_VERSION.to_string(),
                },
                Request::Interrupt => {
                    info!("Interrupt requested, shutting down");
                    self.shutdown.cancel();
                    Response::ShuttingDown
                }
                request => {
                    let response = session.handle(&ctx, request).await;
                    if active.is_none() && session.kind().is_some() {
                        active = Some(ActiveSession::enter(&self.sessions_active));
                    }
                    response
                }
            };

            protocol::write_response(&mut writer, &response, self.settings.io_timeout).await?;
        }

        debug!(session = %session.id(), state = ?session.state(), "connection closed");
        session.release_all();
        Ok(())
    }
}

/// Counts a bound session for as long as it lives
struct ActiveSession<'a>(&'a AtomicUsize);

impl<'a> ActiveSession<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveSession<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Server errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),
}
