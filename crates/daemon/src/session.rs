// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-connection lock state
//!
//! A session holds at most one grant: the namespace mutex, one build or
//! container-setup key, or one set of container-use keys. Requests that
//! don't fit the current state are rejected with an invalid-argument error
//! and leave the state untouched. Dropping the session releases whatever it
//! still holds, which is how a disconnect becomes a release.

use std::collections::HashMap;
use std::sync::Arc;

use moor_core::coordination::NamespaceGuard;
use moor_core::{
    ContainerLockHandle, ContainerLockSet, ContainerMode, Context, KeyGuard, LockError, Locker,
};
use tracing::{debug, warn};

use crate::protocol::{
    ContainerUseRequest, LockOperation, LockResult, LockState, Request, Response, StreamKind,
};

enum Held {
    Idle,
    Namespace(NamespaceGuard),
    Key(KeyGuard),
    Containers(ContainerLockSet),
}

/// Server-side state of one lock stream
pub struct Session {
    id: String,
    locker: Arc<Locker>,
    kind: Option<StreamKind>,
    held: Held,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub fn new(locker: Arc<Locker>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            locker,
            kind: None,
            held: Held::Idle,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stream kind, bound by the first lock request that succeeds
    pub fn kind(&self) -> Option<StreamKind> {
        self.kind
    }

    pub fn state(&self) -> LockState {
        match &self.held {
            Held::Idle => LockState::Unlocked,
            Held::Namespace(_) | Held::Key(_) => LockState::Locked,
            Held::Containers(set) => {
                if set.iter().all(|(_, h)| h.is_shared()) {
                    LockState::SharedLocked
                } else {
                    LockState::Locked
                }
            }
        }
    }

    /// Apply one stream request. Waits are bounded by `ctx`.
    pub async fn handle(&mut self, ctx: &Context, request: Request) -> Response {
        let Some(kind) = request.stream_kind() else {
            return Response::invalid("not a lock stream request");
        };
        if let Some(bound) = self.kind {
            if bound != kind {
                return Response::invalid(format!("{kind} request on a {bound} stream"));
            }
        }

        let result = match request {
            Request::Namespace { operation } => self.namespace(ctx, operation).await,
            Request::Build { key, operation } => self.keyed(ctx, kind, &key, operation).await,
            Request::ContainerSetup { key, operation } => {
                self.keyed(ctx, kind, &key, operation).await
            }
            Request::ContainerUse { request } => self.container_use(ctx, request).await,
            Request::Hello { .. } | Request::Ping | Request::Status | Request::Interrupt => {
                Err(LockError::misuse("not a lock stream request"))
            }
        };
        match result {
            Ok(response) => {
                // A rejected first request leaves the stream unbound
                if self.kind.is_none() {
                    debug!(session = %self.id, kind = %kind, "stream bound");
                    self.kind = Some(kind);
                }
                response
            }
            Err(e) => {
                debug!(session = %self.id, error = %e, "request rejected");
                Response::from(&e)
            }
        }
    }

    async fn namespace(
        &mut self,
        ctx: &Context,
        operation: LockOperation,
    ) -> Result<Response, LockError> {
        match operation {
            LockOperation::Lock => {
                if !matches!(self.held, Held::Idle) {
                    return Err(LockError::misuse("namespace already locked"));
                }
                let guard = self.locker.lock_for_namespace(ctx).await?;
                self.held = Held::Namespace(guard);
                Ok(Response::Lock {
                    state: LockState::Locked,
                })
            }
            LockOperation::Unlock => {
                if !matches!(self.held, Held::Namespace(_)) {
                    return Err(LockError::misuse("namespace not locked"));
                }
                self.held = Held::Idle;
                Ok(Response::Lock {
                    state: LockState::Unlocked,
                })
            }
        }
    }

    async fn keyed(
        &mut self,
        ctx: &Context,
        kind: StreamKind,
        key: &str,
        operation: LockOperation,
    ) -> Result<Response, LockError> {
        match operation {
            LockOperation::Lock => {
                if !matches!(self.held, Held::Idle) {
                    return Err(LockError::misuse(format!("{kind} already locked")));
                }
                let guard = if kind == StreamKind::Build {
                    self.locker.lock_for_build(ctx, key).await?
                } else {
                    self.locker.lock_for_container_setup(ctx, key).await?
                };
                self.held = Held::Key(guard);
                Ok(Response::Lock {
                    state: LockState::Locked,
                })
            }
            LockOperation::Unlock => match std::mem::replace(&mut self.held, Held::Idle) {
                Held::Key(guard) if guard.key() == key => {
                    guard.unlock()?;
                    Ok(Response::Lock {
                        state: LockState::Unlocked,
                    })
                }
                Held::Key(guard) => {
                    let err = LockError::misuse(format!(
                        "unlock of {key:?} but {:?} is held",
                        guard.key()
                    ));
                    self.held = Held::Key(guard);
                    Err(err)
                }
                other => {
                    self.held = other;
                    Err(LockError::misuse(format!("{kind} not locked")))
                }
            },
        }
    }

    async fn container_use(
        &mut self,
        ctx: &Context,
        request: ContainerUseRequest,
    ) -> Result<Response, LockError> {
        match request {
            ContainerUseRequest::Acquire { targets } => {
                if !matches!(self.held, Held::Idle) {
                    return Err(LockError::misuse("container set already held"));
                }
                if targets.is_empty() {
                    return Err(LockError::misuse("acquire with no targets"));
                }
                let modes: HashMap<String, ContainerMode> = targets
                    .into_iter()
                    .map(|(key, op)| (key, op.into()))
                    .collect();
                let set = self.locker.acquire_container_locks(ctx, &modes).await?;
                let results = set
                    .iter()
                    .map(|(key, handle)| (key.to_string(), handle_result(handle)))
                    .collect();
                debug!(session = %self.id, keys = set.len(), "container set acquired");
                self.held = Held::Containers(set);
                Ok(Response::Acquire { results })
            }
            ContainerUseRequest::Init { key, succeeded } => {
                let Held::Containers(set) = &self.held else {
                    return Err(LockError::misuse("init before acquire"));
                };
                set.set_init_result(&key, succeeded)?;
                let result = set
                    .get(&key)
                    .map_or_else(LockResult::unlocked, handle_result);
                Ok(Response::Acquire {
                    results: HashMap::from([(key, result)]),
                })
            }
            ContainerUseRequest::Release => match std::mem::replace(&mut self.held, Held::Idle) {
                Held::Containers(set) => {
                    let results = set
                        .keys()
                        .map(|key| (key.to_string(), LockResult::unlocked()))
                        .collect();
                    set.release()?;
                    Ok(Response::Acquire { results })
                }
                other => {
                    self.held = other;
                    Err(LockError::misuse("release without acquire"))
                }
            },
        }
    }

    /// Release whatever is held. Safe to call more than once.
    pub fn release_all(&mut self) {
        match std::mem::replace(&mut self.held, Held::Idle) {
            Held::Idle => {}
            Held::Namespace(guard) => drop(guard),
            Held::Key(guard) => {
                if let Err(e) = guard.unlock() {
                    warn!(session = %self.id, error = %e, "release failed");
                }
            }
            Held::Containers(set) => {
                if let Err(e) = set.release() {
                    warn!(session = %self.id, error = %e, "release failed");
                }
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !matches!(self.held, Held::Idle) {
            warn!(session = %self.id, state = ?self.state(), "session closed while holding locks, releasing");
            self.release_all();
        }
    }
}

fn handle_result(handle: &ContainerLockHandle) -> LockResult {
    LockResult {
        state: if handle.is_shared() {
            LockState::SharedLocked
        } else {
            LockState::Locked
        },
        acquire_init: handle.init_acquired(),
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
