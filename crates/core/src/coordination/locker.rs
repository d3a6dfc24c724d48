// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The four lock domains behind one object
//!
//! A `Locker` owns its lock tables outright, so independent coordinators
//! (one per test process, or several inside one test) never share state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use super::acquirer::{Acquirer, Granted, KeyLock, LockSet};
use super::container::{ContainerLockHandle, ContainerLocks};
use super::keyed::{KeyState, KeyedLock};
use crate::context::Context;
use crate::error::LockError;

/// Hold on the process-wide namespace mutex. Released on drop.
pub type NamespaceGuard = OwnedMutexGuard<()>;

/// Exclusive hold on one key of a [`KeyedLock`]
#[derive(Debug)]
pub struct KeyGuard {
    locks: Arc<KeyedLock>,
    key: String,
    released: bool,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn unlock(mut self) -> Result<(), LockError> {
        self.released = true;
        self.locks.unlock(&self.key)
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.locks.unlock(&self.key) {
            tracing::error!(domain = self.locks.domain(), key = %self.key, error = %e, "unlock on drop failed");
        }
    }
}

/// How one key of a container batch is requested
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerMode {
    Lock,
    SharedLock,
    InitLock,
    InitSharedLock,
}

impl ContainerMode {
    pub fn exclusive(self) -> bool {
        matches!(self, Self::Lock | Self::InitLock)
    }

    pub fn want_init(self) -> bool {
        matches!(self, Self::InitLock | Self::InitSharedLock)
    }
}

/// Namespace mutex plus the build, container-setup and container-use domains
#[derive(Debug)]
pub struct Locker {
    namespace: Arc<tokio::sync::Mutex<()>>,
    build: Arc<KeyedLock>,
    setup: Arc<KeyedLock>,
    containers: Arc<ContainerLocks>,
    acquirer: Acquirer,
}

impl Default for Locker {
    fn default() -> Self {
        Self::new()
    }
}

impl Locker {
    pub fn new() -> Self {
        Self {
            namespace: Arc::new(tokio::sync::Mutex::new(())),
            build: Arc::new(KeyedLock::new("build")),
            setup: Arc::new(KeyedLock::new("container-setup")),
            containers: Arc::new(ContainerLocks::new()),
            acquirer: Acquirer::new(),
        }
    }

    /// Serialize namespace (network) creation across all callers
    pub async fn lock_for_namespace(&self, ctx: &Context) -> Result<NamespaceGuard, LockError> {
        let guard = ctx.run(Arc::clone(&self.namespace).lock_owned()).await?;
        tracing::debug!("namespace locked");
        Ok(guard)
    }

    /// Serialize builds of the same image reference
    pub async fn lock_for_build(&self, ctx: &Context, key: &str) -> Result<KeyGuard, LockError> {
        lock_key(&self.build, ctx, key).await
    }

    /// Serialize the create-if-missing decision for one container name
    pub async fn lock_for_container_setup(
        &self,
        ctx: &Context,
        key: &str,
    ) -> Result<KeyGuard, LockError> {
        lock_key(&self.setup, ctx, key).await
    }

    /// Acquire one container key, optionally competing to initialize it
    pub async fn acquire_container_lock(
        &self,
        ctx: &Context,
        key: &str,
        exclusive: bool,
        want_init: bool,
    ) -> Result<ContainerLockHandle, LockError> {
        self.containers.acquire(ctx, key, exclusive, want_init).await
    }

    /// Acquire a batch of container keys atomically
    ///
    /// All keys are granted or none are. Batches overlapping on any key are
    /// admitted in submission order.
    pub async fn acquire_container_locks(
        &self,
        ctx: &Context,
        targets: &HashMap<String, ContainerMode>,
    ) -> Result<ContainerLockSet, LockError> {
        if targets.keys().any(|k| k.is_empty()) {
            return Err(LockError::misuse("empty container key"));
        }

        let slots: HashMap<String, Arc<ContainerTarget>> = targets
            .iter()
            .map(|(key, &mode)| {
                let target = Arc::new(ContainerTarget {
                    containers: Arc::clone(&self.containers),
                    key: key.clone(),
                    mode,
                    handle: Mutex::new(None),
                });
                (key.clone(), target)
            })
            .collect();
        let params: LockSet = slots
            .iter()
            .map(|(key, target)| (key.clone(), Arc::clone(target) as Arc<dyn KeyLock>))
            .collect();

        self.acquirer.acquire(ctx, &params).await?;

        let mut handles = HashMap::with_capacity(slots.len());
        for (key, target) in slots {
            match target.take() {
                Some(handle) => {
                    handles.insert(key, handle);
                }
                None => {
                    return Err(LockError::misuse(format!(
                        "container key {key:?} granted without a handle"
                    )))
                }
            }
        }
        Ok(ContainerLockSet { handles })
    }

    /// Forget every settled container init so the next user re-initializes
    pub fn reset_containers(&self) {
        self.containers.reset();
    }

    pub fn build_state(&self, key: &str) -> KeyState {
        self.build.state(key)
    }

    pub fn container_setup_state(&self, key: &str) -> KeyState {
        self.setup.state(key)
    }

    pub fn container_state(&self, key: &str) -> KeyState {
        self.containers.state(key)
    }

    /// Number of container batches queued or acquiring
    pub fn queued_batches(&self) -> usize {
        self.acquirer.queued()
    }
}

async fn lock_key(locks: &Arc<KeyedLock>, ctx: &Context, key: &str) -> Result<KeyGuard, LockError> {
    if key.is_empty() {
        return Err(LockError::misuse(format!("empty {} key", locks.domain())));
    }
    locks.lock(ctx, key).await?;
    tracing::debug!(domain = locks.domain(), key, "locked");
    Ok(KeyGuard {
        locks: Arc::clone(locks),
        key: key.to_string(),
        released: false,
    })
}

/// Adapts one container key to the acquirer, parking the handle once held
struct ContainerTarget {
    containers: Arc<ContainerLocks>,
    key: String,
    mode: ContainerMode,
    handle: Mutex<Option<ContainerLockHandle>>,
}

impl ContainerTarget {
    fn take(&self) -> Option<ContainerLockHandle> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

#[async_trait]
impl KeyLock for ContainerTarget {
    async fn lock(&self, ctx: &Context, granted: &Granted) -> Result<(), LockError> {
        let handle = self
            .containers
            .acquire(ctx, &self.key, self.mode.exclusive(), self.mode.want_init())
            .await?;
        granted.notify();
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    fn unlock(&self) {
        if let Some(handle) = self.take() {
            if let Err(e) = handle.release() {
                tracing::error!(key = %self.key, error = %e, "container release failed");
            }
        }
    }
}

/// Handles granted together by [`Locker::acquire_container_locks`]
#[derive(Debug, Default)]
pub struct ContainerLockSet {
    handles: HashMap<String, ContainerLockHandle>,
}

impl ContainerLockSet {
    pub fn get(&self, key: &str) -> Option<&ContainerLockHandle> {
        self.handles.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.handles.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ContainerLockHandle)> {
        self.handles.iter().map(|(k, h)| (k.as_str(), h))
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Keys this caller must initialize
    pub fn init_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .handles
            .iter()
            .filter(|(_, h)| h.init_acquired())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Report the init outcome for one key of the batch
    pub fn set_init_result(&self, key: &str, ok: bool) -> Result<(), LockError> {
        match self.handles.get(key) {
            Some(handle) => handle.set_init_result(ok),
            None => Err(LockError::misuse(format!("{key:?} is not part of this batch"))),
        }
    }

    /// Release every handle. Unreported initializers count as failed.
    pub fn release(self) -> Result<(), LockError> {
        let mut first = None;
        for (_, handle) in self.handles {
            if let Err(e) = handle.release() {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
#[path = "locker_tests.rs"]
mod tests;
