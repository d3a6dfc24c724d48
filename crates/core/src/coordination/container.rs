// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! "Initialize once, then share" locking for container use
//!
//! The first caller requesting init for a key takes it exclusively and is
//! told so via [`ContainerLockHandle::init_acquired`]. After running its
//! setup it reports the outcome: success downgrades the hold to shared so
//! queued users proceed, failure reopens the wave for the next caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::keyed::{KeyState, KeyedLock};
use super::once::{OnceRegistry, WaveState};
use crate::context::Context;
use crate::error::LockError;

/// Lock table plus init waves for the container-use domain
#[derive(Debug)]
pub struct ContainerLocks {
    locks: KeyedLock,
    waves: OnceRegistry,
}

impl Default for ContainerLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerLocks {
    pub fn new() -> Self {
        Self {
            locks: KeyedLock::new("container-use"),
            waves: OnceRegistry::new(),
        }
    }

    /// Acquire `key` for use, optionally competing to be its initializer.
    ///
    /// With `want_init`, the caller that opens the current wave gets an
    /// exclusive handle with `init_acquired() == true`. Everyone else (and
    /// every caller once the wave has settled) falls through to a plain
    /// exclusive or shared acquisition.
    pub async fn acquire(
        self: &Arc<Self>,
        ctx: &Context,
        key: &str,
        exclusive: bool,
        want_init: bool,
    ) -> Result<ContainerLockHandle, LockError> {
        if key.is_empty() {
            return Err(LockError::misuse("empty container key"));
        }

        if want_init {
            let opened = self
                .waves
                .call(ctx, key, || self.locks.lock(ctx, key))
                .await?;
            if opened.is_some() {
                tracing::debug!(key, exclusive, "acquired as initializer");
                return Ok(ContainerLockHandle::new(self, key, exclusive, true, false));
            }
        }

        if exclusive {
            self.locks.lock(ctx, key).await?;
            Ok(ContainerLockHandle::new(self, key, true, false, false))
        } else {
            self.locks.rlock(ctx, key).await?;
            Ok(ContainerLockHandle::new(self, key, false, false, true))
        }
    }

    pub fn state(&self, key: &str) -> KeyState {
        self.locks.state(key)
    }

    pub fn wave(&self, key: &str) -> WaveState {
        self.waves.state(key)
    }

    /// Forget every successful init so the next user re-initializes
    pub fn reset(&self) {
        self.waves.clear();
    }
}

/// A held container-use lock
///
/// Must be released exactly through the path matching how it is held:
/// `runlock` once downgraded (or acquired shared), `unlock` otherwise.
#[derive(Debug)]
pub struct ContainerLockHandle {
    locks: Arc<ContainerLocks>,
    key: String,
    exclusive: bool,
    init_acquired: bool,
    init_reported: AtomicBool,
    downgraded: AtomicBool,
    released: bool,
}

impl ContainerLockHandle {
    fn new(
        locks: &Arc<ContainerLocks>,
        key: &str,
        exclusive: bool,
        init_acquired: bool,
        downgraded: bool,
    ) -> Self {
        Self {
            locks: Arc::clone(locks),
            key: key.to_string(),
            exclusive,
            init_acquired,
            init_reported: AtomicBool::new(false),
            downgraded: AtomicBool::new(downgraded),
            released: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// True if this caller must run the one-time setup for the key
    pub fn init_acquired(&self) -> bool {
        self.init_acquired
    }

    /// True once the hold is shared
    pub fn is_shared(&self) -> bool {
        self.downgraded.load(Ordering::Acquire)
    }

    /// Report the outcome of the one-time setup. Only valid for the
    /// initializer, and only once.
    ///
    /// On success a shared-mode initializer is downgraded in place. On
    /// failure the wave reopens and the caller should release immediately.
    pub fn set_init_result(&self, ok: bool) -> Result<(), LockError> {
        if !self.init_acquired {
            return Err(LockError::misuse(format!(
                "init result for {:?} reported by a non-initializer",
                self.key
            )));
        }
        if self.init_reported.swap(true, Ordering::AcqRel) {
            return Err(LockError::misuse(format!(
                "init result for {:?} already reported",
                self.key
            )));
        }

        if !ok {
            tracing::warn!(key = %self.key, "initialization failed, reopening wave");
            self.locks.waves.refresh(&self.key);
            return Ok(());
        }

        if self.exclusive {
            return Ok(());
        }
        if self
            .downgraded
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Err(e) = self.locks.locks.downgrade(&self.key) {
                self.downgraded.store(false, Ordering::Release);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Release the hold
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.release_hold()
    }

    fn release_hold(&self) -> Result<(), LockError> {
        // An initializer that never reported is treated as failed
        if self.init_acquired && !self.init_reported.load(Ordering::Acquire) {
            self.locks.waves.refresh(&self.key);
        }
        if self.downgraded.load(Ordering::Acquire) {
            self.locks.locks.runlock(&self.key)
        } else {
            self.locks.locks.unlock(&self.key)
        }
    }
}

impl Drop for ContainerLockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        tracing::warn!(key = %self.key, "container lock dropped without release");
        if let Err(e) = self.release_hold() {
            tracing::error!(key = %self.key, error = %e, "release on drop failed");
        }
    }
}

#[cfg(test)]
#[path = "container_tests.rs"]
mod tests;
