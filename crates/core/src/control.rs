// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The interface resource orchestration consumes
//!
//! `Control` is satisfied in-process by [`Locker`] and out-of-process by the
//! daemon's client stub. Each operation hands back an [`Unlock`] guard.

use std::fmt;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::context::Context;
use crate::coordination::Locker;
use crate::error::LockError;

/// Error returned by a container initializer
pub type InitError = Box<dyn std::error::Error + Send + Sync>;

/// One-time setup run by whichever caller is elected initializer
pub type InitFuture = BoxFuture<'static, Result<(), InitError>>;

/// Releases a lock obtained through [`Control`]
///
/// Calling [`Unlock::unlock`] or dropping the guard releases exactly once.
#[must_use = "dropping an Unlock releases the lock immediately"]
pub struct Unlock {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Unlock {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn unlock(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Unlock {
    fn drop(&mut self) {
        self.fire();
    }
}

impl fmt::Debug for Unlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unlock")
            .field("pending", &self.release.is_some())
            .finish()
    }
}

#[async_trait]
pub trait Control: Send + Sync {
    async fn lock_for_namespace(&self, ctx: &Context) -> Result<Unlock, LockError>;

    async fn lock_for_build(&self, ctx: &Context, key: &str) -> Result<Unlock, LockError>;

    async fn lock_for_container_setup(&self, ctx: &Context, key: &str)
        -> Result<Unlock, LockError>;

    /// Lock a container for use. With `init`, the elected initializer runs it
    /// before the lock is handed back; if it fails, the wave is reopened,
    /// the lock released, and `LockError::Init` returned.
    async fn lock_for_container_use(
        &self,
        ctx: &Context,
        key: &str,
        exclusive: bool,
        init: Option<InitFuture>,
    ) -> Result<Unlock, LockError>;
}

#[async_trait]
impl Control for Locker {
    async fn lock_for_namespace(&self, ctx: &Context) -> Result<Unlock, LockError> {
        let guard = Locker::lock_for_namespace(self, ctx).await?;
        Ok(Unlock::new(move || drop(guard)))
    }

    async fn lock_for_build(&self, ctx: &Context, key: &str) -> Result<Unlock, LockError> {
        let guard = Locker::lock_for_build(self, ctx, key).await?;
        Ok(Unlock::new(move || log_release(guard.key().to_string(), guard.unlock())))
    }

    async fn lock_for_container_setup(
        &self,
        ctx: &Context,
        key: &str,
    ) -> Result<Unlock, LockError> {
        let guard = Locker::lock_for_container_setup(self, ctx, key).await?;
        Ok(Unlock::new(move || log_release(guard.key().to_string(), guard.unlock())))
    }

    async fn lock_for_container_use(
        &self,
        ctx: &Context,
        key: &str,
        exclusive: bool,
        init: Option<InitFuture>,
    ) -> Result<Unlock, LockError> {
        let handle = self
            .acquire_container_lock(ctx, key, exclusive, init.is_some())
            .await?;

        if let (true, Some(init)) = (handle.init_acquired(), init) {
            let outcome = match ctx.run(init).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(LockError::Init(e.to_string())),
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                tracing::warn!(key, error = %e, "container init failed");
                handle.set_init_result(false)?;
                handle.release()?;
                return Err(e);
            }
            handle.set_init_result(true)?;
        }

        let key = key.to_string();
        Ok(Unlock::new(move || log_release(key, handle.release())))
    }
}

fn log_release(key: String, result: Result<(), LockError>) {
    if let Err(e) = result {
        tracing::error!(key = %key, error = %e, "release failed");
    }
}

#[cfg(test)]
#[path = "control_tests.rs"]
mod tests;
