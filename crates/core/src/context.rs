// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cancellation context for blocking lock operations
//!
//! A `Context` pairs a cancellation token with an optional deadline. Every
//! operation that may suspend takes one, and returns `LockError::Cancelled`
//! or `LockError::DeadlineExceeded` when it gives up waiting.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::LockError;

/// Cancellation scope for a blocking call
#[derive(Clone, Debug, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never canceled and has no deadline
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Wrap an existing token (e.g. one owned by a connection)
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derive a context that is canceled with `self` but can also be
    /// canceled on its own. The deadline is inherited.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derive a child context with a tighter deadline
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the error this context would report right now, if done
    pub fn err(&self) -> Option<LockError> {
        if self.token.is_cancelled() {
            return Some(LockError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(LockError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the context is canceled or its deadline passes
    pub async fn done(&self) -> LockError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => LockError::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => LockError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                LockError::Cancelled
            }
        }
    }

    /// Drive `fut` until it completes or the context ends.
    ///
    /// An already-finished context fails fast without polling `fut`. When the
    /// context ends first, `fut` is dropped.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, LockError> {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            out = fut => Ok(out),
            err = self.done() => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn background_runs_to_completion() {
        let ctx = Context::background();
        assert_eq!(ctx.run(async { 7 }).await.unwrap(), 7);
        assert!(!ctx.is_done());
    }

    #[tokio::test]
    async fn canceled_context_fails_fast() {
        let ctx = Context::background();
        ctx.cancel();
        let err = ctx.run(std::future::pending::<()>()).await.unwrap_err();
        assert!(matches!(err, LockError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_interrupts_pending_future() {
        let ctx = Context::with_timeout(Duration::from_millis(50));
        let err = ctx.run(std::future::pending::<()>()).await.unwrap_err();
        assert!(matches!(err, LockError::DeadlineExceeded));
        assert!(ctx.is_done());
    }

    #[tokio::test]
    async fn child_is_canceled_with_parent() {
        let parent = Context::background();
        let child = parent.child();
        parent.cancel();
        assert!(matches!(child.err(), Some(LockError::Cancelled)));
    }

    #[tokio::test]
    async fn canceling_child_leaves_parent_alive() {
        let parent = Context::background();
        let child = parent.child();
        child.cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn child_with_timeout_keeps_earlier_parent_deadline() {
        let parent = Context::with_timeout(Duration::from_millis(10));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }
}
