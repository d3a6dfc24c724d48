// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Atomic multi-key acquisition
//!
//! Requests queue in submission order. A scan walks the queue front to back
//! accumulating the keys claimed by admitted entries; a waiting entry is
//! admitted only when none of its keys are claimed by an earlier one, and
//! claims nothing until then. Two entries sharing a key are therefore never
//! acquiring at the same time, and admission order never changes, so
//! overlapping requests cannot deadlock.
//!
//! Each key's locking is delegated to a [`KeyLock`], so the same queue works
//! over [`KeyedLock`] or any other primitive.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::oneshot;

use super::keyed::KeyedLock;
use crate::context::Context;
use crate::error::LockError;

/// Lock/unlock pair for one key of a multi-key request
#[async_trait]
pub trait KeyLock: Send + Sync {
    /// Acquire the key. Implementations should call `granted.notify()` as
    /// soon as the key itself is held, before any follow-up work, so later
    /// requests waiting on it are admitted early.
    async fn lock(&self, ctx: &Context, granted: &Granted) -> Result<(), LockError>;

    fn unlock(&self);
}

/// The keys of one request and how to lock each
pub type LockSet = HashMap<String, Arc<dyn KeyLock>>;

/// Per-key grant notification handed to [`KeyLock::lock`]
pub struct Granted {
    queue: Arc<Mutex<Queue>>,
    id: u64,
    key: String,
    fired: AtomicBool,
}

impl Granted {
    fn new(queue: &Arc<Mutex<Queue>>, id: u64, key: &str) -> Self {
        Self {
            queue: Arc::clone(queue),
            id,
            key: key.to_string(),
            fired: AtomicBool::new(false),
        }
    }

    /// Mark the key as held. Idempotent.
    pub fn notify(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        lock_queue(&self.queue).remove_locked_key(self.id, &self.key);
    }
}

struct Pending {
    id: u64,
    remaining: HashSet<String>,
    /// `None` once admitted
    proceed: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct Queue {
    entries: Vec<Pending>,
    next_id: u64,
}

impl Queue {
    fn accept(&mut self, keys: HashSet<String>) -> (u64, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        self.next_id += 1;
        let id = self.next_id;
        self.entries.push(Pending {
            id,
            remaining: keys,
            proceed: Some(tx),
        });
        self.scan();
        (id, rx)
    }

    fn remove_locked_key(&mut self, id: u64, key: &str) {
        if let Some(pos) = self.entries.iter().position(|e| e.id == id) {
            self.entries[pos].remaining.remove(key);
            if self.entries[pos].remaining.is_empty() {
                self.entries.remove(pos);
            }
        }
        self.scan();
    }

    fn remove(&mut self, id: u64) {
        self.entries.retain(|e| e.id != id);
        self.scan();
    }

    // Re-walks the whole queue on every mutation; fine for the number of
    // keys a test suite contends on.
    fn scan(&mut self) {
        let mut claimed: HashSet<String> = HashSet::new();
        for entry in &mut self.entries {
            if entry.proceed.is_some() {
                if !entry.remaining.is_disjoint(&claimed) {
                    // Still waiting; claims nothing
                    continue;
                }
                if let Some(proceed) = entry.proceed.take() {
                    tracing::trace!(entry = entry.id, "admitted");
                    let _ = proceed.send(());
                }
            }
            claimed.extend(entry.remaining.iter().cloned());
        }
    }
}

fn lock_queue(queue: &Mutex<Queue>) -> MutexGuard<'_, Queue> {
    queue.lock().unwrap_or_else(|e| e.into_inner())
}

/// FIFO, deadlock-free acquisition of key sets
#[derive(Clone, Default)]
pub struct Acquirer {
    queue: Arc<Mutex<Queue>>,
}

impl std::fmt::Debug for Acquirer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acquirer")
            .field("queued", &self.queued())
            .finish()
    }
}

/// Unwinds a request that did not complete: unlocks whatever was granted
/// and drops the queue entry. Also runs if the acquiring future is dropped.
struct Ticket<'a> {
    acquirer: &'a Acquirer,
    params: &'a LockSet,
    id: u64,
    locked: Vec<String>,
    armed: bool,
}

impl Ticket<'_> {
    fn rollback(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        for key in self.locked.drain(..) {
            if let Some(lock) = self.params.get(&key) {
                lock.unlock();
            }
        }
        lock_queue(&self.acquirer.queue).remove(self.id);
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        self.rollback();
    }
}

impl Acquirer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests still queued or acquiring
    pub fn queued(&self) -> usize {
        lock_queue(&self.queue).entries.len()
    }

    /// Acquire every key in `params` or none of them.
    ///
    /// Waits for admission, then locks all keys concurrently. If any key
    /// fails, the remaining attempts are canceled, every granted key is
    /// unlocked, and the first error is returned.
    pub async fn acquire(&self, ctx: &Context, params: &LockSet) -> Result<(), LockError> {
        if params.is_empty() {
            return Ok(());
        }

        let (id, proceed) = lock_queue(&self.queue).accept(params.keys().cloned().collect());
        let mut ticket = Ticket {
            acquirer: self,
            params,
            id,
            locked: Vec::with_capacity(params.len()),
            armed: true,
        };

        ctx.run(proceed)
            .await?
            .map_err(|_| LockError::misuse("acquire request dropped from queue"))?;
        tracing::debug!(entry = id, keys = params.len(), "acquiring");

        let attempt = ctx.child();
        let mut pending: FuturesUnordered<_> = params
            .iter()
            .map(|(key, lock)| {
                let granted = Granted::new(&self.queue, id, key);
                let attempt = &attempt;
                async move {
                    let result = lock.lock(attempt, &granted).await;
                    if result.is_ok() {
                        granted.notify();
                    }
                    (key, result)
                }
            })
            .collect();

        let mut failure = None;
        while let Some((key, result)) = pending.next().await {
            match result {
                Ok(()) => ticket.locked.push(key.clone()),
                Err(e) => {
                    if failure.is_none() {
                        tracing::debug!(entry = id, key = %key, error = %e, "sub-lock failed");
                        attempt.cancel();
                        failure = Some(e);
                    }
                }
            }
        }
        drop(pending);

        if let Some(e) = failure {
            ticket.rollback();
            return Err(e);
        }
        ticket.armed = false;
        Ok(())
    }

    /// Unlock every key of a previously acquired set
    pub fn release(&self, params: &LockSet) {
        for lock in params.values() {
            lock.unlock();
        }
    }
}

/// [`KeyLock`] over one key of a [`KeyedLock`], in either mode
pub struct KeyedLockTarget {
    locks: Arc<KeyedLock>,
    key: String,
    shared: bool,
}

impl KeyedLockTarget {
    pub fn exclusive(locks: &Arc<KeyedLock>, key: impl Into<String>) -> Arc<dyn KeyLock> {
        Arc::new(Self {
            locks: Arc::clone(locks),
            key: key.into(),
            shared: false,
        })
    }

    pub fn shared(locks: &Arc<KeyedLock>, key: impl Into<String>) -> Arc<dyn KeyLock> {
        Arc::new(Self {
            locks: Arc::clone(locks),
            key: key.into(),
            shared: true,
        })
    }
}

#[async_trait]
impl KeyLock for KeyedLockTarget {
    async fn lock(&self, ctx: &Context, granted: &Granted) -> Result<(), LockError> {
        if self.shared {
            self.locks.rlock(ctx, &self.key).await?;
        } else {
            self.locks.lock(ctx, &self.key).await?;
        }
        granted.notify();
        Ok(())
    }

    fn unlock(&self) {
        let result = if self.shared {
            self.locks.runlock(&self.key)
        } else {
            self.locks.unlock(&self.key)
        };
        if let Err(e) = result {
            tracing::error!(key = %self.key, error = %e, "unlock failed");
        }
    }
}

#[cfg(test)]
#[path = "acquirer_tests.rs"]
mod tests;
