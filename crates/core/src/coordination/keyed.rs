// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Keyed read/write lock with atomic downgrade
//!
//! Each key owns a weighted semaphore of capacity [`WEIGHT`]. An exclusive
//! hold consumes every permit, a shared hold consumes one. Downgrading hands
//! back `WEIGHT - 1` permits in a single call, so the key moves from exclusive
//! to shared without ever being observably unlocked.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Semaphore;

use crate::context::Context;
use crate::error::LockError;

/// Semaphore capacity per key. Fits tokio's permit limit on 32-bit targets.
pub const WEIGHT: u32 = 1 << 28;

/// Observable state of a single key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyState {
    Unlocked,
    Shared(u32),
    Exclusive,
}

/// Bookkeeping used to reject releases that don't match a hold
#[derive(Debug, Default)]
struct Holds {
    exclusive: bool,
    shared: u32,
}

#[derive(Debug)]
struct Slot {
    permits: Semaphore,
    holds: Mutex<Holds>,
}

impl Slot {
    fn new() -> Self {
        Self {
            permits: Semaphore::new(WEIGHT as usize),
            holds: Mutex::new(Holds::default()),
        }
    }

    fn holds(&self) -> MutexGuard<'_, Holds> {
        self.holds.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Per-key exclusive/shared lock
#[derive(Debug)]
pub struct KeyedLock {
    domain: String,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl KeyedLock {
    /// Create an empty lock table. `domain` only labels log lines.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    fn slot(&self, key: &str) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Slot::new())),
        )
    }

    /// Drop the slot for `key` once nothing holds or waits on it. Waiters
    /// keep a clone of the slot, so the table's reference being the only one
    /// means nobody is queued.
    fn prune(&self, key: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let idle = slots.get(key).is_some_and(|slot| {
            let holds = slot.holds();
            Arc::strong_count(slot) == 1 && !holds.exclusive && holds.shared == 0
        });
        if idle {
            slots.remove(key);
        }
    }

    fn existing(&self, key: &str) -> Option<Arc<Slot>> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(key).cloned()
    }

    /// Block until `key` is held exclusively
    pub async fn lock(&self, ctx: &Context, key: &str) -> Result<(), LockError> {
        let slot = self.slot(key);
        let permit = ctx
            .run(slot.permits.acquire_many(WEIGHT))
            .await?
            .map_err(|_| self.closed(key))?;
        permit.forget();
        slot.holds().exclusive = true;
        tracing::debug!(domain = %self.domain, key, "locked");
        Ok(())
    }

    /// Take `key` exclusively if nobody holds it and nobody is queued ahead
    pub fn try_lock(&self, key: &str) -> bool {
        let slot = self.slot(key);
        let acquired = match slot.permits.try_acquire_many(WEIGHT) {
            Ok(permit) => {
                permit.forget();
                slot.holds().exclusive = true;
                tracing::debug!(domain = %self.domain, key, "try-locked");
                true
            }
            Err(_) => false,
        };
        acquired
    }

    /// Release an exclusive hold
    pub fn unlock(&self, key: &str) -> Result<(), LockError> {
        let slot = self.existing(key).ok_or_else(|| self.not_held(key, "unlock"))?;
        let mut holds = slot.holds();
        if !holds.exclusive {
            return Err(self.not_held(key, "unlock"));
        }
        holds.exclusive = false;
        slot.permits.add_permits(WEIGHT as usize);
        drop(holds);
        drop(slot);
        tracing::debug!(domain = %self.domain, key, "unlocked");
        self.prune(key);
        Ok(())
    }

    /// Block until a shared hold on `key` is granted
    pub async fn rlock(&self, ctx: &Context, key: &str) -> Result<(), LockError> {
        let slot = self.slot(key);
        let permit = ctx
            .run(slot.permits.acquire())
            .await?
            .map_err(|_| self.closed(key))?;
        permit.forget();
        slot.holds().shared += 1;
        tracing::debug!(domain = %self.domain, key, "read-locked");
        Ok(())
    }

    /// Release one shared hold
    pub fn runlock(&self, key: &str) -> Result<(), LockError> {
        let slot = self
            .existing(key)
            .ok_or_else(|| self.not_held(key, "runlock"))?;
        let mut holds = slot.holds();
        if holds.shared == 0 {
            return Err(self.not_held(key, "runlock"));
        }
        holds.shared -= 1;
        slot.permits.add_permits(1);
        drop(holds);
        drop(slot);
        tracing::debug!(domain = %self.domain, key, "read-unlocked");
        self.prune(key);
        Ok(())
    }

    /// Exchange the caller's exclusive hold for a shared hold.
    ///
    /// The bookkeeping and the permit release happen under one mutex and one
    /// `add_permits` call; queued waiters see the shared state directly.
    pub fn downgrade(&self, key: &str) -> Result<(), LockError> {
        let slot = self
            .existing(key)
            .ok_or_else(|| self.not_held(key, "downgrade"))?;
        let mut holds = slot.holds();
        if !holds.exclusive {
            return Err(self.not_held(key, "downgrade"));
        }
        holds.exclusive = false;
        holds.shared += 1;
        slot.permits.add_permits((WEIGHT - 1) as usize);
        tracing::debug!(domain = %self.domain, key, "downgraded");
        Ok(())
    }

    pub fn state(&self, key: &str) -> KeyState {
        let Some(slot) = self.existing(key) else {
            return KeyState::Unlocked;
        };
        let holds = slot.holds();
        if holds.exclusive {
            KeyState::Exclusive
        } else if holds.shared > 0 {
            KeyState::Shared(holds.shared)
        } else {
            KeyState::Unlocked
        }
    }

    /// Keys that currently have at least one hold
    pub fn held_keys(&self) -> Vec<String> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .iter()
            .filter(|(_, slot)| {
                let holds = slot.holds();
                holds.exclusive || holds.shared > 0
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn not_held(&self, key: &str, op: &str) -> LockError {
        LockError::misuse(format!(
            "{} on {} key {:?} without a matching hold",
            op, self.domain, key
        ))
    }

    fn closed(&self, key: &str) -> LockError {
        LockError::misuse(format!("{} semaphore for {:?} closed", self.domain, key))
    }
}

#[cfg(test)]
#[path = "keyed_tests.rs"]
mod tests;
