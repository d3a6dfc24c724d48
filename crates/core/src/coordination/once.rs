// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-key single-flight barrier that can be reopened after failure
//!
//! The first caller of a wave runs the body while later callers wait. A
//! successful body settles the wave for good (until reset); a failed body,
//! or a later [`OnceRegistry::refresh`], returns the key to idle so the next
//! caller starts a new wave.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::context::Context;
use crate::error::LockError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaveState {
    Idle,
    Running,
    Settled,
}

#[derive(Debug)]
struct Wave {
    state: Mutex<WaveState>,
    settled: Notify,
}

impl Wave {
    fn new() -> Self {
        Self {
            state: Mutex::new(WaveState::Idle),
            settled: Notify::new(),
        }
    }

    /// Idle and referenced only by the registry
    fn is_unused(self: &Arc<Self>) -> bool {
        Arc::strong_count(self) == 1 && *self.state() == WaveState::Idle
    }

    fn state(&self) -> MutexGuard<'_, WaveState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Returns the wave to idle if the body never finishes (e.g. the caller's
/// future was dropped mid-body).
struct Running<'a> {
    wave: &'a Wave,
    armed: bool,
}

impl Running<'_> {
    fn finish(mut self, outcome: WaveState) {
        self.armed = false;
        *self.wave.state() = outcome;
        self.wave.settled.notify_waiters();
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.wave.state() = WaveState::Idle;
            self.wave.settled.notify_waiters();
        }
    }
}

/// Registry of waves keyed by resource name
#[derive(Debug, Default)]
pub struct OnceRegistry {
    waves: Mutex<HashMap<String, Arc<Wave>>>,
}

impl OnceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn wave(&self, key: &str) -> Arc<Wave> {
        let mut waves = self.waves.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            waves
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Wave::new())),
        )
    }

    /// Run `body` if this caller opens the current wave for `key`.
    ///
    /// Returns `Ok(Some(_))` when the body ran and succeeded, `Ok(None)` when
    /// the wave had already settled. Callers arriving while another caller's
    /// body runs wait for it; if that body fails they compete to open the
    /// next wave.
    pub async fn call<T, F, Fut>(
        &self,
        ctx: &Context,
        key: &str,
        body: F,
    ) -> Result<Option<T>, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, LockError>>,
    {
        let wave = self.wave(key);
        loop {
            let notified = {
                let mut state = wave.state();
                match *state {
                    WaveState::Settled => return Ok(None),
                    WaveState::Idle => {
                        *state = WaveState::Running;
                        break;
                    }
                    // Registered while the state lock is held, so the
                    // runner's notify_waiters cannot be missed.
                    WaveState::Running => wave.settled.notified(),
                }
            };
            ctx.run(notified).await?;
        }

        let running = Running {
            wave: &wave,
            armed: true,
        };
        match body().await {
            Ok(value) => {
                running.finish(WaveState::Settled);
                Ok(Some(value))
            }
            Err(e) => {
                running.finish(WaveState::Idle);
                drop(wave);
                self.prune(key);
                tracing::debug!(key, error = %e, "wave body failed, reopening");
                Err(e)
            }
        }
    }

    /// Reopen a settled wave so the next caller runs the body again
    pub fn refresh(&self, key: &str) {
        let mut waves = self.waves.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(wave) = waves.get(key) {
            let mut state = wave.state();
            if *state == WaveState::Settled {
                *state = WaveState::Idle;
            }
        }
        if waves.get(key).is_some_and(|wave| wave.is_unused()) {
            waves.remove(key);
        }
    }

    /// Reopen every settled wave
    pub fn clear(&self) {
        let mut waves = self.waves.lock().unwrap_or_else(|e| e.into_inner());
        for wave in waves.values() {
            let mut state = wave.state();
            if *state == WaveState::Settled {
                *state = WaveState::Idle;
            }
        }
        waves.retain(|_, wave| !wave.is_unused());
    }

    /// Forget an idle wave nobody is waiting on
    fn prune(&self, key: &str) {
        let mut waves = self.waves.lock().unwrap_or_else(|e| e.into_inner());
        if waves.get(key).is_some_and(|wave| wave.is_unused()) {
            waves.remove(key);
        }
    }

    pub fn state(&self, key: &str) -> WaveState {
        let waves = self.waves.lock().unwrap_or_else(|e| e.into_inner());
        waves
            .get(key)
            .map_or(WaveState::Idle, |wave| *wave.state())
    }
}

#[cfg(test)]
#[path = "once_tests.rs"]
mod tests;
