// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! moor-core: exclusion control engine for shared test resources
//!
//! This crate provides:
//! - Keyed read/write locks with atomic exclusive-to-shared downgrade
//! - "Initialize once, then share" container locking with retry on failure
//! - FIFO, deadlock-free acquisition of overlapping key sets
//! - The `Control` interface and its in-process implementation, `Locker`

pub mod context;
pub mod control;
pub mod coordination;
pub mod error;

pub use context::Context;
pub use control::{Control, InitError, InitFuture, Unlock};
pub use coordination::{
    Acquirer, ContainerLockHandle, ContainerLockSet, ContainerMode, KeyGuard, KeyLock, KeyState,
    KeyedLock, Locker, OnceRegistry, WaveState,
};
pub use error::LockError;
