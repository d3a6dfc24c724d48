// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lock primitives for shared test resources
//!
//! This module provides:
//! - **KeyedLock** - Per-key read/write lock with atomic downgrade
//! - **OnceRegistry** - Per-key single-flight barrier that reopens on failure
//! - **ContainerLocks** - Initialize-once-then-share locking built on both
//! - **Acquirer** - FIFO, deadlock-free acquisition of key sets
//! - **Locker** - The namespace, build, container-setup and container-use domains

pub mod acquirer;
pub mod container;
pub mod keyed;
pub mod locker;
pub mod once;

pub use acquirer::{Acquirer, Granted, KeyLock, KeyedLockTarget, LockSet};
pub use container::{ContainerLockHandle, ContainerLocks};
pub use keyed::{KeyState, KeyedLock, WEIGHT};
pub use locker::{ContainerLockSet, ContainerMode, KeyGuard, Locker, NamespaceGuard};
pub use once::{OnceRegistry, WaveState};
