// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! moor-daemon: the exclusion engine shared across processes
//!
//! `moord` hosts one [`moor_core::Locker`] behind a Unix socket. Test
//! processes talk to it through [`CoordinatorClient`] or use
//! [`RemoteControl`] wherever a [`moor_core::Control`] is expected.

pub mod client;
pub mod lifecycle;
pub mod protocol;
pub mod server;
pub mod session;

pub use client::{
    ClientError, ContainerSession, CoordinatorClient, KeyedSession, NamespaceSession,
    RemoteControl, StatusReport,
};
pub use lifecycle::{Config, DaemonState, LifecycleError, Settings};
pub use protocol::{
    ContainerUseRequest, ErrorCode, LockOperation, LockResult, LockState, Request, Response,
    StreamKind, UseOperation,
};
pub use server::{Server, ServerError};
pub use session::Session;
