// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for lock operations

use thiserror::Error;

/// Errors returned by the exclusion engine
///
/// The variants fall into four classes that callers must be able to tell
/// apart: programmer misuse, cancellation, initializer failure, and (for the
/// remote client) transport failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("context canceled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// Double lock, release without hold, downgrade without exclusive hold,
    /// or any protocol call made out of order.
    #[error("lock misuse: {0}")]
    Misuse(String),

    /// The initializer ran and reported failure; the wave was reset.
    #[error("initialization failed: {0}")]
    Init(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("coordinator rejected request ({code}): {message}")]
    Rejected { code: String, message: String },
}

impl LockError {
    pub fn misuse(message: impl Into<String>) -> Self {
        Self::Misuse(message.into())
    }

    /// True for `Cancelled` and `DeadlineExceeded`
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }

    pub fn is_misuse(&self) -> bool {
        matches!(self, Self::Misuse(_))
    }
}
