// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by the whole pipeline.
///
/// Only `Io` is fatal to a job. Everything else is localized to the record
/// that triggered it: the pipeline logs, counts, and continues.
#[derive(Debug, Error)]
pub enum Error {
    /// File or container read failure. Fatal to the current job.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A capture block ends mid-field (leading/trailing length mismatch,
    /// short body). The offending block is skipped with a warning.
    #[error("truncated block: {0}")]
    TruncatedBlock(String),

    /// A packet record ends mid-field. Skipped with a warning.
    #[error("truncated packet: need {needed} bytes, have {available}")]
    TruncatedPacket { needed: usize, available: usize },

    /// Syntactically broken protocol data. Skipped with a warning.
    #[error("malformed {proto}: {reason}")]
    Malformed { proto: &'static str, reason: String },

    /// Recognized but not implemented; the record passes through with
    /// `protocol = UNKNOWN`.
    #[error("unsupported {proto}: {reason}")]
    Unsupported { proto: &'static str, reason: String },

    /// A value is outside policy bounds (extension-header depth, buffered
    /// segment count). Dropped silently after counting.
    #[error("sanity bound exceeded: {0}")]
    Sanity(&'static str),

    /// Inbound event not permitted in the current state machine. Logged at
    /// DEBUG and dropped.
    #[error("state violation: {0}")]
    StateViolation(String),

    /// A table cap was reached; the new entry is refused, the job goes on.
    #[error("resource cap exceeded: {0}")]
    Resource(&'static str),

    /// Stop was requested; workers exit cleanly.
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn malformed(proto: &'static str, reason: impl Into<String>) -> Self {
        Error::Malformed {
            proto,
            reason: reason.into(),
        }
    }

    pub fn unsupported(proto: &'static str, reason: impl Into<String>) -> Self {
        Error::Unsupported {
            proto,
            reason: reason.into(),
        }
    }

    pub fn truncated(needed: usize, available: usize) -> Self {
        Error::TruncatedPacket { needed, available }
    }

    /// Whether the job can survive this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Io(_) | Error::Cancelled)
    }
}
