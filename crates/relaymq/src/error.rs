// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 relaymq.dev

//! Error taxonomy for the client engine.
//!
//! Errors fall into five families (mirroring the recovery design):
//!
//! 1. **Transport**: network I/O failure; surfaced as connection-broken and
//!    handled by recovery, never silently retried at this layer.
//! 2. **Protocol/state**: operating on a closed queue/session/consumer;
//!    reported synchronously, not retried.
//! 3. **Ambiguous outcome**: network loss during a multi-phase commit;
//!    resolved by the verify round trip, surfaced as a rollback when the
//!    broker says so.
//! 4. **Resource exhaustion**: recovery retry budget exceeded; terminal.
//! 5. **Listener/system**: application callback errors are absorbed by the
//!    reader loop; dispatch machinery errors are fatal.

/// Errors returned by client engine operations.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// The connection to the broker is broken (read or write failed).
    ConnectionBroken(String),
    /// I/O error with underlying cause.
    Io(std::io::Error),
    /// A request could not be written to the broker.
    SendFailed(String),
    /// No broker reply arrived within the caller's budget.
    AckTimeout(String),

    // ========================================================================
    // Protocol / State Errors
    // ========================================================================
    /// Invalid state for the requested operation (closed consumer, paused
    /// entity that was never registered, etc).
    IllegalState(String),
    /// The entity (queue, session, connection) has been closed.
    Closed,

    // ========================================================================
    // Transaction Errors
    // ========================================================================
    /// The broker rolled the transaction back (directly, or as the resolved
    /// outcome of a commit interrupted by failover).
    TransactionRolledBack(String),

    // ========================================================================
    // Terminal Errors
    // ========================================================================
    /// Connection recovery exhausted its retry budget; no further automatic
    /// retry is attempted.
    RecoveryAborted,
    /// Unrecoverable error in engine code (not application callbacks); the
    /// connection is marked for fatal-error handling.
    Fatal(String),

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration value out of range or inconsistent.
    InvalidConfig(String),
}

impl Error {
    /// True for network-layer failures: the class of error that triggers
    /// recovery and, during a commit, makes the outcome ambiguous.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Error::ConnectionBroken(_) | Error::Io(_) | Error::SendFailed(_) | Error::AckTimeout(_)
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::ConnectionBroken(msg) => write!(f, "Connection broken: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::SendFailed(msg) => write!(f, "Send failed: {}", msg),
            Error::AckTimeout(msg) => write!(f, "No broker reply: {}", msg),
            Error::IllegalState(msg) => write!(f, "Invalid state: {}", msg),
            Error::Closed => write!(f, "Closed"),
            Error::TransactionRolledBack(msg) => write!(f, "Transaction rolled back: {}", msg),
            Error::RecoveryAborted => write!(f, "Connection recovery aborted (retry budget exhausted)"),
            Error::Fatal(msg) => write!(f, "Fatal engine error: {}", msg),
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
