// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
use relay_shared::sys::Truncated;

/// Broker operation result.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the endpoint operations themselves.
///
/// Faults a worker commits *inside* a well-formed command stream are not
/// reported here; those are pushed into the worker's return stream as
/// `ERROR`/`FAILED_REPLY`/`DEAD_REPLY` records and the call succeeds. Only
/// a stream the codec cannot parse at all, a protocol violation at the
/// endpoint surface, or an internal fault fails the call.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The command stream ended inside a record.
    #[error(transparent)]
    Truncated(#[from] Truncated),
    /// An unknown or reserved command code.
    #[error("invalid command {0:#x}")]
    InvalidCommand(u32),
    /// A non-blocking read found no work.
    #[error("no work available")]
    WouldBlock,
    /// The endpoint has been released.
    #[error("process is dead")]
    DeadProcess,
    /// The arena is already bound, or a second map was attempted.
    #[error("arena already mapped")]
    AlreadyMapped,
    /// An operation that needs the arena ran before `map`.
    #[error("arena not mapped")]
    NotMapped,
    /// A second process tried to claim the context-manager slot.
    #[error("context manager already set")]
    ContextManagerBusy,
    /// The caller's euid may not claim the context-manager slot.
    #[error("context manager uid mismatch")]
    PermissionDenied,
    /// Anything that indicates a broker bug rather than a client fault.
    #[error("fatal: {0:?}")]
    Fatal(#[from] anyhow::Error),
}

/// Report a client fault: log it and arm the stop-on-user-error latch if a
/// debugger requested that. Call with the broker [`crate::broker::State`]
/// borrowed mutably.
macro_rules! user_error {
    ($state:expr, $($fmt:tt)*) => {{
        log::warn!($($fmt)*);
        if $state.stop_on_user_error != 0 {
            $state.stop_on_user_error = 2;
        }
    }};
}

pub(crate) use user_error;
