// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! The two u32 code tables of the protocol: commands written by a client
//! worker, and return codes emitted by the broker into a worker's read
//! buffer.

use num_derive::FromPrimitive;

use crate::sys;

/// Commands a worker writes into its command buffer.
#[repr(u32)]
#[derive(PartialEq, Eq, Debug, Clone, Copy, FromPrimitive)]
pub enum Command {
    /// Start a call. Payload: [`sys::TransactionData`].
    Transaction = 0,
    /// Finish serving a call. Payload: [`sys::TransactionData`].
    Reply = 1,
    /// Reserved; always rejected.
    AcquireResult = 2,
    /// Release a delivered buffer. Payload: user pointer (u64).
    FreeBuffer = 3,
    /// Take a weak reference on a descriptor. Payload: u32.
    IncRefs = 4,
    /// Take a strong reference on a descriptor. Payload: u32.
    Acquire = 5,
    /// Drop a strong reference on a descriptor. Payload: u32.
    Release = 6,
    /// Drop a weak reference on a descriptor. Payload: u32.
    DecRefs = 7,
    /// Acknowledge an `IncRefs` return. Payload: [`sys::PtrCookie`].
    IncRefsDone = 8,
    /// Acknowledge an `Acquire` return. Payload: [`sys::PtrCookie`].
    AcquireDone = 9,
    /// Reserved; always rejected.
    AttemptAcquire = 10,
    /// Bind a worker spawned in response to `SpawnLooper`. No payload.
    RegisterLooper = 11,
    /// Bind a self-started worker. No payload.
    EnterLooper = 12,
    /// Unbind the current worker. No payload.
    ExitLooper = 13,
    /// Subscribe to the death of a descriptor's node.
    /// Payload: [`sys::HandleCookie`].
    RequestDeathNotification = 14,
    /// Drop a death subscription. Payload: [`sys::HandleCookie`].
    ClearDeathNotification = 15,
    /// Acknowledge a delivered `DeadNode`. Payload: cookie (u64).
    DeadNodeDone = 16,
}

impl Command {
    /// Size in bytes of the payload that follows this command code on the
    /// wire.
    pub fn payload_size(self) -> usize {
        match self {
            Command::Transaction | Command::Reply => sys::TransactionData::WIRE_SIZE,
            Command::FreeBuffer => 8,
            Command::IncRefs | Command::Acquire | Command::Release | Command::DecRefs => 4,
            Command::IncRefsDone | Command::AcquireDone => sys::PtrCookie::WIRE_SIZE,
            Command::AcquireResult => 4,
            Command::AttemptAcquire => sys::HandleCookie::WIRE_SIZE,
            Command::RegisterLooper | Command::EnterLooper | Command::ExitLooper => 0,
            Command::RequestDeathNotification | Command::ClearDeathNotification => {
                sys::HandleCookie::WIRE_SIZE
            }
            Command::DeadNodeDone => 8,
        }
    }
}

/// Return codes the broker emits into a worker's read buffer.
#[repr(u32)]
#[derive(PartialEq, Eq, Debug, Clone, Copy, FromPrimitive)]
pub enum ReturnCode {
    /// Carries an i32 error value.
    Error = 0,
    Ok = 1,
    /// Carries a [`sys::TransactionData`]: an inbound call to serve.
    Transaction = 2,
    /// Carries a [`sys::TransactionData`]: the reply to a call this worker
    /// made.
    Reply = 3,
    /// Reserved.
    AcquireResult = 4,
    /// The peer died before the call could be delivered or answered.
    DeadReply = 5,
    /// The broker accepted a `Transaction` or `Reply` command.
    TransactionComplete = 6,
    /// Owner-side refcount requests; each carries a [`sys::PtrCookie`].
    IncRefs = 7,
    Acquire = 8,
    Release = 9,
    DecRefs = 10,
    /// Reserved.
    AttemptAcquire = 11,
    /// Filler; every read begins with one.
    Noop = 12,
    /// The broker wants the process to start another worker.
    SpawnLooper = 13,
    /// Reserved.
    Finished = 14,
    /// A subscribed node's owner died. Carries the subscription cookie.
    DeadNode = 15,
    /// A death subscription is fully torn down. Carries the cookie.
    ClearDeathNotificationDone = 16,
    /// The call could not be built or delivered.
    FailedReply = 17,
}

#[cfg(test)]
mod tests {
    use num_traits::FromPrimitive;

    use super::*;

    #[test]
    fn codes_round_trip_through_u32() {
        for c in [
            Command::Transaction,
            Command::FreeBuffer,
            Command::DeadNodeDone,
        ] {
            assert_eq!(Command::from_u32(c as u32), Some(c));
        }
        assert_eq!(Command::from_u32(17), None);
        assert_eq!(ReturnCode::from_u32(17), Some(ReturnCode::FailedReply));
        assert_eq!(ReturnCode::from_u32(18), None);
    }

    #[test]
    fn looper_commands_have_no_payload() {
        assert_eq!(Command::EnterLooper.payload_size(), 0);
        assert_eq!(Command::RegisterLooper.payload_size(), 0);
        assert_eq!(Command::ExitLooper.payload_size(), 0);
        assert_eq!(Command::Transaction.payload_size(), 64);
    }
}
