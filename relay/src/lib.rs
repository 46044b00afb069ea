// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! A single-host IPC broker.
//!
//! Client processes open an [`Endpoint`], map a transfer-buffer arena, and
//! drive everything else through [`Endpoint::write_read`]: a command stream
//! in, a return stream out. The broker routes calls and replies between
//! processes, translates object references as they cross process
//! boundaries, delivers payloads zero-copy into the receiver's arena,
//! manages each process's worker pool, and fans out death notifications
//! when a service-hosting process disappears.
//!
//! ## Logging
//!
//! This package emits logs using the log façade. Configure the logging
//! backend of your choice during the initialization of the consuming
//! application.

pub use broker::{Broker, Endpoint, WriteRead};
pub use externs::Externs;

pub mod arena;
pub mod broker;
pub mod codec;
pub mod death;
pub mod error;
pub mod externs;
pub mod node;
pub mod process;
pub mod stats;
pub mod thread;
pub mod transaction;

pub use error::{Error, Result};
pub use relay_shared::PROTOCOL_VERSION;

/// Broker-assigned process identifier (not the client pid).
pub type ProcessId = u64;
/// Node identifier; doubles as the node's debug id.
pub type NodeId = u64;
/// Transaction identifier; doubles as the transaction's debug id.
pub type TransactionId = u64;
/// Death-subscription identifier.
pub type DeathId = u64;
/// Worker identifier: the client thread id that bound the worker.
pub type WorkerId = u32;
/// Process-local descriptor naming a reference.
pub type Handle = u32;
