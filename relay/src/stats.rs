// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Broker-wide object and protocol counters, plus a small ring of recent
//! transactions. Updated under the broker lock; read by embedders that want
//! visibility into traffic without a full tracing stack.

/// Object classes tracked by [`Stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ObjClass {
    Process = 0,
    Thread = 1,
    Node = 2,
    Reference = 3,
    Transaction = 4,
    TransactionComplete = 5,
    Death = 6,
}

const OBJ_CLASSES: usize = 7;
const COMMAND_CODES: usize = 17;
const RETURN_CODES: usize = 18;

/// Monotonic counters for everything the broker creates, destroys, parses,
/// and emits.
#[derive(Debug, Default)]
pub struct Stats {
    created: [u64; OBJ_CLASSES],
    destroyed: [u64; OBJ_CLASSES],
    commands: [u64; COMMAND_CODES],
    returns: [u64; RETURN_CODES],
}

impl Stats {
    pub(crate) fn created(&mut self, class: ObjClass) {
        self.created[class as usize] += 1;
    }

    pub(crate) fn destroyed(&mut self, class: ObjClass) {
        self.destroyed[class as usize] += 1;
    }

    pub(crate) fn command(&mut self, code: u32) {
        if let Some(c) = self.commands.get_mut(code as usize) {
            *c += 1;
        }
    }

    pub(crate) fn emitted(&mut self, code: u32) {
        if let Some(c) = self.returns.get_mut(code as usize) {
            *c += 1;
        }
    }

    /// (created, destroyed) for one object class.
    pub fn objects(&self, class: ObjClass) -> (u64, u64) {
        (self.created[class as usize], self.destroyed[class as usize])
    }

    /// How many commands with this code the broker has parsed.
    pub fn commands_seen(&self, code: u32) -> u64 {
        self.commands.get(code as usize).copied().unwrap_or(0)
    }

    /// How many return records with this code the broker has emitted.
    pub fn returns_emitted(&self, code: u32) -> u64 {
        self.returns.get(code as usize).copied().unwrap_or(0)
    }

    /// True when every created object of every class has been destroyed.
    pub fn all_reaped(&self) -> bool {
        self.created == self.destroyed
    }
}

/// What kind of call a log entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallKind {
    #[default]
    Call,
    OneWay,
    Reply,
}

/// One recorded transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEntry {
    pub debug_id: u64,
    pub kind: CallKind,
    pub from_pid: u32,
    pub from_tid: u32,
    pub to_pid: u32,
    pub to_node: u64,
    pub target_handle: u64,
    pub data_size: u64,
    pub offsets_size: u64,
}

const LOG_SIZE: usize = 32;

/// Fixed-size ring of recent transactions. A second instance records the
/// ones that failed to build.
#[derive(Debug)]
pub struct TransactionLog {
    entries: [LogEntry; LOG_SIZE],
    next: usize,
    full: bool,
}

impl Default for TransactionLog {
    fn default() -> Self {
        Self {
            entries: [LogEntry::default(); LOG_SIZE],
            next: 0,
            full: false,
        }
    }
}

impl TransactionLog {
    pub(crate) fn add(&mut self, entry: LogEntry) {
        self.entries[self.next] = entry;
        self.next = (self.next + 1) % LOG_SIZE;
        if self.next == 0 {
            self.full = true;
        }
    }

    /// Recorded entries, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        let (wrapped, recent) = self.entries.split_at(self.next);
        let old = if self.full { recent } else { &[] };
        old.iter().chain(wrapped.iter())
    }
}
