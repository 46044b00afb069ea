// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Workers: client threads bound to the broker.
//!
//! A worker comes into existence the first time its thread enters the
//! broker and advances through a small state machine driven by the looper
//! commands. Parked workers wait either on their own condition (when they
//! have a transaction stack or dedicated work) or on the process-wide
//! condition (when they are eligible for pool dispatch).

use std::collections::VecDeque;
use std::sync::{Arc, Condvar};

use relay_shared::ReturnCode;

use crate::broker::State;
use crate::stats::ObjClass;
use crate::transaction::WorkItem;
use crate::{ProcessId, TransactionId, WorkerId};

bitflags::bitflags! {
    /// Looper state bits of a worker.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LooperState: u32 {
        /// Bound via `REGISTER_LOOPER` (spawned on broker request).
        const REGISTERED = 0x01;
        /// Bound via `ENTER_LOOPER` (self-started).
        const ENTERED = 0x02;
        /// The worker announced it is leaving its loop.
        const EXITED = 0x04;
        /// The worker broke the binding protocol.
        const INVALID = 0x08;
        /// Currently blocked in a read.
        const WAITING = 0x10;
        /// Must return to user space from its next (or current) read.
        const NEED_RETURN = 0x20;
    }
}

/// One bound client thread.
#[derive(Debug)]
pub(crate) struct Worker {
    pub(crate) id: WorkerId,
    pub(crate) looper: LooperState,
    pub(crate) todo: VecDeque<WorkItem>,
    /// Top of the stack of synchronous transactions this worker is part
    /// of, as caller or callee; frames chain through the transactions'
    /// parent links.
    pub(crate) transaction_stack: Option<TransactionId>,
    pub(crate) return_error: ReturnCode,
    pub(crate) return_error2: ReturnCode,
    pub(crate) wait: Arc<Condvar>,
    /// Scheduling priority the worker currently runs at (nice value;
    /// larger is weaker).
    pub(crate) priority: i32,
}

impl State {
    /// Fetch the worker for `tid`, creating it on first contact. New
    /// workers start life in `NEED_RETURN`.
    pub(crate) fn get_or_create_worker(&mut self, proc: ProcessId, tid: WorkerId) {
        let p = match self.procs.get_mut(&proc) {
            Some(p) => p,
            None => return,
        };
        if p.workers.contains_key(&tid) {
            return;
        }
        let priority = p.default_priority;
        p.workers.insert(
            tid,
            Worker {
                id: tid,
                looper: LooperState::NEED_RETURN,
                todo: VecDeque::new(),
                transaction_stack: None,
                return_error: ReturnCode::Ok,
                return_error2: ReturnCode::Ok,
                wait: Arc::new(Condvar::new()),
                priority,
            },
        );
        self.stats.created(ObjClass::Thread);
    }

    /// Pool work is visible to a process-ready worker.
    pub(crate) fn has_proc_work(&self, proc: ProcessId, tid: WorkerId) -> bool {
        let Some(p) = self.procs.get(&proc) else {
            return true;
        };
        let Some(w) = p.workers.get(&tid) else {
            return true;
        };
        !p.todo.is_empty() || w.looper.contains(LooperState::NEED_RETURN)
    }

    pub(crate) fn has_thread_work(&self, proc: ProcessId, tid: WorkerId) -> bool {
        let Some(w) = self.procs.get(&proc).and_then(|p| p.workers.get(&tid)) else {
            return true;
        };
        !w.todo.is_empty()
            || w.return_error != ReturnCode::Ok
            || w.looper.contains(LooperState::NEED_RETURN)
    }

    /// Unbind a worker. Transactions it was serving lose their callee and
    /// the innermost one answers its caller with `DEAD_REPLY`;
    /// transactions it originated are detached from their source so the
    /// eventual reply is dropped rather than misdelivered.
    pub(crate) fn free_worker(&mut self, proc: ProcessId, tid: WorkerId) {
        let worker = match self.procs.get_mut(&proc).and_then(|p| p.workers.remove(&tid)) {
            Some(w) => w,
            None => return,
        };
        let mut cursor = worker.transaction_stack;
        let send_reply = cursor.filter(|&t| {
            self.transactions
                .get(&t)
                .map(|t| t.to_proc == Some(proc) && t.to_thread == Some(tid))
                .unwrap_or(false)
        });
        while let Some(id) = cursor {
            let Some(t) = self.transactions.get_mut(&id) else {
                log::error!("stale transaction {} on worker stack", id);
                break;
            };
            if t.to_proc == Some(proc) && t.to_thread == Some(tid) {
                t.to_proc = None;
                t.to_thread = None;
                let buffer = t.buffer.take();
                cursor = t.to_parent;
                if let Some(start) = buffer {
                    if let Some(b) = self
                        .procs
                        .get_mut(&proc)
                        .and_then(|p| p.arena.as_mut())
                        .and_then(|a| a.get_mut(start))
                    {
                        b.transaction = None;
                    }
                }
            } else if t.from == Some((proc, tid)) {
                t.from = None;
                cursor = t.from_parent;
            } else {
                log::error!("transaction {} unlinked from worker stack", id);
                break;
            }
        }
        if let Some(t) = send_reply {
            self.send_failed_reply(t, ReturnCode::DeadReply);
        }
        log::debug!("worker {}:{} freed", proc, worker.id);
        self.release_work(worker.todo);
        self.stats.destroyed(ObjClass::Thread);
    }

    /// Dispose of a queue that will never be drained by a read again.
    /// Pending calls turn into dead replies for their callers; everything
    /// else is unlinked.
    pub(crate) fn release_work(&mut self, list: VecDeque<WorkItem>) {
        for item in list {
            match item {
                WorkItem::Transaction(t) => {
                    let reply_target = self.transactions.get(&t).map(|t| {
                        (t.target_node.is_some() && !t.is_one_way(), t.buffer, t.to_proc)
                    });
                    match reply_target {
                        Some((true, _, _)) => {
                            self.send_failed_reply(t, ReturnCode::DeadReply);
                        }
                        Some((false, buffer, to_proc)) => {
                            // One-way or reply: nobody is waiting; drop it.
                            if let (Some(start), Some(tp)) = (buffer, to_proc) {
                                if let Some(b) = self
                                    .procs
                                    .get_mut(&tp)
                                    .and_then(|p| p.arena.as_mut())
                                    .and_then(|a| a.get_mut(start))
                                {
                                    b.transaction = None;
                                }
                            }
                            self.transactions.remove(&t);
                            self.stats.destroyed(ObjClass::Transaction);
                        }
                        None => {}
                    }
                }
                WorkItem::TransactionComplete => {
                    self.stats.destroyed(ObjClass::TransactionComplete);
                }
                WorkItem::Node(n) => {
                    if let Some(node) = self.nodes.get_mut(&n) {
                        node.work_queued = false;
                    }
                }
                WorkItem::Death(d) => {
                    if let Some(death) = self.deaths.get_mut(&d) {
                        death.queued = false;
                    }
                }
            }
        }
    }
}
