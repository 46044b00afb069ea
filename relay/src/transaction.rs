// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! The transaction engine: building, routing, and unwinding calls.
//!
//! A synchronous call pushes a frame onto the sender's transaction stack
//! and parks the sender until the reply pops it again. Frames are chained
//! through `from_parent` (the sender's next outer frame) and `to_parent`
//! (what the serving worker was doing before this call preempted it), which
//! is what makes nested call stealing and failure unwinding walks possible.
//! One-way calls carry no frames; they serialize per target node instead.

use num_traits::FromPrimitive;
use relay_shared::sys::{FlatObject, ObjectKind, TransactionData, TransactionFlags};
use relay_shared::ReturnCode;

use crate::broker::State;
use crate::error::user_error;
use crate::externs::Externs;
use crate::stats::{CallKind, LogEntry, ObjClass};
use crate::{Handle, NodeId, ProcessId, TransactionId, WorkerId};

/// A queue a work item can be pushed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueRef {
    Proc(ProcessId),
    Worker(ProcessId, WorkerId),
}

/// One entry on a todo queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkItem {
    Transaction(TransactionId),
    TransactionComplete,
    Node(NodeId),
    Death(crate::DeathId),
}

/// An in-flight call or reply.
#[derive(Debug)]
pub(crate) struct Transaction {
    pub(crate) debug_id: u64,
    /// Source worker; `None` for one-way calls and replies.
    pub(crate) from: Option<(ProcessId, WorkerId)>,
    /// The sender's next outer frame at send time.
    pub(crate) from_parent: Option<TransactionId>,
    pub(crate) to_proc: Option<ProcessId>,
    pub(crate) to_thread: Option<WorkerId>,
    /// What the serving worker was serving before this call.
    pub(crate) to_parent: Option<TransactionId>,
    pub(crate) target_node: Option<NodeId>,
    pub(crate) code: u32,
    pub(crate) flags: u32,
    pub(crate) priority: i32,
    pub(crate) saved_priority: i32,
    pub(crate) sender_euid: u32,
    pub(crate) sender_pid: i32,
    /// Start address of the owned buffer in the target's arena.
    pub(crate) buffer: Option<u64>,
    pub(crate) need_reply: bool,
}

impl Transaction {
    pub(crate) fn is_one_way(&self) -> bool {
        self.flags & TransactionFlags::ONE_WAY.bits() != 0
    }
}

impl State {
    /// Append `item` and optionally wake the queue's waiter. A worker
    /// queue falls back to the process queue if the worker is gone.
    pub(crate) fn push_work(&mut self, q: QueueRef, item: WorkItem, wake: bool) {
        let proc = match q {
            QueueRef::Proc(p) => p,
            QueueRef::Worker(p, w) => {
                if let Some(worker) =
                    self.procs.get_mut(&p).and_then(|proc| proc.workers.get_mut(&w))
                {
                    worker.todo.push_back(item);
                    if wake {
                        worker.wait.notify_one();
                    }
                    return;
                }
                p
            }
        };
        if let Some(p) = self.procs.get_mut(&proc) {
            p.todo.push_back(item);
            if wake {
                p.wait.notify_one();
            }
        }
    }

    /// Remove a finished (or abandoned) transaction. When `target` is
    /// given, the frame is popped off that worker's stack first.
    pub(crate) fn pop_transaction(
        &mut self,
        target: Option<(ProcessId, WorkerId)>,
        id: TransactionId,
    ) {
        if let Some((p, w)) = target {
            let from_parent = self.transactions.get(&id).and_then(|t| t.from_parent);
            if let Some(worker) = self.procs.get_mut(&p).and_then(|proc| proc.workers.get_mut(&w))
            {
                if worker.transaction_stack != Some(id) {
                    log::error!("popping transaction {} that is not on top", id);
                }
                worker.transaction_stack = from_parent;
            }
            if let Some(t) = self.transactions.get_mut(&id) {
                t.from = None;
            }
        }
        if let Some(t) = self.transactions.get_mut(&id) {
            log::trace!("pop transaction {} (need_reply {})", t.debug_id, t.need_reply);
            t.need_reply = false;
            let buffer = t.buffer;
            let to_proc = t.to_proc;
            if let (Some(start), Some(tp)) = (buffer, to_proc) {
                if let Some(b) = self.arena_mut(tp).and_then(|a| a.get_mut(start)) {
                    b.transaction = None;
                }
            }
        }
        if self.transactions.remove(&id).is_some() {
            self.stats.destroyed(ObjClass::Transaction);
        }
    }

    /// Walk a failed call back to the nearest live caller and hand it
    /// `error_code` through its return-error slots. Frames whose caller
    /// has already exited are discarded along the way.
    pub(crate) fn send_failed_reply(&mut self, mut id: TransactionId, error_code: ReturnCode) {
        loop {
            let Some(t) = self.transactions.get(&id) else {
                return;
            };
            if t.is_one_way() {
                log::error!("failed reply for one-way transaction {}", id);
                return;
            }
            match t.from {
                Some((p, w)) => {
                    let pending = {
                        let Some(worker) =
                            self.procs.get_mut(&p).and_then(|proc| proc.workers.get_mut(&w))
                        else {
                            return;
                        };
                        if worker.return_error != ReturnCode::Ok
                            && worker.return_error2 == ReturnCode::Ok
                        {
                            worker.return_error2 = worker.return_error;
                            worker.return_error = ReturnCode::Ok;
                        }
                        worker.return_error
                    };
                    if pending == ReturnCode::Ok {
                        log::debug!("send failed reply for transaction {} to {}:{}", id, p, w);
                        self.pop_transaction(Some((p, w)), id);
                        if let Some(worker) =
                            self.procs.get_mut(&p).and_then(|proc| proc.workers.get_mut(&w))
                        {
                            worker.return_error = error_code;
                            worker.wait.notify_one();
                        }
                    } else {
                        log::error!(
                            "reply failed, target {}:{} has error code {:?} already",
                            p,
                            w,
                            pending
                        );
                    }
                    return;
                }
                None => {
                    let next = t.from_parent;
                    log::debug!("send failed reply for transaction {}, target dead", id);
                    self.pop_transaction(None, id);
                    match next {
                        None => return,
                        Some(n) => id = n,
                    }
                }
            }
        }
    }

    /// Release everything a delivered (or half-built) buffer holds: the
    /// target-node pin and every object embedded at its offsets. With
    /// `failed_count`, only the first `failed_count` offsets were
    /// translated and newly installed descriptors are closed again.
    pub(crate) fn transaction_buffer_release<E: Externs>(
        &mut self,
        externs: &E,
        proc: ProcessId,
        start: u64,
        failed_count: Option<usize>,
    ) {
        let Some((debug_id, data, offs, data_size, offsets_size, target_node, pid)) =
            self.procs.get(&proc).and_then(|p| {
                let b = p.arena.as_ref()?.get(start)?;
                Some((
                    b.debug_id,
                    b.data(),
                    b.offsets(),
                    b.data_size,
                    b.offsets_size,
                    b.target_node,
                    p.pid,
                ))
            })
        else {
            return;
        };
        log::debug!(
            "{} buffer release {}, size {}-{}, failed at {:?}",
            pid,
            debug_id,
            data_size,
            offsets_size,
            failed_count
        );
        if let Some(tn) = target_node {
            self.node_dec(tn, true, false);
        }
        let count = failed_count.unwrap_or((offsets_size / 8) as usize);
        for k in 0..count {
            let mut raw = [0u8; 8];
            if self
                .arena(proc)
                .map_or(true, |a| a.read(offs + k as u64 * 8, &mut raw).is_err())
            {
                break;
            }
            let off = u64::from_ne_bytes(raw);
            if data_size < FlatObject::WIRE_SIZE as u64
                || off > data_size - FlatObject::WIRE_SIZE as u64
                || off % 8 != 0
            {
                log::error!("transaction release {} bad offset {}", debug_id, off);
                continue;
            }
            let mut obj = [0u8; FlatObject::WIRE_SIZE];
            if self
                .arena(proc)
                .map_or(true, |a| a.read(data + off, &mut obj).is_err())
            {
                break;
            }
            let fp = FlatObject::decode(&obj);
            match ObjectKind::from_u32(fp.kind) {
                Some(kind @ (ObjectKind::Node | ObjectKind::WeakNode)) => {
                    match self.get_node(proc, fp.payload) {
                        Some(n) => self.node_dec(n, kind.is_strong(), false),
                        None => {
                            log::error!("transaction release {} bad node {:#x}", debug_id, fp.payload)
                        }
                    }
                }
                Some(kind @ (ObjectKind::Handle | ObjectKind::WeakHandle)) => {
                    let desc = fp.payload as Handle;
                    if self.ref_node(proc, desc).is_none() {
                        log::error!("transaction release {} bad handle {}", debug_id, desc);
                    } else {
                        let _ = self.ref_dec(proc, desc, kind.is_strong());
                    }
                }
                Some(ObjectKind::Fd) => {
                    if failed_count.is_some() {
                        externs.close_fd(pid, fp.payload as u32);
                    }
                }
                None => {
                    log::error!("transaction release {} bad object type {:#x}", debug_id, fp.kind)
                }
            }
        }
    }

    /// `FREE_BUFFER`: the receiver is done with a delivered payload.
    /// Releases the embedded objects, promotes the next queued one-way
    /// call on the buffer's node if any, and returns the space.
    pub(crate) fn free_buffer<E: Externs>(
        &mut self,
        externs: &E,
        proc: ProcessId,
        tid: WorkerId,
        user_ptr: u64,
    ) {
        let Some(start) = self.arena(proc).and_then(|a| a.from_user(user_ptr)) else {
            user_error!(self, "free-buffer u{:#x} no match", user_ptr);
            return;
        };
        let (allow, txn, is_async, target_node, debug_id) = {
            let b = self.arena(proc).unwrap().get(start).unwrap();
            (
                b.allow_user_free,
                b.transaction,
                b.is_async,
                b.target_node,
                b.debug_id,
            )
        };
        if !allow {
            user_error!(self, "free-buffer u{:#x} matched unreturned buffer", user_ptr);
            return;
        }
        log::debug!(
            "free buffer u{:#x}, buffer {} for {} transaction",
            user_ptr,
            debug_id,
            if txn.is_some() { "active" } else { "finished" }
        );
        if let Some(t) = txn {
            if let Some(tx) = self.transactions.get_mut(&t) {
                tx.buffer = None;
            }
            if let Some(b) = self.arena_mut(proc).and_then(|a| a.get_mut(start)) {
                b.transaction = None;
            }
        }
        if is_async {
            if let Some(node) = target_node.and_then(|n| self.nodes.get_mut(&n)) {
                if !node.async_in_flight {
                    log::error!("async buffer freed but node {} has none in flight", node.id);
                }
                match node.async_todo.pop_front() {
                    None => node.async_in_flight = false,
                    Some(item) => self.push_work(QueueRef::Worker(proc, tid), item, false),
                }
            }
        }
        self.transaction_buffer_release(externs, proc, start, None);
        if let Some(a) = self.arena_mut(proc) {
            a.free(start);
        }
    }

    /// `TRANSACTION` / `REPLY`: resolve the target, claim a buffer in its
    /// arena, copy and translate the payload, and queue the result.
    /// Failures unwind whatever was translated and surface on the sender's
    /// (or, for replies, the original caller's) return stream.
    pub(crate) fn transaction<E: Externs>(
        &mut self,
        externs: &E,
        proc: ProcessId,
        tid: WorkerId,
        tr: &TransactionData,
        reply: bool,
    ) {
        let one_way = tr.flags().contains(TransactionFlags::ONE_WAY);
        let (sender_pid, sender_euid) = match self.procs.get(&proc) {
            Some(p) => (p.pid, p.euid),
            None => return,
        };
        let mut entry = LogEntry {
            debug_id: 0,
            kind: if reply {
                CallKind::Reply
            } else if one_way {
                CallKind::OneWay
            } else {
                CallKind::Call
            },
            from_pid: sender_pid,
            from_tid: tid,
            to_pid: 0,
            to_node: 0,
            target_handle: tr.target,
            data_size: tr.data_size,
            offsets_size: tr.offsets_size,
        };

        // Target resolution.
        let mut in_reply_to: Option<TransactionId> = None;
        let mut target_thread: Option<WorkerId> = None;
        let mut target_node: Option<NodeId> = None;
        let mut irt_accepts_fds = false;
        let target_proc: ProcessId;
        if reply {
            let stack_top = self
                .procs
                .get(&proc)
                .and_then(|p| p.workers.get(&tid))
                .and_then(|w| w.transaction_stack);
            let Some(irt) = stack_top else {
                user_error!(self, "{}:{} got reply transaction with no transaction stack", sender_pid, tid);
                self.transaction_failed(proc, tid, entry, None, ReturnCode::FailedReply);
                return;
            };
            let (t_to_proc, t_to_thread, t_to_parent, t_from, t_flags, t_saved) = {
                let t = &self.transactions[&irt];
                (t.to_proc, t.to_thread, t.to_parent, t.from, t.flags, t.saved_priority)
            };
            if let Some(w) = self.procs.get_mut(&proc).and_then(|p| p.workers.get_mut(&tid)) {
                w.priority = t_saved;
            }
            if t_to_proc != Some(proc) || t_to_thread != Some(tid) {
                user_error!(
                    self,
                    "{}:{} got reply transaction with bad transaction stack, transaction {}",
                    sender_pid,
                    tid,
                    irt
                );
                self.transaction_failed(proc, tid, entry, None, ReturnCode::FailedReply);
                return;
            }
            if let Some(w) = self.procs.get_mut(&proc).and_then(|p| p.workers.get_mut(&tid)) {
                w.transaction_stack = t_to_parent;
            }
            in_reply_to = Some(irt);
            irt_accepts_fds = t_flags & TransactionFlags::ACCEPT_FDS.bits() != 0;
            let Some((tp, tw)) = t_from else {
                self.transaction_failed(proc, tid, entry, in_reply_to, ReturnCode::DeadReply);
                return;
            };
            let caller_stack = self
                .procs
                .get(&tp)
                .and_then(|p| p.workers.get(&tw))
                .and_then(|w| w.transaction_stack);
            if caller_stack != Some(irt) {
                user_error!(
                    self,
                    "{}:{} got reply transaction with bad target transaction stack {:?}, expected {}",
                    sender_pid,
                    tid,
                    caller_stack,
                    irt
                );
                self.transaction_failed(proc, tid, entry, None, ReturnCode::FailedReply);
                return;
            }
            target_proc = tp;
            target_thread = Some(tw);
        } else {
            let node_id = if tr.target != 0 {
                match self.ref_node(proc, tr.target as Handle) {
                    Some(n) => n,
                    None => {
                        user_error!(self, "{}:{} got transaction to invalid handle", sender_pid, tid);
                        self.transaction_failed(proc, tid, entry, None, ReturnCode::FailedReply);
                        return;
                    }
                }
            } else {
                match self.context_mgr {
                    Some(n) => n,
                    None => {
                        self.transaction_failed(proc, tid, entry, None, ReturnCode::DeadReply);
                        return;
                    }
                }
            };
            target_node = Some(node_id);
            entry.to_node = node_id;
            let Some(tp) = self.nodes.get(&node_id).and_then(|n| n.owner) else {
                self.transaction_failed(proc, tid, entry, None, ReturnCode::DeadReply);
                return;
            };
            target_proc = tp;
            if !one_way {
                let stack_top = self
                    .procs
                    .get(&proc)
                    .and_then(|p| p.workers.get(&tid))
                    .and_then(|w| w.transaction_stack);
                if let Some(top) = stack_top {
                    let (t_to_proc, t_to_thread) = {
                        let t = &self.transactions[&top];
                        (t.to_proc, t.to_thread)
                    };
                    if t_to_proc != Some(proc) || t_to_thread != Some(tid) {
                        user_error!(
                            self,
                            "{}:{} got new transaction with bad transaction stack, transaction {}",
                            sender_pid,
                            tid,
                            top
                        );
                        self.transaction_failed(proc, tid, entry, None, ReturnCode::FailedReply);
                        return;
                    }
                    // Call stealing: if a worker of the target process is
                    // already blocked on us somewhere down the stack,
                    // route the call to it.
                    let mut cursor = Some(top);
                    while let Some(c) = cursor {
                        let t = &self.transactions[&c];
                        if let Some((fp, fw)) = t.from {
                            if fp == target_proc {
                                target_thread = Some(fw);
                            }
                        }
                        cursor = t.from_parent;
                    }
                }
            }
        }
        entry.to_pid = self.procs.get(&target_proc).map(|p| p.pid).unwrap_or(0);

        let id = self.next_id();
        entry.debug_id = id;
        self.log.add(entry);
        if reply {
            log::debug!(
                "{}:{} REPLY {} -> {}:{:?}, size {}-{}",
                sender_pid,
                tid,
                id,
                target_proc,
                target_thread,
                tr.data_size,
                tr.offsets_size
            );
        } else {
            log::debug!(
                "{}:{} TRANSACTION {} -> {} - node {:?}, size {}-{}",
                sender_pid,
                tid,
                id,
                target_proc,
                target_node,
                tr.data_size,
                tr.offsets_size
            );
        }

        // Buffer allocation in the target's arena.
        let is_async = !reply && one_way;
        let priority = self
            .procs
            .get(&proc)
            .and_then(|p| p.workers.get(&tid))
            .map(|w| w.priority)
            .unwrap_or(0);
        let alloc = match self.arena_mut(target_proc) {
            None => Err(()),
            Some(a) => a.alloc(tr.data_size, tr.offsets_size, is_async, id).map_err(|e| {
                log::debug!("{}: transaction buffer alloc failed: {}", target_proc, e);
            }),
        };
        let Ok(start) = alloc else {
            self.transaction_failed(proc, tid, entry, in_reply_to, ReturnCode::FailedReply);
            return;
        };
        let buffer_node = if reply { None } else { target_node };
        let (data_addr, offs_addr) = {
            let b = self.arena_mut(target_proc).unwrap().get_mut(start).unwrap();
            b.target_node = buffer_node;
            (b.data(), b.offsets())
        };
        if let Some(tn) = buffer_node {
            let _ = self.node_inc(tn, true, false, None);
        }
        self.transactions.insert(
            id,
            Transaction {
                debug_id: id,
                from: (!reply && !one_way).then_some((proc, tid)),
                from_parent: None,
                to_proc: Some(target_proc),
                to_thread: target_thread,
                to_parent: None,
                target_node: buffer_node,
                code: tr.code,
                flags: tr.flags,
                priority,
                saved_priority: 0,
                sender_euid,
                sender_pid: sender_pid as i32,
                buffer: Some(start),
                need_reply: false,
            },
        );
        self.stats.created(ObjClass::Transaction);
        if let Some(b) = self.arena_mut(target_proc).unwrap().get_mut(start) {
            b.transaction = Some(id);
        }

        // Copy payload and offsets out of the sender's address space.
        let mut data_buf = vec![0u8; tr.data_size as usize];
        if externs.copy_user(sender_pid, tr.data_ptr, &mut data_buf).is_err() {
            user_error!(self, "{}:{} got transaction with invalid data ptr", sender_pid, tid);
            self.abort_transaction(externs, target_proc, start, id, Some(0));
            self.transaction_failed(proc, tid, entry, in_reply_to, ReturnCode::FailedReply);
            return;
        }
        let mut offs_buf = vec![0u8; tr.offsets_size as usize];
        if externs.copy_user(sender_pid, tr.offsets_ptr, &mut offs_buf).is_err() {
            user_error!(self, "{}:{} got transaction with invalid offsets ptr", sender_pid, tid);
            self.abort_transaction(externs, target_proc, start, id, Some(0));
            self.transaction_failed(proc, tid, entry, in_reply_to, ReturnCode::FailedReply);
            return;
        }
        {
            let a = self.arena_mut(target_proc).unwrap();
            // The pages were just backed; these writes cannot fail.
            let _ = a.write(data_addr, &data_buf);
            let _ = a.write(offs_addr, &offs_buf);
        }
        if tr.offsets_size % 8 != 0 {
            user_error!(
                self,
                "{}:{} got transaction with invalid offsets size, {}",
                sender_pid,
                tid,
                tr.offsets_size
            );
            self.abort_transaction(externs, target_proc, start, id, Some(0));
            self.transaction_failed(proc, tid, entry, in_reply_to, ReturnCode::FailedReply);
            return;
        }

        // Translate every embedded object into the target's terms.
        let n_offsets = (tr.offsets_size / 8) as usize;
        for k in 0..n_offsets {
            let off = u64::from_ne_bytes(offs_buf[k * 8..k * 8 + 8].try_into().unwrap());
            if tr.data_size < FlatObject::WIRE_SIZE as u64
                || off > tr.data_size - FlatObject::WIRE_SIZE as u64
                || off % 8 != 0
            {
                user_error!(self, "{}:{} got transaction with invalid offset, {}", sender_pid, tid, off);
                self.abort_transaction(externs, target_proc, start, id, Some(k));
                self.transaction_failed(proc, tid, entry, in_reply_to, ReturnCode::FailedReply);
                return;
            }
            let off = off as usize;
            let mut fp = FlatObject::decode(&data_buf[off..off + FlatObject::WIRE_SIZE]);
            let translated = match ObjectKind::from_u32(fp.kind) {
                Some(kind @ (ObjectKind::Node | ObjectKind::WeakNode)) => {
                    let strong = kind.is_strong();
                    let node = match self.get_node(proc, fp.payload) {
                        Some(n) => n,
                        None => match self.new_node(
                            proc,
                            fp.payload,
                            fp.cookie,
                            fp.min_priority(),
                            fp.accepts_fds(),
                        ) {
                            Some(n) => n,
                            None => {
                                self.abort_transaction(externs, target_proc, start, id, Some(k));
                                self.transaction_failed(
                                    proc,
                                    tid,
                                    entry,
                                    in_reply_to,
                                    ReturnCode::FailedReply,
                                );
                                return;
                            }
                        },
                    };
                    if self.nodes[&node].cookie != fp.cookie {
                        user_error!(
                            self,
                            "{}:{} sending u{:#x} node {}, cookie mismatch {:#x} != {:#x}",
                            sender_pid,
                            tid,
                            fp.payload,
                            node,
                            fp.cookie,
                            self.nodes[&node].cookie
                        );
                        self.abort_transaction(externs, target_proc, start, id, Some(k));
                        self.transaction_failed(proc, tid, entry, in_reply_to, ReturnCode::FailedReply);
                        return;
                    }
                    let Some(desc) = self.get_ref_for_node(target_proc, node) else {
                        self.abort_transaction(externs, target_proc, start, id, Some(k));
                        self.transaction_failed(proc, tid, entry, in_reply_to, ReturnCode::FailedReply);
                        return;
                    };
                    fp.kind = if strong {
                        ObjectKind::Handle as u32
                    } else {
                        ObjectKind::WeakHandle as u32
                    };
                    let node_ptr = fp.payload;
                    fp.payload = desc as u64;
                    let _ = self.ref_inc(
                        target_proc,
                        desc,
                        strong,
                        Some(QueueRef::Worker(proc, tid)),
                    );
                    log::trace!("        node {} u{:#x} -> desc {}", node, node_ptr, desc);
                    fp
                }
                Some(kind @ (ObjectKind::Handle | ObjectKind::WeakHandle)) => {
                    let strong = kind.is_strong();
                    let Some(node) = self.ref_node(proc, fp.payload as Handle) else {
                        user_error!(
                            self,
                            "{}:{} got transaction with invalid handle, {}",
                            sender_pid,
                            tid,
                            fp.payload
                        );
                        self.abort_transaction(externs, target_proc, start, id, Some(k));
                        self.transaction_failed(proc, tid, entry, in_reply_to, ReturnCode::FailedReply);
                        return;
                    };
                    if self.nodes[&node].owner == Some(target_proc) {
                        // Coming home: hand the owner its own pointer back.
                        fp.kind = if strong {
                            ObjectKind::Node as u32
                        } else {
                            ObjectKind::WeakNode as u32
                        };
                        let desc = fp.payload;
                        fp.payload = self.nodes[&node].ptr;
                        fp.cookie = self.nodes[&node].cookie;
                        let _ = self.node_inc(node, strong, false, None);
                        log::trace!("        desc {} -> node {}", desc, node);
                        fp
                    } else {
                        let Some(desc) = self.get_ref_for_node(target_proc, node) else {
                            self.abort_transaction(externs, target_proc, start, id, Some(k));
                            self.transaction_failed(
                                proc,
                                tid,
                                entry,
                                in_reply_to,
                                ReturnCode::FailedReply,
                            );
                            return;
                        };
                        fp.payload = desc as u64;
                        let _ = self.ref_inc(target_proc, desc, strong, None);
                        log::trace!("        desc -> desc {} (node {})", desc, node);
                        fp
                    }
                }
                Some(ObjectKind::Fd) => {
                    let allowed = if reply {
                        irt_accepts_fds
                    } else {
                        target_node
                            .and_then(|n| self.nodes.get(&n))
                            .map(|n| n.accepts_fds)
                            .unwrap_or(false)
                    };
                    if !allowed {
                        user_error!(
                            self,
                            "{}:{} got {} with fd, {}, but target does not allow fds",
                            sender_pid,
                            tid,
                            if reply { "reply" } else { "transaction" },
                            fp.payload
                        );
                        self.abort_transaction(externs, target_proc, start, id, Some(k));
                        self.transaction_failed(proc, tid, entry, in_reply_to, ReturnCode::FailedReply);
                        return;
                    }
                    let target_pid = self.procs.get(&target_proc).map(|p| p.pid).unwrap_or(0);
                    match externs.dup_fd(sender_pid, fp.payload as u32, target_pid) {
                        Ok(nfd) => {
                            log::trace!("        fd {} -> {}", fp.payload, nfd);
                            fp.payload = nfd as u64;
                            fp
                        }
                        Err(_) => {
                            user_error!(
                                self,
                                "{}:{} got transaction with invalid fd, {}",
                                sender_pid,
                                tid,
                                fp.payload
                            );
                            self.abort_transaction(externs, target_proc, start, id, Some(k));
                            self.transaction_failed(
                                proc,
                                tid,
                                entry,
                                in_reply_to,
                                ReturnCode::FailedReply,
                            );
                            return;
                        }
                    }
                }
                _ => {
                    user_error!(
                        self,
                        "{}:{} got transaction with invalid object type, {:#x}",
                        sender_pid,
                        tid,
                        fp.kind
                    );
                    self.abort_transaction(externs, target_proc, start, id, Some(k));
                    self.transaction_failed(proc, tid, entry, in_reply_to, ReturnCode::FailedReply);
                    return;
                }
            };
            translated.encode(&mut data_buf[off..off + FlatObject::WIRE_SIZE]);
            let _ = self
                .arena_mut(target_proc)
                .unwrap()
                .write(data_addr + off as u64, &data_buf[off..off + FlatObject::WIRE_SIZE]);
        }

        // Queue the work.
        let mut deferred_async = false;
        if reply {
            self.pop_transaction(Some((target_proc, target_thread.unwrap())), in_reply_to.unwrap());
        } else if !one_way {
            let stack_top = self
                .procs
                .get(&proc)
                .and_then(|p| p.workers.get(&tid))
                .and_then(|w| w.transaction_stack);
            if let Some(t) = self.transactions.get_mut(&id) {
                t.need_reply = true;
                t.from_parent = stack_top;
            }
            if let Some(w) = self.procs.get_mut(&proc).and_then(|p| p.workers.get_mut(&tid)) {
                w.transaction_stack = Some(id);
            }
        } else {
            let node = target_node.unwrap();
            if let Some(n) = self.nodes.get_mut(&node) {
                if n.async_in_flight {
                    n.async_todo.push_back(WorkItem::Transaction(id));
                    deferred_async = true;
                } else {
                    n.async_in_flight = true;
                }
            }
        }
        if !deferred_async {
            let q = match target_thread {
                Some(w) => QueueRef::Worker(target_proc, w),
                None => QueueRef::Proc(target_proc),
            };
            self.push_work(q, WorkItem::Transaction(id), true);
        }
        self.push_work(QueueRef::Worker(proc, tid), WorkItem::TransactionComplete, false);
        self.stats.created(ObjClass::TransactionComplete);
    }

    /// Throw away a transaction whose build failed: release the translated
    /// prefix, the buffer, and the registry entry.
    fn abort_transaction<E: Externs>(
        &mut self,
        externs: &E,
        target_proc: ProcessId,
        start: u64,
        id: TransactionId,
        failed_count: Option<usize>,
    ) {
        self.transaction_buffer_release(externs, target_proc, start, failed_count);
        if let Some(a) = self.arena_mut(target_proc) {
            if let Some(b) = a.get_mut(start) {
                b.transaction = None;
            }
            a.free(start);
        }
        if self.transactions.remove(&id).is_some() {
            self.stats.destroyed(ObjClass::Transaction);
        }
    }

    /// Record the failure on the right worker: the sender for calls, the
    /// original caller (via the frame chain) for replies.
    fn transaction_failed(
        &mut self,
        proc: ProcessId,
        tid: WorkerId,
        entry: LogEntry,
        in_reply_to: Option<TransactionId>,
        code: ReturnCode,
    ) {
        log::debug!(
            "{}:{} transaction failed {:?}, size {}-{}",
            proc,
            tid,
            code,
            entry.data_size,
            entry.offsets_size
        );
        self.log_failed.add(entry);
        if let Some(w) = self.procs.get_mut(&proc).and_then(|p| p.workers.get_mut(&tid)) {
            if w.return_error != ReturnCode::Ok {
                log::error!("{}:{} already has a pending return error", proc, tid);
            }
            w.return_error = if in_reply_to.is_some() {
                ReturnCode::TransactionComplete
            } else {
                code
            };
        }
        if let Some(irt) = in_reply_to {
            self.send_failed_reply(irt, code);
        }
    }
}
