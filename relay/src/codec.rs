// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! The `write_read` codec: parse the command stream, serve the return
//! stream.
//!
//! Writes are processed first and stop early if the worker picks up a
//! pending return error, so `write_consumed` always points at the first
//! unprocessed record. Reads begin with a `NOOP` filler, drain the
//! worker's queue (and the process queue when the worker is pool-ready),
//! and park the worker when there is nothing to deliver.

use std::sync::MutexGuard;

use num_traits::FromPrimitive;
use relay_shared::sys::{
    HandleCookie, PtrCookie, StreamReader, StreamWriter, TransactionData,
};
use relay_shared::{ptr_align, Command, ReturnCode};

use crate::broker::{Shared, State};
use crate::error::{user_error, Error, Result};
use crate::externs::Externs;
use crate::stats::ObjClass;
use crate::thread::LooperState;
use crate::transaction::WorkItem;
use crate::{ProcessId, WorkerId};

impl State {
    /// Parse and execute one command buffer. Stream-level faults abort
    /// with an error and leave `consumed` at the last record boundary;
    /// everything else lands in the worker's return stream.
    pub(crate) fn thread_write<E: Externs>(
        &mut self,
        externs: &E,
        proc: ProcessId,
        tid: WorkerId,
        write: &[u8],
        consumed: &mut usize,
    ) -> Result<()> {
        let mut r = StreamReader::new(write, *consumed);
        loop {
            if r.is_empty() {
                break;
            }
            let pending = self
                .procs
                .get(&proc)
                .and_then(|p| p.workers.get(&tid))
                .map(|w| w.return_error)
                .unwrap_or(ReturnCode::Ok);
            if pending != ReturnCode::Ok {
                break;
            }
            let code_raw = r.get_u32()?;
            let Some(cmd) = Command::from_u32(code_raw) else {
                log::error!("{}:{} unknown command {}", proc, tid, code_raw);
                return Err(Error::InvalidCommand(code_raw));
            };
            self.stats.command(code_raw);
            match cmd {
                Command::IncRefs | Command::Acquire | Command::Release | Command::DecRefs => {
                    let target = r.get_u32()?;
                    let strong = matches!(cmd, Command::Acquire | Command::Release);
                    let inc = matches!(cmd, Command::IncRefs | Command::Acquire);
                    // A refcount command on descriptor 0 reaches the
                    // context manager even without a prior reference.
                    let desc = if target == 0 && self.context_mgr.is_some() && inc {
                        let d = self.get_ref_for_node(proc, self.context_mgr.unwrap());
                        if let Some(d) = d {
                            if d != target {
                                user_error!(
                                    self,
                                    "{}:{} tried to acquire reference to desc 0, got {} instead",
                                    proc,
                                    tid,
                                    d
                                );
                            }
                        }
                        d
                    } else {
                        self.ref_node(proc, target).map(|_| target)
                    };
                    let Some(desc) = desc else {
                        user_error!(self, "{}:{} refcount change on invalid ref {}", proc, tid, target);
                        *consumed = r.pos();
                        continue;
                    };
                    if inc {
                        let _ = self.ref_inc(proc, desc, strong, None);
                    } else {
                        let _ = self.ref_dec(proc, desc, strong);
                    }
                }
                Command::IncRefsDone | Command::AcquireDone => {
                    let pc = PtrCookie::decode(r.get_bytes(PtrCookie::WIRE_SIZE)?);
                    let strong = cmd == Command::AcquireDone;
                    self.refcount_done(proc, tid, pc, strong);
                }
                Command::AttemptAcquire | Command::AcquireResult => {
                    log::error!("{:?} not supported", cmd);
                    return Err(Error::InvalidCommand(code_raw));
                }
                Command::FreeBuffer => {
                    let user_ptr = r.get_u64()?;
                    self.free_buffer(externs, proc, tid, user_ptr);
                }
                Command::Transaction | Command::Reply => {
                    let td = TransactionData::decode(r.get_bytes(TransactionData::WIRE_SIZE)?);
                    self.transaction(externs, proc, tid, &td, cmd == Command::Reply);
                }
                Command::RegisterLooper => {
                    log::debug!("{}:{} REGISTER_LOOPER", proc, tid);
                    let (entered, requested) = match self.procs.get(&proc) {
                        Some(p) => (
                            p.workers
                                .get(&tid)
                                .map(|w| w.looper.contains(LooperState::ENTERED))
                                .unwrap_or(false),
                            p.requested_threads,
                        ),
                        None => break,
                    };
                    if entered {
                        self.set_looper(proc, tid, LooperState::INVALID);
                        user_error!(
                            self,
                            "{}:{} REGISTER_LOOPER called after ENTER_LOOPER",
                            proc,
                            tid
                        );
                    } else if requested == 0 {
                        self.set_looper(proc, tid, LooperState::INVALID);
                        user_error!(self, "{}:{} REGISTER_LOOPER called without request", proc, tid);
                    } else if let Some(p) = self.procs.get_mut(&proc) {
                        p.requested_threads -= 1;
                        p.requested_threads_started += 1;
                    }
                    self.set_looper(proc, tid, LooperState::REGISTERED);
                }
                Command::EnterLooper => {
                    log::debug!("{}:{} ENTER_LOOPER", proc, tid);
                    let registered = self
                        .procs
                        .get(&proc)
                        .and_then(|p| p.workers.get(&tid))
                        .map(|w| w.looper.contains(LooperState::REGISTERED))
                        .unwrap_or(false);
                    if registered {
                        self.set_looper(proc, tid, LooperState::INVALID);
                        user_error!(
                            self,
                            "{}:{} ENTER_LOOPER called after REGISTER_LOOPER",
                            proc,
                            tid
                        );
                    }
                    self.set_looper(proc, tid, LooperState::ENTERED);
                }
                Command::ExitLooper => {
                    log::debug!("{}:{} EXIT_LOOPER", proc, tid);
                    self.set_looper(proc, tid, LooperState::EXITED);
                }
                Command::RequestDeathNotification => {
                    let hc = HandleCookie::decode(r.get_bytes(HandleCookie::WIRE_SIZE)?);
                    self.request_death(proc, tid, hc.handle, hc.cookie);
                }
                Command::ClearDeathNotification => {
                    let hc = HandleCookie::decode(r.get_bytes(HandleCookie::WIRE_SIZE)?);
                    self.clear_death(proc, tid, hc.handle, hc.cookie);
                }
                Command::DeadNodeDone => {
                    let cookie = r.get_u64()?;
                    self.dead_node_done(proc, tid, cookie);
                }
            }
            *consumed = r.pos();
        }
        Ok(())
    }

    fn set_looper(&mut self, proc: ProcessId, tid: WorkerId, flag: LooperState) {
        if let Some(w) = self.procs.get_mut(&proc).and_then(|p| p.workers.get_mut(&tid)) {
            w.looper |= flag;
        }
    }

    /// `INCREFS_DONE` / `ACQUIRE_DONE`: the owner acknowledged taking a
    /// userspace refcount; drop the local pin that kept the node alive
    /// while the request was in flight.
    fn refcount_done(&mut self, proc: ProcessId, tid: WorkerId, pc: PtrCookie, strong: bool) {
        let name = if strong { "ACQUIRE_DONE" } else { "INCREFS_DONE" };
        let Some(node) = self.get_node(proc, pc.ptr) else {
            user_error!(self, "{}:{} {} u{:#x} no match", proc, tid, name, pc.ptr);
            return;
        };
        let cookie = self.nodes[&node].cookie;
        if cookie != pc.cookie {
            user_error!(
                self,
                "{}:{} {} u{:#x} node {} cookie mismatch {:#x} != {:#x}",
                proc,
                tid,
                name,
                pc.ptr,
                node,
                cookie,
                pc.cookie
            );
            return;
        }
        let pending = {
            let n = self.nodes.get_mut(&node).unwrap();
            if strong {
                let was = n.pending_strong;
                n.pending_strong = false;
                was
            } else {
                let was = n.pending_weak;
                n.pending_weak = false;
                was
            }
        };
        if !pending {
            user_error!(
                self,
                "{}:{} {} node {} has no pending request",
                proc,
                tid,
                name,
                node
            );
            return;
        }
        self.node_dec(node, strong, false);
    }
}

/// Serve one read. Blocks (releasing the broker lock) when the selected
/// queue is empty unless `non_block` is set.
pub(crate) fn thread_read<'a, E: Externs>(
    shared: &'a Shared<E>,
    mut guard: MutexGuard<'a, State>,
    proc: ProcessId,
    tid: WorkerId,
    read: &mut [u8],
    consumed: &mut usize,
    non_block: bool,
) -> (MutexGuard<'a, State>, Result<()>) {
    let mut w = StreamWriter::new(read, *consumed);
    if w.pos() == 0 {
        if !w.put_u32(ReturnCode::Noop as u32) {
            *consumed = w.pos();
            return (guard, Ok(()));
        }
        guard.stats.emitted(ReturnCode::Noop as u32);
    }

    'retry: loop {
        let Some(worker) = guard.procs.get(&proc).and_then(|p| p.workers.get(&tid)) else {
            break 'retry;
        };
        let wait_for_proc_work = worker.transaction_stack.is_none() && worker.todo.is_empty();
        let (re, re2) = (worker.return_error, worker.return_error2);

        // Pending errors preempt everything else.
        if re != ReturnCode::Ok {
            if re2 != ReturnCode::Ok {
                if !w.put_u32(re2 as u32) {
                    break 'retry;
                }
                guard.stats.emitted(re2 as u32);
                if w.remaining() == 0 {
                    break 'retry;
                }
                set_return_error2(&mut guard, proc, tid, ReturnCode::Ok);
            }
            if w.put_u32(re as u32) {
                guard.stats.emitted(re as u32);
                set_return_error(&mut guard, proc, tid, ReturnCode::Ok);
            }
            break 'retry;
        }

        // Park.
        {
            let p = guard.procs.get_mut(&proc).unwrap();
            if wait_for_proc_work {
                p.ready_threads += 1;
            }
            if let Some(wk) = p.workers.get_mut(&tid) {
                wk.looper |= LooperState::WAITING;
            }
        }
        let mut wait_err = None;
        if wait_for_proc_work {
            let bound = guard
                .procs
                .get(&proc)
                .and_then(|p| p.workers.get(&tid))
                .map(|wk| {
                    wk.looper
                        .intersects(LooperState::REGISTERED | LooperState::ENTERED)
                })
                .unwrap_or(false);
            if !bound {
                user_error!(
                    guard,
                    "{}:{} ERROR: thread waiting for process work before calling \
                     REGISTER_LOOPER or ENTER_LOOPER",
                    proc,
                    tid
                );
                guard = shared.wait_stop_latch(guard);
            }
            if let Some(p) = guard.procs.get_mut(&proc) {
                let default_priority = p.default_priority;
                if let Some(wk) = p.workers.get_mut(&tid) {
                    wk.priority = default_priority;
                }
            }
            if non_block {
                if !guard.has_proc_work(proc, tid) {
                    wait_err = Some(Error::WouldBlock);
                }
            } else {
                let cv = guard.procs.get(&proc).unwrap().wait.clone();
                guard = cv
                    .wait_while(guard, |s| !s.has_proc_work(proc, tid))
                    .unwrap();
            }
        } else if non_block {
            if !guard.has_thread_work(proc, tid) {
                wait_err = Some(Error::WouldBlock);
            }
        } else {
            let cv = guard
                .procs
                .get(&proc)
                .unwrap()
                .workers
                .get(&tid)
                .unwrap()
                .wait
                .clone();
            guard = cv
                .wait_while(guard, |s| !s.has_thread_work(proc, tid))
                .unwrap();
        }
        // Unpark.
        if let Some(p) = guard.procs.get_mut(&proc) {
            if wait_for_proc_work {
                p.ready_threads = p.ready_threads.saturating_sub(1);
            }
            if let Some(wk) = p.workers.get_mut(&tid) {
                wk.looper &= !LooperState::WAITING;
            }
        }
        if let Some(e) = wait_err {
            return (guard, Err(e));
        }

        // Drain.
        loop {
            let Some(p) = guard.procs.get(&proc) else {
                break 'retry;
            };
            let Some(wk) = p.workers.get(&tid) else {
                break 'retry;
            };
            let from_thread = !wk.todo.is_empty();
            if !from_thread && !(wait_for_proc_work && !p.todo.is_empty()) {
                if w.pos() == 4 && !wk.looper.contains(LooperState::NEED_RETURN) {
                    // Nothing was delivered: go back to sleep instead of
                    // returning an empty read.
                    continue 'retry;
                }
                break 'retry;
            }
            if w.remaining() < 4 + TransactionData::WIRE_SIZE {
                break 'retry;
            }
            let item = if from_thread {
                *wk.todo.front().unwrap()
            } else {
                *p.todo.front().unwrap()
            };
            let pop = |guard: &mut MutexGuard<'a, State>| {
                let p = guard.procs.get_mut(&proc).unwrap();
                if from_thread {
                    p.workers.get_mut(&tid).unwrap().todo.pop_front()
                } else {
                    p.todo.pop_front()
                }
            };
            match item {
                WorkItem::TransactionComplete => {
                    pop(&mut guard);
                    let _ = w.put_u32(ReturnCode::TransactionComplete as u32);
                    guard.stats.emitted(ReturnCode::TransactionComplete as u32);
                    guard.stats.destroyed(ObjClass::TransactionComplete);
                    log::debug!("{}:{} TRANSACTION_COMPLETE", proc, tid);
                }
                WorkItem::Node(node) => {
                    deliver_node_work(&mut guard, &mut w, proc, tid, node, pop);
                }
                WorkItem::Death(death) => {
                    if deliver_death_work(&mut guard, &mut w, proc, tid, death, pop) {
                        break 'retry;
                    }
                }
                WorkItem::Transaction(txn) => {
                    deliver_transaction(&mut guard, &mut w, proc, tid, txn, pop);
                    break 'retry;
                }
            }
        }
    }

    *consumed = w.pos();
    drop(w);

    // Sole backpressure signal: ask for one more worker when the pool ran
    // dry.
    let spawn = guard
        .procs
        .get(&proc)
        .map(|p| {
            p.requested_threads + p.ready_threads == 0
                && p.requested_threads_started < p.max_threads
                && p.workers
                    .get(&tid)
                    .map(|wk| {
                        wk.looper
                            .intersects(LooperState::REGISTERED | LooperState::ENTERED)
                    })
                    .unwrap_or(false)
        })
        .unwrap_or(false);
    if spawn && read.len() >= 4 {
        guard.procs.get_mut(&proc).unwrap().requested_threads += 1;
        log::debug!("{}:{} SPAWN_LOOPER", proc, tid);
        read[0..4].copy_from_slice(&(ReturnCode::SpawnLooper as u32).to_ne_bytes());
        guard.stats.emitted(ReturnCode::SpawnLooper as u32);
    }
    (guard, Ok(()))
}

/// Emit the right refcount request for a node work item. The item stays
/// queued while requests remain to be sent; once none applies it is
/// retired, destroying the node if nothing keeps it alive.
fn deliver_node_work<'a>(
    guard: &mut MutexGuard<'a, State>,
    w: &mut StreamWriter<'_>,
    proc: ProcessId,
    tid: WorkerId,
    node: crate::NodeId,
    pop: impl Fn(&mut MutexGuard<'a, State>) -> Option<WorkItem>,
) {
    let Some(n) = guard.nodes.get(&node) else {
        pop(guard);
        return;
    };
    let strong = n.internal_strong > 0 || n.local_strong > 0;
    let weak = !n.refs.is_empty() || n.local_weak > 0 || strong;
    let (ptr, cookie) = (n.ptr, n.cookie);
    let (has_strong, has_weak) = (n.has_strong, n.has_weak);

    let cmd = {
        let n = guard.nodes.get_mut(&node).unwrap();
        if weak && !has_weak {
            n.has_weak = true;
            n.pending_weak = true;
            n.local_weak += 1;
            Some(ReturnCode::IncRefs)
        } else if strong && !has_strong {
            n.has_strong = true;
            n.pending_strong = true;
            n.local_strong += 1;
            Some(ReturnCode::Acquire)
        } else if !strong && has_strong {
            n.has_strong = false;
            Some(ReturnCode::Release)
        } else if !weak && has_weak {
            n.has_weak = false;
            Some(ReturnCode::DecRefs)
        } else {
            None
        }
    };
    match cmd {
        Some(c) => {
            let _ = w.put_u32(c as u32);
            let mut raw = [0u8; PtrCookie::WIRE_SIZE];
            PtrCookie { ptr, cookie }.encode(&mut raw);
            let _ = w.put_bytes(&raw);
            guard.stats.emitted(c as u32);
            log::debug!("{}:{} {:?} node {} u{:#x} c{:#x}", proc, tid, c, node, ptr, cookie);
        }
        None => {
            pop(guard);
            if let Some(n) = guard.nodes.get_mut(&node) {
                n.work_queued = false;
            }
            if !weak && !strong {
                log::debug!("{}:{} node {} u{:#x} c{:#x} deleted", proc, tid, node, ptr, cookie);
                guard.destroy_node(node);
            } else {
                log::debug!(
                    "{}:{} node {} u{:#x} c{:#x} state unchanged",
                    proc,
                    tid,
                    node,
                    ptr,
                    cookie
                );
            }
        }
    }
}

/// Deliver a death work item. Returns true when the record was a dead
/// notification, which ends the read pass (the client may react with new
/// commands).
fn deliver_death_work<'a>(
    guard: &mut MutexGuard<'a, State>,
    w: &mut StreamWriter<'_>,
    proc: ProcessId,
    tid: WorkerId,
    death: crate::DeathId,
    pop: impl Fn(&mut MutexGuard<'a, State>) -> Option<WorkItem>,
) -> bool {
    let Some(d) = guard.deaths.get(&death) else {
        pop(guard);
        return false;
    };
    let (kind, cookie) = (d.kind, d.cookie);
    let cmd = if kind == crate::death::DeathKind::Clear {
        ReturnCode::ClearDeathNotificationDone
    } else {
        ReturnCode::DeadNode
    };
    let _ = w.put_u32(cmd as u32);
    let _ = w.put_u64(cookie);
    guard.stats.emitted(cmd as u32);
    log::debug!("{}:{} {:?} {:#x}", proc, tid, cmd, cookie);
    pop(guard);
    if cmd == ReturnCode::ClearDeathNotificationDone {
        if let Some(d) = guard.deaths.get_mut(&death) {
            d.queued = false;
        }
        guard.deaths.remove(&death);
        guard.stats.destroyed(ObjClass::Death);
        false
    } else {
        if let Some(d) = guard.deaths.get_mut(&death) {
            d.delivered = true;
        }
        if let Some(p) = guard.procs.get_mut(&proc) {
            p.delivered_death.push(death);
        }
        true
    }
}

/// Deliver a transaction or reply record, rewriting the payload pointers
/// into the receiver's view of its arena.
fn deliver_transaction<'a>(
    guard: &mut MutexGuard<'a, State>,
    w: &mut StreamWriter<'_>,
    proc: ProcessId,
    tid: WorkerId,
    txn: crate::TransactionId,
    pop: impl Fn(&mut MutexGuard<'a, State>) -> Option<WorkItem>,
) {
    let Some(t) = guard.transactions.get(&txn) else {
        pop(guard);
        return;
    };
    let Some(start) = t.buffer else {
        log::error!("transaction {} has no buffer at delivery", txn);
        pop(guard);
        guard.transactions.remove(&txn);
        guard.stats.destroyed(ObjClass::Transaction);
        return;
    };
    let one_way = t.is_one_way();
    let target_node = t.target_node;
    let (t_code, t_flags, t_euid, t_from, t_priority) =
        (t.code, t.flags, t.sender_euid, t.from, t.priority);

    let mut tr = TransactionData {
        code: t_code,
        flags: t_flags,
        sender_euid: t_euid,
        ..Default::default()
    };
    let cmd = match target_node {
        Some(node) => {
            let (min_priority, ptr, cookie) = {
                let n = &guard.nodes[&node];
                (n.min_priority, n.ptr, n.cookie)
            };
            tr.target = ptr;
            tr.cookie = cookie;
            // Apply the node's priority floor for the duration of the
            // handling; the previous value is restored on reply.
            let saved = guard
                .procs
                .get(&proc)
                .and_then(|p| p.workers.get(&tid))
                .map(|wk| wk.priority)
                .unwrap_or(0);
            if let Some(t) = guard.transactions.get_mut(&txn) {
                t.saved_priority = saved;
            }
            let new_priority = if t_priority < min_priority && !one_way {
                Some(t_priority)
            } else if !one_way || saved > min_priority {
                Some(min_priority)
            } else {
                None
            };
            if let Some(np) = new_priority {
                if let Some(wk) = guard.procs.get_mut(&proc).and_then(|p| p.workers.get_mut(&tid))
                {
                    wk.priority = np;
                }
            }
            ReturnCode::Transaction
        }
        None => ReturnCode::Reply,
    };
    tr.sender_pid = t_from
        .and_then(|(fp, _)| guard.procs.get(&fp))
        .map(|p| p.pid as i32)
        .unwrap_or(0);
    {
        let a = guard.procs.get(&proc).unwrap().arena.as_ref().unwrap();
        let b = a.get(start).unwrap();
        tr.data_size = b.data_size;
        tr.offsets_size = b.offsets_size;
        tr.data_ptr = a.user_addr(b.data());
        tr.offsets_ptr = tr.data_ptr + ptr_align(b.data_size);
    }

    let _ = w.put_u32(cmd as u32);
    let mut raw = [0u8; TransactionData::WIRE_SIZE];
    tr.encode(&mut raw);
    let _ = w.put_bytes(&raw);
    guard.stats.emitted(cmd as u32);
    log::debug!(
        "{}:{} {:?} {} size {}-{}",
        proc,
        tid,
        cmd,
        txn,
        tr.data_size,
        tr.offsets_size
    );

    pop(guard);
    if let Some(b) = guard
        .procs
        .get_mut(&proc)
        .and_then(|p| p.arena.as_mut())
        .and_then(|a| a.get_mut(start))
    {
        b.allow_user_free = true;
    }
    if cmd == ReturnCode::Transaction && !one_way {
        let stack_top = guard
            .procs
            .get(&proc)
            .and_then(|p| p.workers.get(&tid))
            .and_then(|wk| wk.transaction_stack);
        if let Some(t) = guard.transactions.get_mut(&txn) {
            t.to_parent = stack_top;
            t.to_thread = Some(tid);
        }
        if let Some(wk) = guard.procs.get_mut(&proc).and_then(|p| p.workers.get_mut(&tid)) {
            wk.transaction_stack = Some(txn);
        }
    } else {
        // One-way calls and replies carry no frame; the buffer outlives
        // the transaction until the receiver frees it.
        if let Some(b) = guard
            .procs
            .get_mut(&proc)
            .and_then(|p| p.arena.as_mut())
            .and_then(|a| a.get_mut(start))
        {
            b.transaction = None;
        }
        guard.transactions.remove(&txn);
        guard.stats.destroyed(ObjClass::Transaction);
    }
}

fn set_return_error(guard: &mut MutexGuard<'_, State>, proc: ProcessId, tid: WorkerId, v: ReturnCode) {
    if let Some(wk) = guard.procs.get_mut(&proc).and_then(|p| p.workers.get_mut(&tid)) {
        wk.return_error = v;
    }
}

fn set_return_error2(
    guard: &mut MutexGuard<'_, State>,
    proc: ProcessId,
    tid: WorkerId,
    v: ReturnCode,
) {
    if let Some(wk) = guard.procs.get_mut(&proc).and_then(|p| p.workers.get_mut(&tid)) {
        wk.return_error2 = v;
    }
}

#[cfg(test)]
mod tests {
    use relay_shared::Command;

    use crate::broker::State;
    use crate::externs::Externs;
    use crate::thread::LooperState;

    struct NullExterns;

    impl Externs for NullExterns {
        fn copy_user(&self, _pid: u32, _addr: u64, _dst: &mut [u8]) -> anyhow::Result<()> {
            anyhow::bail!("no memory")
        }

        fn dup_fd(&self, _from: u32, _fd: u32, _to: u32) -> anyhow::Result<u32> {
            anyhow::bail!("no fd table")
        }

        fn close_fd(&self, _pid: u32, _fd: u32) {}
    }

    fn stream(cmds: &[(u32, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (code, payload) in cmds {
            out.extend_from_slice(&code.to_ne_bytes());
            out.extend_from_slice(payload);
        }
        out
    }

    #[test]
    fn truncated_stream_keeps_record_boundary() {
        let mut s = State::new();
        let p = s.new_process(100, 1000, 0);
        s.get_or_create_worker(p, 1);
        let mut buf = stream(&[(Command::EnterLooper as u32, &[])]);
        buf.extend_from_slice(&(Command::FreeBuffer as u32).to_ne_bytes());
        buf.extend_from_slice(&[0u8; 4]); // half a u64 payload
        let mut consumed = 0;
        let res = s.thread_write(&NullExterns, p, 1, &buf, &mut consumed);
        assert!(res.is_err());
        assert_eq!(consumed, 4, "only the complete record counts as consumed");
    }

    #[test]
    fn unknown_command_is_a_stream_fault() {
        let mut s = State::new();
        let p = s.new_process(100, 1000, 0);
        s.get_or_create_worker(p, 1);
        let buf = stream(&[(0xdead_0000, &[])]);
        let mut consumed = 0;
        assert!(s.thread_write(&NullExterns, p, 1, &buf, &mut consumed).is_err());
    }

    #[test]
    fn looper_binding_commands_are_exclusive() {
        let mut s = State::new();
        let p = s.new_process(100, 1000, 0);
        s.get_or_create_worker(p, 1);
        let buf = stream(&[
            (Command::EnterLooper as u32, &[]),
            (Command::RegisterLooper as u32, &[]),
        ]);
        let mut consumed = 0;
        s.thread_write(&NullExterns, p, 1, &buf, &mut consumed).unwrap();
        let w = s.procs.get(&p).unwrap().workers.get(&1).unwrap();
        assert!(w.looper.contains(LooperState::ENTERED));
        assert!(w.looper.contains(LooperState::INVALID));
    }

    #[test]
    fn register_without_request_is_invalid() {
        let mut s = State::new();
        let p = s.new_process(100, 1000, 0);
        s.get_or_create_worker(p, 1);
        let buf = stream(&[(Command::RegisterLooper as u32, &[])]);
        let mut consumed = 0;
        s.thread_write(&NullExterns, p, 1, &buf, &mut consumed).unwrap();
        let w = s.procs.get(&p).unwrap().workers.get(&1).unwrap();
        assert!(w.looper.contains(LooperState::INVALID));
        assert!(w.looper.contains(LooperState::REGISTERED));
    }

    #[test]
    fn register_consumes_a_spawn_request() {
        let mut s = State::new();
        let p = s.new_process(100, 1000, 0);
        s.get_or_create_worker(p, 1);
        s.procs.get_mut(&p).unwrap().requested_threads = 1;
        let buf = stream(&[(Command::RegisterLooper as u32, &[])]);
        let mut consumed = 0;
        s.thread_write(&NullExterns, p, 1, &buf, &mut consumed).unwrap();
        let proc = s.procs.get(&p).unwrap();
        assert_eq!(proc.requested_threads, 0);
        assert_eq!(proc.requested_threads_started, 1);
        assert!(!proc.workers.get(&1).unwrap().looper.contains(LooperState::INVALID));
    }
}
