// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! The broker: global registries behind one lock, the per-process
//! [`Endpoint`] surface, and the deferred-teardown worker.
//!
//! Every mutating operation runs to completion under the single broker
//! mutex; the only suspension point is the read wait inside
//! [`Endpoint::write_read`], which drops the lock while parked. Per-worker
//! and per-process condition variables give the wake-ups direction.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::arena::{Arena, PAGE_SIZE};
use crate::codec;
use crate::death::Death;
use crate::error::{Error, Result};
use crate::externs::Externs;
use crate::node::Node;
use crate::process::Process;
use crate::stats::{Stats, TransactionLog};
use crate::transaction::Transaction;
use crate::{DeathId, NodeId, ProcessId, TransactionId, WorkerId};

pub use crate::arena::MAX_ARENA_SIZE;

/// Arguments to [`Endpoint::write_read`]. The `*_consumed` fields are
/// in/out: on entry, how much of the buffer was already processed; on
/// return, how far the broker got.
#[derive(Debug)]
pub struct WriteRead<'a> {
    pub write: &'a [u8],
    pub write_consumed: usize,
    pub read: &'a mut [u8],
    pub read_consumed: usize,
}

impl<'a> WriteRead<'a> {
    pub fn new(write: &'a [u8], read: &'a mut [u8]) -> Self {
        Self {
            write,
            write_consumed: 0,
            read,
            read_consumed: 0,
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct DeferredFlags: u32 {
        const PUT_FILES = 0x01;
        const FLUSH = 0x02;
        const RELEASE = 0x04;
    }
}

/// Everything the broker owns, guarded by the one mutex.
#[derive(Debug)]
pub(crate) struct State {
    pub(crate) last_id: u64,
    pub(crate) procs: BTreeMap<ProcessId, Process>,
    pub(crate) nodes: BTreeMap<NodeId, Node>,
    /// Orphaned nodes kept alive by surviving references.
    pub(crate) dead_nodes: BTreeSet<NodeId>,
    pub(crate) transactions: BTreeMap<TransactionId, Transaction>,
    pub(crate) deaths: BTreeMap<DeathId, Death>,
    pub(crate) context_mgr: Option<NodeId>,
    /// Only this euid may re-register the context manager once set.
    pub(crate) context_mgr_uid: Option<u32>,
    /// Debugging latch: 1 = arm, 2 = tripped (reads blocked until lowered).
    pub(crate) stop_on_user_error: u32,
    pub(crate) stats: Stats,
    pub(crate) log: TransactionLog,
    pub(crate) log_failed: TransactionLog,
}

impl State {
    pub(crate) fn new() -> Self {
        Self {
            last_id: 0,
            procs: BTreeMap::new(),
            nodes: BTreeMap::new(),
            dead_nodes: BTreeSet::new(),
            transactions: BTreeMap::new(),
            deaths: BTreeMap::new(),
            context_mgr: None,
            context_mgr_uid: None,
            stop_on_user_error: 0,
            stats: Stats::default(),
            log: TransactionLog::default(),
            log_failed: TransactionLog::default(),
        }
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    pub(crate) fn arena(&self, proc: ProcessId) -> Option<&Arena> {
        self.procs.get(&proc)?.arena.as_ref()
    }

    pub(crate) fn arena_mut(&mut self, proc: ProcessId) -> Option<&mut Arena> {
        self.procs.get_mut(&proc)?.arena.as_mut()
    }
}

#[derive(Debug, Default)]
struct DeferredQueue {
    list: Vec<(ProcessId, DeferredFlags)>,
    shutdown: bool,
}

/// State shared between the public handles and the deferred worker.
pub(crate) struct Shared<E> {
    pub(crate) state: Mutex<State>,
    /// Paired with `state` for the stop-on-user-error gate.
    stop_cv: Condvar,
    pub(crate) externs: E,
    deferred: Mutex<DeferredQueue>,
    deferred_cv: Condvar,
}

impl<E: Externs> Shared<E> {
    /// Park the caller while the stop latch is tripped.
    pub(crate) fn wait_stop_latch<'a>(
        &self,
        guard: MutexGuard<'a, State>,
    ) -> MutexGuard<'a, State> {
        self.stop_cv
            .wait_while(guard, |s| s.stop_on_user_error >= 2)
            .unwrap()
    }

    /// Queue deferred work for `proc`, coalescing with an existing entry.
    fn defer_work(&self, proc: ProcessId, flags: DeferredFlags) {
        let mut q = self.deferred.lock().unwrap();
        match q.list.iter_mut().find(|(p, _)| *p == proc) {
            Some((_, f)) => *f |= flags,
            None => q.list.push((proc, flags)),
        }
        self.deferred_cv.notify_one();
    }

    fn deferred_loop(&self) {
        loop {
            let (proc, flags) = {
                let mut q = self.deferred.lock().unwrap();
                loop {
                    if let Some(entry) = q.list.pop() {
                        break entry;
                    }
                    if q.shutdown {
                        return;
                    }
                    q = self.deferred_cv.wait(q).unwrap();
                }
            };
            let pid = self
                .state
                .lock()
                .unwrap()
                .procs
                .get(&proc)
                .map(|p| p.pid);
            if flags.contains(DeferredFlags::PUT_FILES) {
                if let Some(pid) = pid {
                    self.externs.put_files(pid);
                }
            }
            let mut state = self.state.lock().unwrap();
            if flags.contains(DeferredFlags::FLUSH) {
                state.deferred_flush(proc);
            }
            if flags.contains(DeferredFlags::RELEASE) {
                state.deferred_release(proc);
            }
        }
    }
}

/// The broker itself. Open endpoints keep the shared state alive; dropping
/// the broker only stops the deferred worker.
pub struct Broker<E: Externs> {
    shared: Arc<Shared<E>>,
    deferred_worker: Option<JoinHandle<()>>,
}

impl<E: Externs> Broker<E> {
    pub fn new(externs: E) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::new()),
            stop_cv: Condvar::new(),
            externs,
            deferred: Mutex::new(DeferredQueue::default()),
            deferred_cv: Condvar::new(),
        });
        let worker = {
            let shared = shared.clone();
            std::thread::spawn(move || shared.deferred_loop())
        };
        Broker {
            shared,
            deferred_worker: Some(worker),
        }
    }

    /// Bind a new process.
    pub fn open(&self, pid: u32, euid: u32, default_priority: i32) -> Endpoint<E> {
        let proc = self
            .shared
            .state
            .lock()
            .unwrap()
            .new_process(pid, euid, default_priority);
        Endpoint {
            shared: self.shared.clone(),
            proc,
            pid,
            closed: AtomicBool::new(false),
        }
    }

    pub fn version(&self) -> u32 {
        relay_shared::PROTOCOL_VERSION
    }

    /// Debugging aid: 0 = off, 1 = trip on the next user error, 2 =
    /// tripped now. While tripped, reads are held until lowered.
    pub fn set_stop_on_user_error(&self, value: u32) {
        let mut g = self.shared.state.lock().unwrap();
        g.stop_on_user_error = value;
        drop(g);
        self.shared.stop_cv.notify_all();
    }

    pub fn stop_on_user_error(&self) -> u32 {
        self.shared.state.lock().unwrap().stop_on_user_error
    }

    /// Read the broker counters.
    pub fn with_stats<R>(&self, f: impl FnOnce(&Stats) -> R) -> R {
        f(&self.shared.state.lock().unwrap().stats)
    }

    /// Read the transaction rings (all, failed).
    pub fn with_transaction_log<R>(
        &self,
        f: impl FnOnce(&TransactionLog, &TransactionLog) -> R,
    ) -> R {
        let g = self.shared.state.lock().unwrap();
        f(&g.log, &g.log_failed)
    }
}

impl<E: Externs> Drop for Broker<E> {
    fn drop(&mut self) {
        self.shared.deferred.lock().unwrap().shutdown = true;
        self.shared.deferred_cv.notify_all();
        if let Some(h) = self.deferred_worker.take() {
            let _ = h.join();
        }
    }
}

/// A process's handle to the broker.
pub struct Endpoint<E: Externs> {
    shared: Arc<Shared<E>>,
    proc: ProcessId,
    pid: u32,
    closed: AtomicBool,
}

impl<E: Externs> Endpoint<E> {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        let g = self.shared.state.lock().unwrap();
        if !g.procs.contains_key(&self.proc) {
            return Err(Error::DeadProcess);
        }
        Ok(g)
    }

    /// Bind the transfer arena. `size` is clamped to [`MAX_ARENA_SIZE`]
    /// and rounded up to whole pages; the client sees the region
    /// read-only at the returned base address.
    pub fn map(&self, size: u64) -> Result<u64> {
        let mut g = self.state()?;
        let p = g.procs.get_mut(&self.proc).unwrap();
        if p.arena.is_some() {
            return Err(Error::AlreadyMapped);
        }
        let size = size
            .clamp(PAGE_SIZE, MAX_ARENA_SIZE)
            .next_multiple_of(PAGE_SIZE);
        let user_base = 0x0000_0100_0000_0000 + self.proc * 2 * MAX_ARENA_SIZE;
        p.arena = Some(Arena::new(size, user_base));
        log::debug!("process {} mapped {} bytes at u{:#x}", self.proc, size, user_base);
        Ok(user_base)
    }

    /// The command-codec entry point.
    pub fn write_read(&self, tid: WorkerId, args: &mut WriteRead<'_>, non_block: bool) -> Result<()> {
        let mut guard = self.state()?;
        guard = self.shared.wait_stop_latch(guard);
        if !guard.procs.contains_key(&self.proc) {
            return Err(Error::DeadProcess);
        }
        guard.get_or_create_worker(self.proc, tid);

        let mut result = Ok(());
        if !args.write.is_empty() {
            result = guard.thread_write(
                &self.shared.externs,
                self.proc,
                tid,
                args.write,
                &mut args.write_consumed,
            );
            if result.is_err() {
                args.read_consumed = 0;
            }
        }
        if result.is_ok() && !args.read.is_empty() {
            let (g, res) = codec::thread_read(
                &self.shared,
                guard,
                self.proc,
                tid,
                args.read,
                &mut args.read_consumed,
                non_block,
            );
            guard = g;
            // A pool-ready worker may have been bypassed while this one
            // held the queue; hand the pool another chance.
            if guard
                .procs
                .get(&self.proc)
                .map(|p| !p.todo.is_empty())
                .unwrap_or(false)
            {
                guard.procs.get(&self.proc).unwrap().wait.notify_one();
            }
            result = res;
        }
        if let Some(w) = guard
            .procs
            .get_mut(&self.proc)
            .and_then(|p| p.workers.get_mut(&tid))
        {
            w.looper &= !crate::thread::LooperState::NEED_RETURN;
        }
        drop(self.shared.wait_stop_latch(guard));
        result
    }

    pub fn set_max_threads(&self, max: u32) -> Result<()> {
        let mut g = self.state()?;
        g.procs.get_mut(&self.proc).unwrap().max_threads = max;
        Ok(())
    }

    /// Claim the context-manager slot. First caller wins; once an euid
    /// has claimed it, only that euid may claim again after the holder
    /// dies.
    pub fn set_context_manager(&self) -> Result<()> {
        let mut g = self.state()?;
        if g.context_mgr.is_some() {
            log::error!("context manager already set");
            return Err(Error::ContextManagerBusy);
        }
        let euid = g.procs.get(&self.proc).unwrap().euid;
        match g.context_mgr_uid {
            Some(uid) if uid != euid => {
                log::error!("context manager uid {} != {}", euid, uid);
                return Err(Error::PermissionDenied);
            }
            Some(_) => {}
            None => g.context_mgr_uid = Some(euid),
        }
        let node = g
            .new_node(self.proc, 0, 0, 0, false)
            .ok_or_else(|| Error::Fatal(anyhow::anyhow!("context manager node exists")))?;
        {
            // The directory node never bothers its owner with refcount
            // work.
            let n = g.nodes.get_mut(&node).unwrap();
            n.local_strong += 1;
            n.local_weak += 1;
            n.has_strong = true;
            n.has_weak = true;
        }
        g.context_mgr = Some(node);
        Ok(())
    }

    /// Destroy the calling worker.
    pub fn thread_exit(&self, tid: WorkerId) -> Result<()> {
        let mut g = self.state()?;
        log::debug!("{}:{} exit", self.proc, tid);
        g.free_worker(self.proc, tid);
        Ok(())
    }

    /// Readability check for the calling worker.
    pub fn poll(&self, tid: WorkerId) -> Result<bool> {
        let mut g = self.state()?;
        g.get_or_create_worker(self.proc, tid);
        let wait_for_proc_work = {
            let p = g.procs.get(&self.proc).unwrap();
            let w = p.workers.get(&tid).unwrap();
            w.transaction_stack.is_none()
                && w.todo.is_empty()
                && w.return_error == relay_shared::ReturnCode::Ok
        };
        Ok(if wait_for_proc_work {
            g.has_proc_work(self.proc, tid)
        } else {
            g.has_thread_work(self.proc, tid)
        })
    }

    /// Read delivered payload bytes through the process's view of its
    /// arena.
    pub fn read_buffer(&self, user_addr: u64, len: usize) -> Result<Vec<u8>> {
        let g = self.state()?;
        let a = g.arena(self.proc).ok_or(Error::NotMapped)?;
        let mut out = vec![0u8; len];
        let addr = user_addr
            .checked_sub(a.user_offset())
            .ok_or_else(|| Error::Fatal(anyhow::anyhow!("address below arena base")))?;
        a.read(addr, &mut out)?;
        Ok(out)
    }

    /// Bytes still available to one-way traffic in this process's arena.
    pub fn async_free_space(&self) -> Result<u64> {
        let g = self.state()?;
        Ok(g.arena(self.proc).ok_or(Error::NotMapped)?.free_async_space())
    }

    /// Number of currently allocated transfer buffers.
    pub fn allocated_buffers(&self) -> Result<usize> {
        let g = self.state()?;
        Ok(g.arena(self.proc).ok_or(Error::NotMapped)?.allocated().len())
    }

    /// Kick every worker of this process out of its read.
    pub fn flush(&self) {
        self.shared.defer_work(self.proc, DeferredFlags::FLUSH);
    }

    /// Release the process. Idempotent; also runs on drop.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.defer_work(
            self.proc,
            DeferredFlags::PUT_FILES | DeferredFlags::FLUSH | DeferredFlags::RELEASE,
        );
    }

    /// Block until the deferred worker has fully released this process.
    /// Test and shutdown convenience; returns immediately if the process
    /// is already gone.
    pub fn wait_released(&self) {
        loop {
            {
                let g = self.shared.state.lock().unwrap();
                if !g.procs.contains_key(&self.proc) {
                    return;
                }
            }
            std::thread::yield_now();
        }
    }
}

impl<E: Externs> Drop for Endpoint<E> {
    fn drop(&mut self) {
        self.close();
    }
}
