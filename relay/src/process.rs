// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Per-process broker state and the teardown sequence.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar};

use crate::arena::Arena;
use crate::broker::State;
use crate::death::DeathKind;
use crate::node::Reference;
use crate::stats::ObjClass;
use crate::thread::{LooperState, Worker};
use crate::transaction::WorkItem;
use crate::{Handle, NodeId, ProcessId, WorkerId};

/// One participant. Owns its workers, its outbound references, the nodes
/// it publishes, its arena, and its share of the pending work.
#[derive(Debug)]
pub(crate) struct Process {
    pub(crate) id: ProcessId,
    pub(crate) pid: u32,
    pub(crate) euid: u32,
    pub(crate) default_priority: i32,
    pub(crate) arena: Option<Arena>,
    pub(crate) workers: BTreeMap<WorkerId, Worker>,
    pub(crate) refs_by_desc: BTreeMap<Handle, Reference>,
    pub(crate) refs_by_node: BTreeMap<NodeId, Handle>,
    pub(crate) nodes_by_ptr: BTreeMap<u64, NodeId>,
    pub(crate) todo: VecDeque<WorkItem>,
    pub(crate) wait: Arc<Condvar>,
    /// Workers parked on the process-wide wait, eligible for pool work.
    pub(crate) ready_threads: u32,
    pub(crate) max_threads: u32,
    pub(crate) requested_threads: u32,
    pub(crate) requested_threads_started: u32,
    /// Dead notifications delivered but not yet acknowledged.
    pub(crate) delivered_death: Vec<crate::DeathId>,
}

impl State {
    pub(crate) fn new_process(&mut self, pid: u32, euid: u32, default_priority: i32) -> ProcessId {
        let id = self.next_id();
        self.procs.insert(
            id,
            Process {
                id,
                pid,
                euid,
                default_priority,
                arena: None,
                workers: BTreeMap::new(),
                refs_by_desc: BTreeMap::new(),
                refs_by_node: BTreeMap::new(),
                nodes_by_ptr: BTreeMap::new(),
                todo: VecDeque::new(),
                wait: Arc::new(Condvar::new()),
                ready_threads: 0,
                max_threads: 0,
                requested_threads: 0,
                requested_threads_started: 0,
                delivered_death: Vec::new(),
            },
        );
        self.stats.created(ObjClass::Process);
        log::debug!("process {} (pid {}) opened", id, pid);
        id
    }

    /// Kick every worker of `proc` out of its read.
    pub(crate) fn deferred_flush(&mut self, proc: ProcessId) {
        let Some(p) = self.procs.get_mut(&proc) else {
            return;
        };
        let mut wake_count = 0;
        for w in p.workers.values_mut() {
            w.looper |= LooperState::NEED_RETURN;
            if w.looper.contains(LooperState::WAITING) {
                w.wait.notify_all();
                wake_count += 1;
            }
        }
        p.wait.notify_all();
        log::debug!("flush {} woke {} threads", proc, wake_count);
    }

    /// Full teardown. Order matters: workers first (converting served
    /// calls into dead replies), then published nodes (orphaned while
    /// referenced, destroyed otherwise), then outbound references, then
    /// queued work, then the arena.
    pub(crate) fn deferred_release(&mut self, proc: ProcessId) {
        if !self.procs.contains_key(&proc) {
            return;
        }
        if self
            .context_mgr
            .and_then(|n| self.nodes.get(&n))
            .map(|n| n.owner == Some(proc))
            .unwrap_or(false)
        {
            log::debug!("release {}: context manager gone", proc);
            self.context_mgr = None;
        }

        let tids: Vec<WorkerId> = self.procs[&proc].workers.keys().copied().collect();
        let threads = tids.len();
        for tid in tids {
            self.free_worker(proc, tid);
        }

        let owned: Vec<NodeId> = self.procs[&proc].nodes_by_ptr.values().copied().collect();
        let nodes = owned.len();
        let mut incoming_refs = 0;
        for node in owned {
            self.unqueue_node_work(node);
            // One-way calls still waiting on this node can never be
            // delivered.
            let stale_async = self
                .nodes
                .get_mut(&node)
                .map(|n| std::mem::take(&mut n.async_todo))
                .unwrap_or_default();
            self.release_work(stale_async);
            self.procs
                .get_mut(&proc)
                .unwrap()
                .nodes_by_ptr
                .retain(|_, n| *n != node);
            let refless = self
                .nodes
                .get(&node)
                .map(|n| n.refs.is_empty())
                .unwrap_or(true);
            if refless {
                self.nodes.remove(&node);
                self.stats.destroyed(ObjClass::Node);
                continue;
            }
            let refs: Vec<(ProcessId, Handle)> = {
                let n = self.nodes.get_mut(&node).unwrap();
                n.owner = None;
                n.local_strong = 0;
                n.local_weak = 0;
                n.refs.iter().map(|(p, d)| (*p, *d)).collect()
            };
            self.dead_nodes.insert(node);
            let mut death_count = 0;
            for (holder, desc) in refs {
                incoming_refs += 1;
                let death = self
                    .procs
                    .get(&holder)
                    .and_then(|p| p.refs_by_desc.get(&desc))
                    .and_then(|r| r.death);
                if let Some(d) = death {
                    death_count += 1;
                    let already = self.deaths.get(&d).map(|d| d.queued).unwrap_or(true);
                    if !already {
                        if let Some(dd) = self.deaths.get_mut(&d) {
                            dd.kind = DeathKind::Dead;
                            dd.queued = true;
                        }
                        self.push_work(
                            crate::transaction::QueueRef::Proc(holder),
                            WorkItem::Death(d),
                            true,
                        );
                    } else {
                        log::error!("death {} already queued at owner release", d);
                    }
                }
            }
            log::debug!(
                "node {} now dead, refs {}, death {}",
                node,
                incoming_refs,
                death_count
            );
        }

        let descs: Vec<Handle> = self.procs[&proc].refs_by_desc.keys().copied().collect();
        let outgoing_refs = descs.len();
        for desc in descs {
            self.delete_ref(proc, desc);
        }

        let todo = std::mem::take(&mut self.procs.get_mut(&proc).unwrap().todo);
        self.release_work(todo);

        let buffers = {
            let arena_blocks = self.procs[&proc]
                .arena
                .as_ref()
                .map(|a| a.allocated())
                .unwrap_or_default();
            let count = arena_blocks.len();
            for start in arena_blocks {
                let txn = self.procs[&proc]
                    .arena
                    .as_ref()
                    .and_then(|a| a.get(start))
                    .and_then(|b| b.transaction);
                if let Some(t) = txn {
                    log::error!("release {}: transaction {} not freed", proc, t);
                    if let Some(t) = self.transactions.get_mut(&t) {
                        t.buffer = None;
                    }
                }
                if let Some(a) = self.procs.get_mut(&proc).unwrap().arena.as_mut() {
                    if let Some(b) = a.get_mut(start) {
                        b.transaction = None;
                    }
                    a.free(start);
                }
            }
            count
        };

        let p = self.procs.remove(&proc).unwrap();
        self.stats.destroyed(ObjClass::Process);
        log::debug!(
            "release {} (pid {}): threads {}, nodes {}, incoming refs {}, outgoing refs {}, buffers {}",
            p.id,
            p.pid,
            threads,
            nodes,
            incoming_refs,
            outgoing_refs,
            buffers
        );
    }
}
