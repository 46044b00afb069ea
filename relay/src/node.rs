// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Service entities and per-process references to them.
//!
//! A node is published by exactly one process and named inside that process
//! by an opaque `(ptr, cookie)` pair. Every other process reaches it
//! through a [`Reference`], a small per-process descriptor. The broker
//! keeps the two reference counts of a node split by origin: `internal_*`
//! sums the contributions of references held by other processes, `local_*`
//! counts pins taken by in-flight transactions and by refcount requests the
//! owner has not acknowledged yet. `has_strong`/`has_weak` track whether
//! the owning process currently holds a userspace refcount on the entity;
//! the broker asks for and releases those by queueing a node work item on
//! the owner, and the four-way decision of what to emit is made at read
//! time against the then-current counts.

use std::collections::{BTreeMap, VecDeque};

use crate::broker::State;
use crate::error::user_error;
use crate::stats::ObjClass;
use crate::transaction::{QueueRef, WorkItem};
use crate::{DeathId, Handle, NodeId, ProcessId};

/// A service entity. Owned by the broker; processes only ever see
/// descriptors.
#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) id: NodeId,
    /// `None` once the owning process has died; the node then sits in the
    /// orphan set until the last reference drops.
    pub(crate) owner: Option<ProcessId>,
    pub(crate) ptr: u64,
    pub(crate) cookie: u64,
    pub(crate) internal_strong: u32,
    pub(crate) internal_weak: u32,
    pub(crate) local_strong: u32,
    pub(crate) local_weak: u32,
    pub(crate) has_strong: bool,
    pub(crate) has_weak: bool,
    pub(crate) pending_strong: bool,
    pub(crate) pending_weak: bool,
    /// Which processes hold a reference to this node, and under which
    /// descriptor.
    pub(crate) refs: BTreeMap<ProcessId, Handle>,
    pub(crate) async_in_flight: bool,
    pub(crate) async_todo: VecDeque<WorkItem>,
    pub(crate) accepts_fds: bool,
    pub(crate) min_priority: i32,
    /// The node's refcount work item is linked on one of the owner's todo
    /// queues.
    pub(crate) work_queued: bool,
}

/// A per-process handle to a node.
#[derive(Debug)]
pub(crate) struct Reference {
    pub(crate) debug_id: u64,
    pub(crate) desc: Handle,
    pub(crate) node: NodeId,
    pub(crate) strong: u32,
    pub(crate) weak: u32,
    pub(crate) death: Option<DeathId>,
}

impl State {
    pub(crate) fn get_node(&self, proc: ProcessId, ptr: u64) -> Option<NodeId> {
        self.procs.get(&proc)?.nodes_by_ptr.get(&ptr).copied()
    }

    /// Create a node for `(ptr, cookie)` in `proc`. Fails if the process
    /// already published a node under this pointer.
    pub(crate) fn new_node(
        &mut self,
        proc: ProcessId,
        ptr: u64,
        cookie: u64,
        min_priority: i32,
        accepts_fds: bool,
    ) -> Option<NodeId> {
        let id = self.next_id();
        let p = self.procs.get_mut(&proc)?;
        if p.nodes_by_ptr.contains_key(&ptr) {
            return None;
        }
        p.nodes_by_ptr.insert(ptr, id);
        let pid = p.pid;
        self.nodes.insert(
            id,
            Node {
                id,
                owner: Some(proc),
                ptr,
                cookie,
                internal_strong: 0,
                internal_weak: 0,
                local_strong: 0,
                local_weak: 0,
                has_strong: false,
                has_weak: false,
                pending_strong: false,
                pending_weak: false,
                refs: BTreeMap::new(),
                async_in_flight: false,
                async_todo: VecDeque::new(),
                accepts_fds,
                min_priority,
                work_queued: false,
            },
        );
        self.stats.created(ObjClass::Node);
        log::trace!("{}: node {} u{:#x} c{:#x} created", pid, id, ptr, cookie);
        Some(id)
    }

    /// Take a count on a node. `internal` counts come from references in
    /// other processes, local ones from the broker pinning the node for an
    /// in-flight use. When a count appears that the owner has not been
    /// asked to mirror yet, the node's work item is (re)queued on
    /// `target` so the owner learns about it.
    pub(crate) fn node_inc(
        &mut self,
        id: NodeId,
        strong: bool,
        internal: bool,
        target: Option<QueueRef>,
    ) -> Result<(), ()> {
        let is_ctx_mgr = self.context_mgr == Some(id);
        let needs_queue;
        {
            let node = match self.nodes.get_mut(&id) {
                Some(n) => n,
                None => return Err(()),
            };
            if strong {
                if internal {
                    if target.is_none()
                        && node.internal_strong == 0
                        && !(is_ctx_mgr && node.has_strong)
                    {
                        log::error!("invalid inc strong node for {}", id);
                        return Err(());
                    }
                    node.internal_strong += 1;
                } else {
                    node.local_strong += 1;
                }
                // Re-queue the work item onto the requested queue.
                needs_queue = !node.has_strong && target.is_some();
            } else {
                if !internal {
                    node.local_weak += 1;
                }
                if !node.has_weak && !node.work_queued {
                    if target.is_none() {
                        log::error!("invalid inc weak node for {}", id);
                        return Err(());
                    }
                    needs_queue = true;
                } else {
                    needs_queue = false;
                }
            }
        }
        if needs_queue {
            if strong {
                self.unqueue_node_work(id);
            }
            self.nodes.get_mut(&id).unwrap().work_queued = true;
            self.push_work(target.unwrap(), WorkItem::Node(id), false);
        }
        Ok(())
    }

    /// Drop a count. When the last strong (or last anything) goes away this
    /// either queues refcount-release work on the owner or destroys the
    /// node outright.
    pub(crate) fn node_dec(&mut self, id: NodeId, strong: bool, internal: bool) {
        enum Next {
            Done,
            QueueOwner(ProcessId),
            Destroy,
        }
        let next = {
            let node = match self.nodes.get_mut(&id) {
                Some(n) => n,
                None => {
                    log::error!("dec on unknown node {}", id);
                    return;
                }
            };
            let alive = 'counts: {
                if strong {
                    let c = if internal {
                        &mut node.internal_strong
                    } else {
                        &mut node.local_strong
                    };
                    if *c == 0 {
                        log::error!("strong count underflow on node {}", id);
                        break 'counts true;
                    }
                    *c -= 1;
                    node.local_strong > 0 || node.internal_strong > 0
                } else {
                    if !internal {
                        if node.local_weak == 0 {
                            log::error!("weak count underflow on node {}", id);
                            break 'counts true;
                        }
                        node.local_weak -= 1;
                    }
                    node.local_weak > 0 || !node.refs.is_empty()
                }
            };
            if alive {
                Next::Done
            } else if node.owner.is_some() && (node.has_strong || node.has_weak) {
                if !node.work_queued {
                    node.work_queued = true;
                    Next::QueueOwner(node.owner.unwrap())
                } else {
                    Next::Done
                }
            } else if node.refs.is_empty() && node.local_strong == 0 && node.local_weak == 0 {
                Next::Destroy
            } else {
                Next::Done
            }
        };
        match next {
            Next::Done => {}
            Next::QueueOwner(owner) => {
                self.push_work(QueueRef::Proc(owner), WorkItem::Node(id), true)
            }
            Next::Destroy => self.destroy_node(id),
        }
    }

    /// Remove a node from every index and drop it.
    pub(crate) fn destroy_node(&mut self, id: NodeId) {
        self.unqueue_node_work(id);
        let node = match self.nodes.remove(&id) {
            Some(n) => n,
            None => return,
        };
        match node.owner {
            Some(owner) => {
                if let Some(p) = self.procs.get_mut(&owner) {
                    p.nodes_by_ptr.remove(&node.ptr);
                }
                log::trace!("refless node {} deleted", id);
            }
            None => {
                self.dead_nodes.remove(&id);
                log::trace!("dead node {} deleted", id);
            }
        }
        self.stats.destroyed(ObjClass::Node);
    }

    /// Unlink the node's work item from whichever of the owner's queues it
    /// sits on.
    pub(crate) fn unqueue_node_work(&mut self, id: NodeId) {
        let (queued, owner) = match self.nodes.get(&id) {
            Some(n) => (n.work_queued, n.owner),
            None => return,
        };
        if !queued {
            return;
        }
        if let Some(p) = owner.and_then(|o| self.procs.get_mut(&o)) {
            let item = WorkItem::Node(id);
            if let Some(pos) = p.todo.iter().position(|w| *w == item) {
                p.todo.remove(pos);
            } else {
                for w in p.workers.values_mut() {
                    if let Some(pos) = w.todo.iter().position(|w| *w == item) {
                        w.todo.remove(pos);
                        break;
                    }
                }
            }
        }
        if let Some(n) = self.nodes.get_mut(&id) {
            n.work_queued = false;
        }
    }

    /// Find the reference `proc` holds on `node`, creating one (with a
    /// fresh descriptor) if this is the first time the node crosses into
    /// that process. Descriptor 0 is reserved for the context manager;
    /// everything else gets the smallest positive integer not in use.
    pub(crate) fn get_ref_for_node(&mut self, proc: ProcessId, node: NodeId) -> Option<Handle> {
        let is_ctx_mgr = self.context_mgr == Some(node);
        if let Some(&desc) = self.procs.get(&proc)?.refs_by_node.get(&node) {
            return Some(desc);
        }
        let debug_id = self.next_id();
        let p = self.procs.get_mut(&proc)?;
        let mut desc: Handle = if is_ctx_mgr { 0 } else { 1 };
        for &existing in p.refs_by_desc.keys() {
            if existing > desc {
                break;
            }
            desc = existing + 1;
        }
        p.refs_by_desc.insert(
            desc,
            Reference {
                debug_id,
                desc,
                node,
                strong: 0,
                weak: 0,
                death: None,
            },
        );
        p.refs_by_node.insert(node, desc);
        let pid = p.pid;
        self.nodes.get_mut(&node)?.refs.insert(proc, desc);
        self.stats.created(ObjClass::Reference);
        log::trace!("{}: new ref {} desc {} for node {}", pid, debug_id, desc, node);
        Some(desc)
    }

    pub(crate) fn ref_node(&self, proc: ProcessId, desc: Handle) -> Option<NodeId> {
        Some(self.procs.get(&proc)?.refs_by_desc.get(&desc)?.node)
    }

    /// Bump a reference count. The first strong (or weak) on a reference
    /// takes the matching internal count on the node.
    pub(crate) fn ref_inc(
        &mut self,
        proc: ProcessId,
        desc: Handle,
        strong: bool,
        target: Option<QueueRef>,
    ) -> Result<(), ()> {
        let (node, first) = {
            let r = self
                .procs
                .get(&proc)
                .and_then(|p| p.refs_by_desc.get(&desc))
                .ok_or(())?;
            (r.node, if strong { r.strong == 0 } else { r.weak == 0 })
        };
        if first {
            self.node_inc(node, strong, true, target)?;
            if !strong {
                if let Some(n) = self.nodes.get_mut(&node) {
                    n.internal_weak += 1;
                }
            }
        }
        let r = self
            .procs
            .get_mut(&proc)
            .and_then(|p| p.refs_by_desc.get_mut(&desc))
            .ok_or(())?;
        if strong {
            r.strong += 1;
        } else {
            r.weak += 1;
        }
        Ok(())
    }

    /// Drop a reference count; destroys the reference when both reach
    /// zero. Underflows are client faults.
    pub(crate) fn ref_dec(&mut self, proc: ProcessId, desc: Handle, strong: bool) -> Result<(), ()> {
        let (node, strong_count, weak_count, debug_id) = {
            let r = self
                .procs
                .get(&proc)
                .and_then(|p| p.refs_by_desc.get(&desc))
                .ok_or(())?;
            (r.node, r.strong, r.weak, r.debug_id)
        };
        if strong {
            if strong_count == 0 {
                user_error!(
                    self,
                    "invalid dec strong, ref {} desc {} s {} w {}",
                    debug_id,
                    desc,
                    strong_count,
                    weak_count
                );
                return Err(());
            }
            let r = self
                .procs
                .get_mut(&proc)
                .and_then(|p| p.refs_by_desc.get_mut(&desc))
                .ok_or(())?;
            r.strong -= 1;
            if r.strong == 0 {
                self.node_dec(node, true, true);
            }
        } else {
            if weak_count == 0 {
                user_error!(
                    self,
                    "invalid dec weak, ref {} desc {} s {} w {}",
                    debug_id,
                    desc,
                    strong_count,
                    weak_count
                );
                return Err(());
            }
            let r = self
                .procs
                .get_mut(&proc)
                .and_then(|p| p.refs_by_desc.get_mut(&desc))
                .ok_or(())?;
            r.weak -= 1;
            if r.weak == 0 {
                if let Some(n) = self.nodes.get_mut(&node) {
                    n.internal_weak = n.internal_weak.saturating_sub(1);
                }
            }
        }
        let gone = self
            .procs
            .get(&proc)
            .and_then(|p| p.refs_by_desc.get(&desc))
            .map(|r| r.strong == 0 && r.weak == 0)
            .unwrap_or(false);
        if gone {
            self.delete_ref(proc, desc);
        }
        Ok(())
    }

    /// Full reference teardown: drop its node contributions, its death
    /// subscription, and the descriptor itself.
    pub(crate) fn delete_ref(&mut self, proc: ProcessId, desc: Handle) {
        let r = match self
            .procs
            .get_mut(&proc)
            .and_then(|p| p.refs_by_desc.remove(&desc))
        {
            Some(r) => r,
            None => return,
        };
        if let Some(p) = self.procs.get_mut(&proc) {
            p.refs_by_node.remove(&r.node);
            log::trace!(
                "{}: delete ref {} desc {} for node {}",
                p.pid,
                r.debug_id,
                r.desc,
                r.node
            );
        }
        if r.strong > 0 {
            self.node_dec(r.node, true, true);
        }
        if let Some(n) = self.nodes.get_mut(&r.node) {
            n.refs.remove(&proc);
            if r.weak > 0 {
                n.internal_weak = n.internal_weak.saturating_sub(1);
            }
        }
        self.node_dec(r.node, false, true);
        if let Some(d) = r.death {
            self.unqueue_death(d);
            if self.deaths.remove(&d).is_some() {
                self.stats.destroyed(ObjClass::Death);
            }
        }
        self.stats.destroyed(ObjClass::Reference);
    }
}

#[cfg(test)]
mod tests {
    use crate::broker::State;
    use crate::transaction::QueueRef;

    fn state_with_proc() -> (State, crate::ProcessId) {
        let mut s = State::new();
        let p = s.new_process(100, 1000, 0);
        (s, p)
    }

    #[test]
    fn descriptors_are_smallest_free_positive() {
        let (mut s, p) = state_with_proc();
        let n1 = s.new_node(p, 0x10, 0, 0, false).unwrap();
        let n2 = s.new_node(p, 0x20, 0, 0, false).unwrap();
        let n3 = s.new_node(p, 0x30, 0, 0, false).unwrap();
        assert_eq!(s.get_ref_for_node(p, n1), Some(1));
        assert_eq!(s.get_ref_for_node(p, n2), Some(2));
        // Same node again: same descriptor, no new reference.
        assert_eq!(s.get_ref_for_node(p, n1), Some(1));
        // Drop descriptor 1 and the slot is reused.
        s.delete_ref(p, 1);
        assert_eq!(s.get_ref_for_node(p, n3), Some(1));
        // An existing descriptor never moves.
        assert_eq!(s.get_ref_for_node(p, n2), Some(2));
    }

    #[test]
    fn first_strong_asks_the_owner_once() {
        let (mut s, owner) = state_with_proc();
        let client = s.new_process(200, 1000, 0);
        let n = s.new_node(owner, 0x10, 0x11, 0, false).unwrap();
        let desc = s.get_ref_for_node(client, n).unwrap();
        s.ref_inc(client, desc, true, Some(QueueRef::Proc(owner)))
            .unwrap();
        s.ref_inc(client, desc, true, Some(QueueRef::Proc(owner)))
            .unwrap();
        let node = s.nodes.get(&n).unwrap();
        assert_eq!(node.internal_strong, 1);
        assert!(node.work_queued);
        assert_eq!(s.procs.get(&owner).unwrap().todo.len(), 1);
    }

    #[test]
    fn reference_counts_conserve_node_counts() {
        let (mut s, owner) = state_with_proc();
        let client = s.new_process(200, 1000, 0);
        let n = s.new_node(owner, 0x10, 0, 0, false).unwrap();
        let desc = s.get_ref_for_node(client, n).unwrap();
        s.ref_inc(client, desc, true, Some(QueueRef::Proc(owner)))
            .unwrap();
        s.ref_inc(client, desc, false, Some(QueueRef::Proc(owner)))
            .unwrap();
        {
            let node = s.nodes.get(&n).unwrap();
            assert_eq!(node.internal_strong, 1);
            assert_eq!(node.internal_weak, 1);
        }
        s.ref_dec(client, desc, true).unwrap();
        // Strong gone, weak still pins the reference and the node.
        assert!(s.nodes.contains_key(&n));
        assert_eq!(s.nodes.get(&n).unwrap().internal_strong, 0);
        s.ref_dec(client, desc, false).unwrap();
        // Both counts zero: the reference is destroyed.
        assert!(s
            .procs
            .get(&client)
            .unwrap()
            .refs_by_desc
            .get(&desc)
            .is_none());
    }

    #[test]
    fn underflow_is_rejected() {
        let (mut s, owner) = state_with_proc();
        let client = s.new_process(200, 1000, 0);
        let n = s.new_node(owner, 0x10, 0, 0, false).unwrap();
        let desc = s.get_ref_for_node(client, n).unwrap();
        assert!(s.ref_dec(client, desc, true).is_err());
        assert!(s.ref_dec(client, desc, false).is_err());
    }
}
