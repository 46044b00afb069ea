// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Death subscriptions.
//!
//! A reference may carry at most one subscription. Its work item moves
//! through the queues in one of three shapes: `Dead` (the node's owner
//! died), `Clear` (the subscription is torn down and the client gets a
//! final acknowledgement), or `DeadAndClear` (a clear arrived while the
//! dead notification was queued or awaiting its ack, so the clear
//! acknowledgement must follow the dead one).

use crate::broker::State;
use crate::error::user_error;
use crate::stats::ObjClass;
use crate::thread::LooperState;
use crate::transaction::{QueueRef, WorkItem};
use crate::{DeathId, Handle, ProcessId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeathKind {
    Dead,
    Clear,
    DeadAndClear,
}

/// One (reference, cookie) subscription.
#[derive(Debug)]
pub(crate) struct Death {
    /// The subscribing process.
    pub(crate) proc: ProcessId,
    pub(crate) cookie: u64,
    pub(crate) kind: DeathKind,
    /// The work item is linked somewhere: a todo queue or the
    /// delivered-death list.
    pub(crate) queued: bool,
    pub(crate) delivered: bool,
}

impl State {
    /// Queue a death work item on the subscriber: directly on the calling
    /// worker if it is a bound looper, otherwise on the process queue with
    /// a wake-up.
    fn queue_death(&mut self, proc: ProcessId, tid: WorkerId, death: DeathId) {
        if let Some(d) = self.deaths.get_mut(&death) {
            d.queued = true;
        }
        let is_looper = self
            .procs
            .get(&proc)
            .and_then(|p| p.workers.get(&tid))
            .map(|w| {
                w.looper
                    .intersects(LooperState::REGISTERED | LooperState::ENTERED)
            })
            .unwrap_or(false);
        if is_looper {
            self.push_work(QueueRef::Worker(proc, tid), WorkItem::Death(death), false);
        } else {
            self.push_work(QueueRef::Proc(proc), WorkItem::Death(death), true);
        }
    }

    /// `REQUEST_DEATH_NOTIFICATION`: attach a subscription to a
    /// reference. If the target node is already orphaned the notification
    /// fires immediately.
    pub(crate) fn request_death(
        &mut self,
        proc: ProcessId,
        tid: WorkerId,
        handle: Handle,
        cookie: u64,
    ) {
        let Some(node) = self.ref_node(proc, handle) else {
            user_error!(self, "death notification request on invalid ref {}", handle);
            return;
        };
        if self
            .procs
            .get(&proc)
            .and_then(|p| p.refs_by_desc.get(&handle))
            .and_then(|r| r.death)
            .is_some()
        {
            user_error!(self, "death notification already set on ref {}", handle);
            return;
        }
        let id = self.next_id();
        self.deaths.insert(
            id,
            Death {
                proc,
                cookie,
                kind: DeathKind::Dead,
                queued: false,
                delivered: false,
            },
        );
        self.stats.created(ObjClass::Death);
        if let Some(r) = self
            .procs
            .get_mut(&proc)
            .and_then(|p| p.refs_by_desc.get_mut(&handle))
        {
            r.death = Some(id);
        }
        let orphaned = self.nodes.get(&node).map(|n| n.owner.is_none()).unwrap_or(true);
        if orphaned {
            self.queue_death(proc, tid, id);
        }
    }

    /// `CLEAR_DEATH_NOTIFICATION`: detach a subscription. If its dead
    /// notification is already in flight, the clear acknowledgement is
    /// deferred until that one has been acknowledged.
    pub(crate) fn clear_death(
        &mut self,
        proc: ProcessId,
        tid: WorkerId,
        handle: Handle,
        cookie: u64,
    ) {
        let death = self
            .procs
            .get(&proc)
            .and_then(|p| p.refs_by_desc.get(&handle))
            .and_then(|r| r.death);
        let Some(death) = death else {
            user_error!(self, "death notification not active on ref {}", handle);
            return;
        };
        if self.deaths.get(&death).map(|d| d.cookie) != Some(cookie) {
            user_error!(self, "death notification cookie mismatch on ref {}", handle);
            return;
        }
        if let Some(r) = self
            .procs
            .get_mut(&proc)
            .and_then(|p| p.refs_by_desc.get_mut(&handle))
        {
            r.death = None;
        }
        let d = self.deaths.get_mut(&death).unwrap();
        if !d.queued {
            d.kind = DeathKind::Clear;
            self.queue_death(proc, tid, death);
        } else {
            if d.kind != DeathKind::Dead {
                log::error!("clear on death {} in state {:?}", death, d.kind);
            }
            d.kind = DeathKind::DeadAndClear;
        }
    }

    /// `DEAD_NODE_DONE`: the client acknowledged a delivered dead
    /// notification. A pending clear is released now.
    pub(crate) fn dead_node_done(&mut self, proc: ProcessId, tid: WorkerId, cookie: u64) {
        let found = self.procs.get(&proc).and_then(|p| {
            p.delivered_death
                .iter()
                .copied()
                .find(|d| self.deaths.get(d).map(|d| d.cookie) == Some(cookie))
        });
        let Some(death) = found else {
            user_error!(self, "dead-node ack {:#x} not found", cookie);
            return;
        };
        log::trace!("dead-node ack {:#x} found death {}", cookie, death);
        if let Some(p) = self.procs.get_mut(&proc) {
            p.delivered_death.retain(|d| *d != death);
        }
        let d = self.deaths.get_mut(&death).unwrap();
        d.queued = false;
        d.delivered = false;
        if d.kind == DeathKind::DeadAndClear {
            d.kind = DeathKind::Clear;
            self.queue_death(proc, tid, death);
        }
    }

    /// Unlink a death work item from wherever it sits.
    pub(crate) fn unqueue_death(&mut self, death: DeathId) {
        let Some(d) = self.deaths.get(&death) else {
            return;
        };
        let proc = d.proc;
        if !d.queued && !d.delivered {
            return;
        }
        if let Some(p) = self.procs.get_mut(&proc) {
            let item = WorkItem::Death(death);
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
            p.delivered_death.retain(|d| *d != death);
        }
        if let Some(d) = self.deaths.get_mut(&death) {
            d.queued = false;
            d.delivered = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (State, ProcessId, ProcessId, Handle) {
        let mut s = State::new();
        let owner = s.new_process(100, 1000, 0);
        let client = s.new_process(200, 1000, 0);
        let node = s.new_node(owner, 0x10, 0, 0, false).unwrap();
        let desc = s.get_ref_for_node(client, node).unwrap();
        (s, owner, client, desc)
    }

    #[test]
    fn double_registration_is_rejected() {
        let (mut s, _owner, client, desc) = fixture();
        s.request_death(client, 1, desc, 0xc0);
        let first = s
            .procs
            .get(&client)
            .unwrap()
            .refs_by_desc
            .get(&desc)
            .unwrap()
            .death;
        assert!(first.is_some());
        s.request_death(client, 1, desc, 0xc1);
        let second = s
            .procs
            .get(&client)
            .unwrap()
            .refs_by_desc
            .get(&desc)
            .unwrap()
            .death;
        assert_eq!(first, second);
    }

    #[test]
    fn clear_without_pending_dead_queues_clear_done() {
        let (mut s, _owner, client, desc) = fixture();
        s.request_death(client, 1, desc, 0xc0);
        s.clear_death(client, 1, desc, 0xc0);
        let p = s.procs.get(&client).unwrap();
        assert_eq!(p.todo.len(), 1);
        let WorkItem::Death(d) = p.todo[0] else {
            panic!("expected death work");
        };
        assert_eq!(s.deaths.get(&d).unwrap().kind, DeathKind::Clear);
    }

    #[test]
    fn clear_with_queued_dead_promotes() {
        let (mut s, owner, client, desc) = fixture();
        s.request_death(client, 1, desc, 0xc0);
        // Owner dies: the dead notification is queued.
        s.deferred_release(owner);
        let d = {
            let p = s.procs.get(&client).unwrap();
            assert_eq!(p.todo.len(), 1);
            let WorkItem::Death(d) = p.todo[0] else {
                panic!("expected death work");
            };
            d
        };
        assert_eq!(s.deaths.get(&d).unwrap().kind, DeathKind::Dead);
        s.clear_death(client, 1, desc, 0xc0);
        assert_eq!(s.deaths.get(&d).unwrap().kind, DeathKind::DeadAndClear);
        // Still only one queued work item.
        assert_eq!(s.procs.get(&client).unwrap().todo.len(), 1);
    }
}
