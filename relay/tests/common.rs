// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Shared harness for the end-to-end scenarios: an in-memory [`Externs`]
//! implementation, a command-stream builder, and a return-stream parser.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use num_traits::FromPrimitive;
use relay::{Endpoint, Error, Externs, WriteRead};
use relay_shared::sys::{
    FlatObject, HandleCookie, ObjectKind, PtrCookie, TransactionData, TransactionFlags,
};
use relay_shared::{Command, ReturnCode};

/// Client memory and descriptor tables for every process in a test.
pub struct TestExterns {
    mems: Mutex<HashMap<u32, Vec<(u64, Vec<u8>)>>>,
    next_fd: AtomicU32,
    installed: Mutex<Vec<(u32, u32)>>,
    closed: Mutex<Vec<(u32, u32)>>,
}

impl TestExterns {
    pub fn new() -> TestExternsHandle {
        TestExternsHandle(Arc::new(Self {
            mems: Mutex::new(HashMap::new()),
            next_fd: AtomicU32::new(1000),
            installed: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
        }))
    }

    /// Place `bytes` at `addr` in `pid`'s address space.
    pub fn stage(&self, pid: u32, addr: u64, bytes: &[u8]) {
        self.mems
            .lock()
            .unwrap()
            .entry(pid)
            .or_default()
            .push((addr, bytes.to_vec()));
    }

    /// Descriptors installed by `dup_fd`, as (pid, fd) pairs.
    pub fn installed_fds(&self) -> Vec<(u32, u32)> {
        self.installed.lock().unwrap().clone()
    }

    pub fn closed_fds(&self) -> Vec<(u32, u32)> {
        self.closed.lock().unwrap().clone()
    }
}

/// Local newtype wrapper around `Arc<TestExterns>` so [`Externs`] can be
/// implemented for it from this crate (orphan rules forbid implementing a
/// foreign trait directly on a foreign type like `Arc`).
#[derive(Clone)]
pub struct TestExternsHandle(Arc<TestExterns>);

impl std::ops::Deref for TestExternsHandle {
    type Target = TestExterns;
    fn deref(&self) -> &TestExterns {
        &self.0
    }
}

impl Externs for TestExternsHandle {
    fn copy_user(&self, pid: u32, addr: u64, dst: &mut [u8]) -> anyhow::Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let mems = self.mems.lock().unwrap();
        let segs = mems
            .get(&pid)
            .ok_or_else(|| anyhow::anyhow!("no memory staged for pid {}", pid))?;
        for (base, buf) in segs {
            if addr >= *base && addr + dst.len() as u64 <= *base + buf.len() as u64 {
                let off = (addr - base) as usize;
                dst.copy_from_slice(&buf[off..off + dst.len()]);
                return Ok(());
            }
        }
        anyhow::bail!("fault at {:#x} in pid {}", addr, pid)
    }

    fn dup_fd(&self, _from_pid: u32, _fd: u32, to_pid: u32) -> anyhow::Result<u32> {
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        self.installed.lock().unwrap().push((to_pid, fd));
        Ok(fd)
    }

    fn close_fd(&self, pid: u32, fd: u32) {
        self.closed.lock().unwrap().push((pid, fd));
    }
}

/// Command-stream builder.
#[derive(Default)]
pub struct Cmds(Vec<u8>);

impl Cmds {
    pub fn new() -> Self {
        Self::default()
    }

    fn code(mut self, c: Command) -> Self {
        self.0.extend_from_slice(&(c as u32).to_ne_bytes());
        self
    }

    pub fn transaction(mut self, td: &TransactionData) -> Self {
        self = self.code(Command::Transaction);
        let mut raw = [0u8; TransactionData::WIRE_SIZE];
        td.encode(&mut raw);
        self.0.extend_from_slice(&raw);
        self
    }

    pub fn reply(mut self, td: &TransactionData) -> Self {
        self = self.code(Command::Reply);
        let mut raw = [0u8; TransactionData::WIRE_SIZE];
        td.encode(&mut raw);
        self.0.extend_from_slice(&raw);
        self
    }

    pub fn enter_looper(self) -> Self {
        self.code(Command::EnterLooper)
    }

    pub fn register_looper(self) -> Self {
        self.code(Command::RegisterLooper)
    }

    pub fn exit_looper(self) -> Self {
        self.code(Command::ExitLooper)
    }

    pub fn free_buffer(mut self, user_ptr: u64) -> Self {
        self = self.code(Command::FreeBuffer);
        self.0.extend_from_slice(&user_ptr.to_ne_bytes());
        self
    }

    fn ref_op(mut self, c: Command, desc: u32) -> Self {
        self = self.code(c);
        self.0.extend_from_slice(&desc.to_ne_bytes());
        self
    }

    pub fn incref(self, desc: u32) -> Self {
        self.ref_op(Command::IncRefs, desc)
    }

    pub fn acquire(self, desc: u32) -> Self {
        self.ref_op(Command::Acquire, desc)
    }

    pub fn release(self, desc: u32) -> Self {
        self.ref_op(Command::Release, desc)
    }

    pub fn decref(self, desc: u32) -> Self {
        self.ref_op(Command::DecRefs, desc)
    }

    fn done_op(mut self, c: Command, ptr: u64, cookie: u64) -> Self {
        self = self.code(c);
        let mut raw = [0u8; PtrCookie::WIRE_SIZE];
        PtrCookie { ptr, cookie }.encode(&mut raw);
        self.0.extend_from_slice(&raw);
        self
    }

    pub fn increfs_done(self, ptr: u64, cookie: u64) -> Self {
        self.done_op(Command::IncRefsDone, ptr, cookie)
    }

    pub fn acquire_done(self, ptr: u64, cookie: u64) -> Self {
        self.done_op(Command::AcquireDone, ptr, cookie)
    }

    fn death_op(mut self, c: Command, handle: u32, cookie: u64) -> Self {
        self = self.code(c);
        let mut raw = [0u8; HandleCookie::WIRE_SIZE];
        HandleCookie { handle, cookie }.encode(&mut raw);
        self.0.extend_from_slice(&raw);
        self
    }

    pub fn request_death(self, handle: u32, cookie: u64) -> Self {
        self.death_op(Command::RequestDeathNotification, handle, cookie)
    }

    pub fn clear_death(self, handle: u32, cookie: u64) -> Self {
        self.death_op(Command::ClearDeathNotification, handle, cookie)
    }

    pub fn dead_node_done(mut self, cookie: u64) -> Self {
        self = self.code(Command::DeadNodeDone);
        self.0.extend_from_slice(&cookie.to_ne_bytes());
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

/// One parsed return record.
#[derive(Debug, Clone, PartialEq)]
pub enum Ret {
    Noop,
    TransactionComplete,
    Transaction(TransactionData),
    Reply(TransactionData),
    DeadReply,
    FailedReply,
    IncRefs(PtrCookie),
    Acquire(PtrCookie),
    Release(PtrCookie),
    DecRefs(PtrCookie),
    SpawnLooper,
    DeadNode(u64),
    ClearDeathNotificationDone(u64),
    Other(ReturnCode),
}

pub fn parse_returns(buf: &[u8]) -> Vec<Ret> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos + 4 <= buf.len() {
        let code = u32::from_ne_bytes(buf[pos..pos + 4].try_into().unwrap());
        pos += 4;
        let code = ReturnCode::from_u32(code).expect("unknown return code");
        let mut take = |n: usize| {
            let raw = &buf[pos..pos + n];
            pos += n;
            raw
        };
        out.push(match code {
            ReturnCode::Noop => Ret::Noop,
            ReturnCode::TransactionComplete => Ret::TransactionComplete,
            ReturnCode::Transaction => Ret::Transaction(TransactionData::decode(take(64))),
            ReturnCode::Reply => Ret::Reply(TransactionData::decode(take(64))),
            ReturnCode::DeadReply => Ret::DeadReply,
            ReturnCode::FailedReply => Ret::FailedReply,
            ReturnCode::IncRefs => Ret::IncRefs(PtrCookie::decode(take(16))),
            ReturnCode::Acquire => Ret::Acquire(PtrCookie::decode(take(16))),
            ReturnCode::Release => Ret::Release(PtrCookie::decode(take(16))),
            ReturnCode::DecRefs => Ret::DecRefs(PtrCookie::decode(take(16))),
            ReturnCode::SpawnLooper => Ret::SpawnLooper,
            ReturnCode::DeadNode => Ret::DeadNode(u64::from_ne_bytes(take(8).try_into().unwrap())),
            ReturnCode::ClearDeathNotificationDone => {
                Ret::ClearDeathNotificationDone(u64::from_ne_bytes(take(8).try_into().unwrap()))
            }
            other => Ret::Other(other),
        });
    }
    out
}

/// Write a command stream, no read.
pub fn send(ep: &Endpoint<TestExternsHandle>, tid: u32, cmds: &Cmds) {
    let mut read: [u8; 0] = [];
    let mut wr = WriteRead::new(cmds.bytes(), &mut read);
    ep.write_read(tid, &mut wr, false).expect("write failed");
    assert_eq!(wr.write_consumed, cmds.bytes().len());
}

/// Blocking read; returns the parsed records.
pub fn recv(ep: &Endpoint<TestExternsHandle>, tid: u32) -> Vec<Ret> {
    let mut read = vec![0u8; 512];
    let mut wr = WriteRead::new(&[], &mut read);
    ep.write_read(tid, &mut wr, false).expect("read failed");
    let n = wr.read_consumed;
    parse_returns(&read[..n])
}

/// Non-blocking read.
pub fn try_recv(ep: &Endpoint<TestExternsHandle>, tid: u32) -> Result<Vec<Ret>, Error> {
    let mut read = vec![0u8; 512];
    let mut wr = WriteRead::new(&[], &mut read);
    ep.write_read(tid, &mut wr, true)?;
    let n = wr.read_consumed;
    Ok(parse_returns(&read[..n]))
}

/// Write and read in a single call.
pub fn roundtrip(ep: &Endpoint<TestExternsHandle>, tid: u32, cmds: &Cmds) -> Vec<Ret> {
    let mut read = vec![0u8; 512];
    let mut wr = WriteRead::new(cmds.bytes(), &mut read);
    ep.write_read(tid, &mut wr, false).expect("write_read failed");
    assert_eq!(wr.write_consumed, cmds.bytes().len());
    let n = wr.read_consumed;
    parse_returns(&read[..n])
}

/// A call descriptor pointing at payload staged in the sender's memory.
pub fn call(target: u64, code: u32, flags: TransactionFlags, data_ptr: u64, data_size: u64) -> TransactionData {
    TransactionData {
        target,
        cookie: 0,
        code,
        flags: flags.bits(),
        sender_pid: 0,
        sender_euid: 0,
        data_size,
        offsets_size: 0,
        data_ptr,
        offsets_ptr: 0,
    }
}

/// Same, with an offsets array for embedded objects.
pub fn call_with_objects(
    target: u64,
    code: u32,
    flags: TransactionFlags,
    data_ptr: u64,
    data_size: u64,
    offsets_ptr: u64,
    offsets_size: u64,
) -> TransactionData {
    TransactionData {
        offsets_size,
        offsets_ptr,
        ..call(target, code, flags, data_ptr, data_size)
    }
}

/// Encode a flattened object for embedding in a payload.
pub fn flat(kind: ObjectKind, flags: u32, payload: u64, cookie: u64) -> [u8; FlatObject::WIRE_SIZE] {
    let mut raw = [0u8; FlatObject::WIRE_SIZE];
    FlatObject {
        kind: kind as u32,
        flags,
        payload,
        cookie,
    }
    .encode(&mut raw);
    raw
}

/// Offsets array encoding.
pub fn offsets(offs: &[u64]) -> Vec<u8> {
    offs.iter().flat_map(|o| o.to_ne_bytes()).collect()
}
