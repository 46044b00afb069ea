// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Carrier structs exchanged between clients and the broker inside the
//! `write_read` command and return streams.
//!
//! Streams are sequences of `(u32 code, payload)` records in native endian
//! with no inter-record padding; the structs here know their own wire size
//! and encode/decode themselves field by field. The broker also rewrites
//! [`FlatObject`] headers in place inside delivered payloads, so the layout
//! is part of the protocol, not an implementation detail.

use num_derive::FromPrimitive;
use thiserror::Error;

/// A stream ended in the middle of a record.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("truncated record at offset {0}")]
pub struct Truncated(pub usize);

bitflags::bitflags! {
    /// Flags carried in a transaction descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransactionFlags: u32 {
        /// One-way call: no reply, no sender blocking.
        const ONE_WAY = 0x01;
        /// Contents are the component's root object.
        const ROOT_OBJECT = 0x04;
        /// Contents are a 32-bit status code.
        const STATUS_CODE = 0x08;
        /// The sender is willing to receive file descriptors in the reply.
        const ACCEPT_FDS = 0x10;
    }
}

bitflags::bitflags! {
    /// Flags carried in a flattened object header. The low byte is not a
    /// flag set but the minimum scheduling priority of the node being
    /// published; mask with [`FLAT_PRIORITY_MASK`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectFlags: u32 {
        /// The published node accepts file descriptors in calls.
        const ACCEPTS_FDS = 0x100;
    }
}

/// Mask for the minimum-priority floor embedded in a flattened object's
/// flag word.
pub const FLAT_PRIORITY_MASK: u32 = 0xff;

/// Discriminates the union arm of a [`FlatObject`].
#[repr(u32)]
#[derive(PartialEq, Eq, Debug, Clone, Copy, FromPrimitive)]
pub enum ObjectKind {
    /// A strong local node, named by owner pointer + cookie.
    Node = 1,
    /// A weak local node.
    WeakNode = 2,
    /// A strong remote reference, named by descriptor.
    Handle = 3,
    /// A weak remote reference.
    WeakHandle = 4,
    /// A file descriptor.
    Fd = 5,
}

impl ObjectKind {
    pub fn is_strong(self) -> bool {
        matches!(self, ObjectKind::Node | ObjectKind::Handle)
    }
}

/// An object embedded in a transaction payload at one of the offsets. The
/// broker rewrites `kind` and `payload` as the object crosses a process
/// boundary; `cookie` travels with node forms and is zero for the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatObject {
    pub kind: u32,
    pub flags: u32,
    /// Owner pointer (node forms), descriptor (handle forms), or file
    /// descriptor (fd form).
    pub payload: u64,
    pub cookie: u64,
}

impl FlatObject {
    pub const WIRE_SIZE: usize = 24;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.kind.to_ne_bytes());
        out[4..8].copy_from_slice(&self.flags.to_ne_bytes());
        out[8..16].copy_from_slice(&self.payload.to_ne_bytes());
        out[16..24].copy_from_slice(&self.cookie.to_ne_bytes());
    }

    pub fn decode(raw: &[u8]) -> Self {
        Self {
            kind: u32::from_ne_bytes(raw[0..4].try_into().unwrap()),
            flags: u32::from_ne_bytes(raw[4..8].try_into().unwrap()),
            payload: u64::from_ne_bytes(raw[8..16].try_into().unwrap()),
            cookie: u64::from_ne_bytes(raw[16..24].try_into().unwrap()),
        }
    }

    pub fn min_priority(&self) -> i32 {
        (self.flags & FLAT_PRIORITY_MASK) as i32
    }

    pub fn accepts_fds(&self) -> bool {
        ObjectFlags::from_bits_retain(self.flags).contains(ObjectFlags::ACCEPTS_FDS)
    }
}

/// The descriptor of a single call or reply.
///
/// Inbound (command stream), `data_ptr`/`offsets_ptr` point into the
/// sender's address space. Outbound (return stream), they are rewritten to
/// the receiver's read-only view of its arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionData {
    /// Target descriptor for calls; opaque owner pointer on delivery.
    pub target: u64,
    pub cookie: u64,
    /// Method selector, meaningful only to the two endpoints.
    pub code: u32,
    pub flags: u32,
    pub sender_pid: i32,
    pub sender_euid: u32,
    pub data_size: u64,
    pub offsets_size: u64,
    pub data_ptr: u64,
    pub offsets_ptr: u64,
}

impl TransactionData {
    pub const WIRE_SIZE: usize = 64;

    pub fn flags(&self) -> TransactionFlags {
        TransactionFlags::from_bits_retain(self.flags)
    }

    pub fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.target.to_ne_bytes());
        out[8..16].copy_from_slice(&self.cookie.to_ne_bytes());
        out[16..20].copy_from_slice(&self.code.to_ne_bytes());
        out[20..24].copy_from_slice(&self.flags.to_ne_bytes());
        out[24..28].copy_from_slice(&self.sender_pid.to_ne_bytes());
        out[28..32].copy_from_slice(&self.sender_euid.to_ne_bytes());
        out[32..40].copy_from_slice(&self.data_size.to_ne_bytes());
        out[40..48].copy_from_slice(&self.offsets_size.to_ne_bytes());
        out[48..56].copy_from_slice(&self.data_ptr.to_ne_bytes());
        out[56..64].copy_from_slice(&self.offsets_ptr.to_ne_bytes());
    }

    pub fn decode(raw: &[u8]) -> Self {
        Self {
            target: u64::from_ne_bytes(raw[0..8].try_into().unwrap()),
            cookie: u64::from_ne_bytes(raw[8..16].try_into().unwrap()),
            code: u32::from_ne_bytes(raw[16..20].try_into().unwrap()),
            flags: u32::from_ne_bytes(raw[20..24].try_into().unwrap()),
            sender_pid: i32::from_ne_bytes(raw[24..28].try_into().unwrap()),
            sender_euid: u32::from_ne_bytes(raw[28..32].try_into().unwrap()),
            data_size: u64::from_ne_bytes(raw[32..40].try_into().unwrap()),
            offsets_size: u64::from_ne_bytes(raw[40..48].try_into().unwrap()),
            data_ptr: u64::from_ne_bytes(raw[48..56].try_into().unwrap()),
            offsets_ptr: u64::from_ne_bytes(raw[56..64].try_into().unwrap()),
        }
    }
}

/// Owner pointer + cookie pair (refcount returns and their acks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtrCookie {
    pub ptr: u64,
    pub cookie: u64,
}

impl PtrCookie {
    pub const WIRE_SIZE: usize = 16;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.ptr.to_ne_bytes());
        out[8..16].copy_from_slice(&self.cookie.to_ne_bytes());
    }

    pub fn decode(raw: &[u8]) -> Self {
        Self {
            ptr: u64::from_ne_bytes(raw[0..8].try_into().unwrap()),
            cookie: u64::from_ne_bytes(raw[8..16].try_into().unwrap()),
        }
    }
}

/// Descriptor + cookie pair (death subscription commands).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleCookie {
    pub handle: u32,
    pub cookie: u64,
}

impl HandleCookie {
    pub const WIRE_SIZE: usize = 12;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.handle.to_ne_bytes());
        out[4..12].copy_from_slice(&self.cookie.to_ne_bytes());
    }

    pub fn decode(raw: &[u8]) -> Self {
        Self {
            handle: u32::from_ne_bytes(raw[0..4].try_into().unwrap()),
            cookie: u64::from_ne_bytes(raw[4..12].try_into().unwrap()),
        }
    }
}

/// Cursor over an inbound record stream.
pub struct StreamReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> StreamReader<'a> {
    pub fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn get_u32(&mut self) -> Result<u32, Truncated> {
        let raw = self.get_bytes(4)?;
        Ok(u32::from_ne_bytes(raw.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64, Truncated> {
        let raw = self.get_bytes(8)?;
        Ok(u64::from_ne_bytes(raw.try_into().unwrap()))
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], Truncated> {
        if self.buf.len() - self.pos < n {
            return Err(Truncated(self.pos));
        }
        let raw = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(raw)
    }
}

/// Cursor over an outbound record stream. Writes either fit entirely or
/// leave the buffer untouched, so a full read buffer never holds a torn
/// record.
pub struct StreamWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> StreamWriter<'a> {
    pub fn new(buf: &'a mut [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[must_use]
    pub fn put_u32(&mut self, v: u32) -> bool {
        self.put_bytes(&v.to_ne_bytes())
    }

    #[must_use]
    pub fn put_u64(&mut self, v: u64) -> bool {
        self.put_bytes(&v.to_ne_bytes())
    }

    #[must_use]
    pub fn put_bytes(&mut self, raw: &[u8]) -> bool {
        if self.remaining() < raw.len() {
            return false;
        }
        self.buf[self.pos..self.pos + raw.len()].copy_from_slice(raw);
        self.pos += raw.len();
        true
    }
}
