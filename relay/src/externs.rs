// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Services the embedder must supply to the broker.
//!
//! The broker itself never touches a client address space or a descriptor
//! table; both live behind this trait so the crate stays portable and the
//! tests can run against plain in-memory fakes.

/// Environmental primitives provided by the embedding system.
pub trait Externs: Send + Sync + 'static {
    /// Copy `dst.len()` bytes from `addr` in the client `pid`'s address
    /// space into `dst`.
    fn copy_user(&self, pid: u32, addr: u64, dst: &mut [u8]) -> anyhow::Result<()>;

    /// Duplicate the open descriptor `fd` of `from_pid` into `to_pid`'s
    /// descriptor table with close-on-exec set, returning the new
    /// descriptor.
    fn dup_fd(&self, from_pid: u32, fd: u32, to_pid: u32) -> anyhow::Result<u32>;

    /// Close a descriptor previously installed with [`Externs::dup_fd`].
    fn close_fd(&self, pid: u32, fd: u32);

    /// Drop the broker's hold on `pid`'s descriptor table. Runs once from
    /// the deferred-work thread during endpoint teardown.
    fn put_files(&self, _pid: u32) {}
}
