// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Per-process transfer-buffer arena.
//!
//! A contiguous virtual region, carved into an address-ordered sequence of
//! blocks. Free blocks are indexed by size for best-fit allocation,
//! allocated blocks by address for reverse lookup from a user pointer.
//! Physical pages back the region lazily and are dropped again once they
//! fall wholly inside a free block. Half the region is reserved for
//! synchronous traffic: one-way allocations draw from a separate quota.
//!
//! The broker sees block addresses as offsets from the region base; the
//! owning process sees the same bytes at `offset + user_offset` through its
//! read-only mapping.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::anyhow;
use relay_shared::ptr_align;

use crate::{NodeId, TransactionId};

pub(crate) const PAGE_SIZE: u64 = 4096;

/// Accounting size of the per-block header carved out of the region ahead
/// of each block's payload.
pub(crate) const BUFFER_HEADER_SIZE: u64 = 32;

/// Arenas are capped at 4 MiB regardless of what the client maps.
pub const MAX_ARENA_SIZE: u64 = 4 * 1024 * 1024;

const fn page_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

const fn page_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Why an allocation failed.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AllocError {
    #[error("invalid allocation size {data_size}+{offsets_size}")]
    Invalid { data_size: u64, offsets_size: u64 },
    #[error("no address space for {0} bytes")]
    NoSpace(u64),
    #[error("async reserve exhausted, {0} bytes requested")]
    NoAsyncSpace(u64),
}

/// One block of the arena. Allocated blocks carry the delivery metadata the
/// transaction engine needs when the receiver later frees them.
#[derive(Debug)]
pub(crate) struct Buffer {
    start: u64,
    free: bool,
    pub(crate) data_size: u64,
    pub(crate) offsets_size: u64,
    pub(crate) is_async: bool,
    pub(crate) allow_user_free: bool,
    pub(crate) debug_id: u64,
    pub(crate) transaction: Option<TransactionId>,
    pub(crate) target_node: Option<NodeId>,
}

impl Buffer {
    fn new_free(start: u64) -> Self {
        Self {
            start,
            free: true,
            data_size: 0,
            offsets_size: 0,
            is_async: false,
            allow_user_free: false,
            debug_id: 0,
            transaction: None,
            target_node: None,
        }
    }

    /// Address of the first payload byte.
    pub(crate) fn data(&self) -> u64 {
        self.start + BUFFER_HEADER_SIZE
    }

    /// Address of the offsets array (payload rounded up to pointer
    /// alignment).
    pub(crate) fn offsets(&self) -> u64 {
        self.data() + ptr_align(self.data_size)
    }

    /// Bytes charged against the arena for this allocation.
    fn payload_extent(&self) -> u64 {
        ptr_align(self.data_size) + ptr_align(self.offsets_size)
    }
}

#[derive(Debug)]
pub(crate) struct Arena {
    size: u64,
    user_offset: u64,
    pages: Vec<Option<Box<[u8; PAGE_SIZE as usize]>>>,
    /// Every block, free and allocated, keyed by block start address.
    blocks: BTreeMap<u64, Buffer>,
    /// Free blocks keyed by (capacity, start) for best-fit search.
    free_by_size: BTreeSet<(u64, u64)>,
    free_async_space: u64,
}

impl Arena {
    /// `size` must be page-aligned and at least one page; the caller clamps
    /// to [`MAX_ARENA_SIZE`].
    pub(crate) fn new(size: u64, user_offset: u64) -> Self {
        debug_assert!(size >= PAGE_SIZE && size % PAGE_SIZE == 0);
        let mut blocks = BTreeMap::new();
        blocks.insert(0, Buffer::new_free(0));
        let mut free_by_size = BTreeSet::new();
        free_by_size.insert((size - BUFFER_HEADER_SIZE, 0));
        Self {
            size,
            user_offset,
            pages: vec![None; (size / PAGE_SIZE) as usize],
            blocks,
            free_by_size,
            free_async_space: size / 2,
        }
    }

    pub(crate) fn user_offset(&self) -> u64 {
        self.user_offset
    }

    pub(crate) fn free_async_space(&self) -> u64 {
        self.free_async_space
    }

    /// Payload capacity of the block at `start`: the gap between its data
    /// address and the next block (or the region end).
    fn capacity(&self, start: u64) -> u64 {
        let next = self
            .blocks
            .range(start + 1..)
            .next()
            .map(|(s, _)| *s)
            .unwrap_or(self.size);
        next - (start + BUFFER_HEADER_SIZE)
    }

    pub(crate) fn get(&self, start: u64) -> Option<&Buffer> {
        self.blocks.get(&start).filter(|b| !b.free)
    }

    pub(crate) fn get_mut(&mut self, start: u64) -> Option<&mut Buffer> {
        self.blocks.get_mut(&start).filter(|b| !b.free)
    }

    /// Reverse lookup: a user pointer previously handed out in a delivery
    /// back to the allocated block it names. Only exact data addresses
    /// match.
    pub(crate) fn from_user(&self, user_ptr: u64) -> Option<u64> {
        let start = user_ptr
            .checked_sub(self.user_offset)?
            .checked_sub(BUFFER_HEADER_SIZE)?;
        self.get(start).map(|b| b.start)
    }

    /// The address at which the owning process sees `addr`.
    pub(crate) fn user_addr(&self, addr: u64) -> u64 {
        addr + self.user_offset
    }

    /// Best-fit allocation of `data_size` payload plus `offsets_size`
    /// offset bytes. Returns the block start address.
    pub(crate) fn alloc(
        &mut self,
        data_size: u64,
        offsets_size: u64,
        is_async: bool,
        debug_id: u64,
    ) -> Result<u64, AllocError> {
        let size = ptr_align(data_size)
            .checked_add(ptr_align(offsets_size))
            .filter(|s| *s >= data_size && *s >= offsets_size)
            .ok_or(AllocError::Invalid {
                data_size,
                offsets_size,
            })?;

        if is_async && self.free_async_space < size + BUFFER_HEADER_SIZE {
            log::debug!("arena: no async space left for {} bytes", size);
            return Err(AllocError::NoAsyncSpace(size));
        }

        let (cap, start) = self
            .free_by_size
            .range((size, 0)..)
            .next()
            .copied()
            .ok_or(AllocError::NoSpace(size))?;
        self.free_by_size.remove(&(cap, start));

        // Split unless the remainder is too small to hold a header plus a
        // minimal payload.
        if cap != size && size + BUFFER_HEADER_SIZE + 4 < cap {
            let tail_start = start + BUFFER_HEADER_SIZE + size;
            let tail_cap = cap - size - BUFFER_HEADER_SIZE;
            self.blocks.insert(tail_start, Buffer::new_free(tail_start));
            self.free_by_size.insert((tail_cap, tail_start));
        }

        let data = start + BUFFER_HEADER_SIZE;
        self.back_range(page_down(data), page_up(data + size));

        let buf = self.blocks.get_mut(&start).unwrap();
        buf.free = false;
        buf.data_size = data_size;
        buf.offsets_size = offsets_size;
        buf.is_async = is_async;
        buf.allow_user_free = false;
        buf.debug_id = debug_id;
        buf.transaction = None;
        buf.target_node = None;

        if is_async {
            self.free_async_space -= size + BUFFER_HEADER_SIZE;
            log::trace!(
                "arena: async alloc {} bytes, reserve now {}",
                size,
                self.free_async_space
            );
        }
        Ok(start)
    }

    /// Return the block at `start` to the free list, coalescing with free
    /// neighbors and dropping pages that no longer back any allocation.
    pub(crate) fn free(&mut self, start: u64) {
        let buf = self.blocks.get_mut(&start).expect("freeing unknown buffer");
        assert!(!buf.free, "double free of arena buffer");
        let extent = buf.payload_extent();
        if buf.is_async {
            self.free_async_space += extent + BUFFER_HEADER_SIZE;
            log::trace!(
                "arena: async free {} bytes, reserve now {}",
                extent,
                self.free_async_space
            );
        }
        *buf = Buffer::new_free(start);

        // Coalesce forward, then backward.
        if let Some((&next_start, next)) = self.blocks.range(start + 1..).next() {
            if next.free {
                let next_cap = self.capacity(next_start);
                self.free_by_size.remove(&(next_cap, next_start));
                self.blocks.remove(&next_start);
            }
        }
        let mut merged_start = start;
        if let Some((&prev_start, prev)) = self.blocks.range(..start).next_back() {
            if prev.free {
                let prev_cap = self.capacity(prev_start);
                self.free_by_size.remove(&(prev_cap, prev_start));
                self.blocks.remove(&start);
                merged_start = prev_start;
            }
        }
        let cap = self.capacity(merged_start);
        self.free_by_size.insert((cap, merged_start));

        // Pages wholly inside the merged free block back nothing anymore.
        let end = merged_start + BUFFER_HEADER_SIZE + cap;
        self.release_range(page_up(merged_start), page_down(end));
    }

    fn back_range(&mut self, from: u64, to: u64) {
        let mut addr = from;
        while addr < to {
            let idx = (addr / PAGE_SIZE) as usize;
            if self.pages[idx].is_none() {
                self.pages[idx] = Some(Box::new([0u8; PAGE_SIZE as usize]));
            }
            addr += PAGE_SIZE;
        }
    }

    fn release_range(&mut self, from: u64, to: u64) {
        let mut addr = from;
        while addr < to {
            self.pages[(addr / PAGE_SIZE) as usize] = None;
            addr += PAGE_SIZE;
        }
    }

    /// Copy bytes out of the region. Fails on unbacked pages, which a
    /// correctly delivered buffer never touches.
    pub(crate) fn read(&self, addr: u64, dst: &mut [u8]) -> anyhow::Result<()> {
        if addr.checked_add(dst.len() as u64).map_or(true, |e| e > self.size) {
            return Err(anyhow!("arena read out of range: {:#x}", addr));
        }
        let mut pos = 0usize;
        while pos < dst.len() {
            let at = addr + pos as u64;
            let page = self.pages[(at / PAGE_SIZE) as usize]
                .as_ref()
                .ok_or_else(|| anyhow!("arena read from unbacked page at {:#x}", at))?;
            let off = (at % PAGE_SIZE) as usize;
            let n = (PAGE_SIZE as usize - off).min(dst.len() - pos);
            dst[pos..pos + n].copy_from_slice(&page[off..off + n]);
            pos += n;
        }
        Ok(())
    }

    /// Copy bytes into the region (broker side only).
    pub(crate) fn write(&mut self, addr: u64, src: &[u8]) -> anyhow::Result<()> {
        if addr.checked_add(src.len() as u64).map_or(true, |e| e > self.size) {
            return Err(anyhow!("arena write out of range: {:#x}", addr));
        }
        let mut pos = 0usize;
        while pos < src.len() {
            let at = addr + pos as u64;
            let page = self.pages[(at / PAGE_SIZE) as usize]
                .as_mut()
                .ok_or_else(|| anyhow!("arena write to unbacked page at {:#x}", at))?;
            let off = (at % PAGE_SIZE) as usize;
            let n = (PAGE_SIZE as usize - off).min(src.len() - pos);
            page[off..off + n].copy_from_slice(&src[pos..pos + n]);
            pos += n;
        }
        Ok(())
    }

    /// Start addresses of every allocated block.
    pub(crate) fn allocated(&self) -> Vec<u64> {
        self.blocks
            .iter()
            .filter(|(_, b)| !b.free)
            .map(|(s, _)| *s)
            .collect()
    }

    #[cfg(test)]
    fn backed_page_count(&self) -> usize {
        self.pages.iter().filter(|p| p.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use quickcheck::{Arbitrary, Gen};

    use super::*;

    const SZ: u64 = 64 * PAGE_SIZE;

    fn arena() -> Arena {
        Arena::new(SZ, 0x1000_0000)
    }

    /// The union of free and allocated blocks tiles the region exactly,
    /// the size index matches the free blocks, and no two free blocks
    /// are adjacent.
    fn check_partition(a: &Arena) {
        let mut expected_next = 0u64;
        let mut prev_free = false;
        let mut free_index = BTreeSet::new();
        for (&start, buf) in &a.blocks {
            assert_eq!(start, expected_next, "gap or overlap at {:#x}", start);
            let cap = a.capacity(start);
            expected_next = start + BUFFER_HEADER_SIZE + cap;
            if buf.free {
                assert!(!prev_free, "uncoalesced free neighbors at {:#x}", start);
                free_index.insert((cap, start));
            }
            prev_free = buf.free;
        }
        assert_eq!(expected_next, a.size);
        assert_eq!(free_index, a.free_by_size);
    }

    #[test]
    fn alloc_free_restores_shape() {
        let mut a = arena();
        let before: Vec<_> = a.free_by_size.iter().copied().collect();
        let b = a.alloc(100, 16, false, 1).unwrap();
        check_partition(&a);
        a.free(b);
        check_partition(&a);
        let after: Vec<_> = a.free_by_size.iter().copied().collect();
        assert_eq!(before, after);
        assert_eq!(a.free_async_space(), SZ / 2);
    }

    #[test]
    fn sizes_are_pointer_aligned() {
        let mut a = arena();
        let b = a.alloc(5, 0, false, 1).unwrap();
        let buf = a.get(b).unwrap();
        assert_eq!(buf.data_size, 5);
        assert_eq!(buf.payload_extent(), 8);
        assert_eq!(buf.offsets(), buf.data() + 8);
    }

    #[test]
    fn small_remainder_is_absorbed() {
        let mut a = arena();
        // Leave a tail too small to hold a header plus minimal payload.
        let first = a.alloc(SZ - 2 * BUFFER_HEADER_SIZE, 0, false, 1).unwrap();
        check_partition(&a);
        assert_eq!(a.blocks.len(), 1, "remainder should have been absorbed");
        a.free(first);
        check_partition(&a);
    }

    #[test]
    fn coalesces_in_both_directions() {
        let mut a = arena();
        let b1 = a.alloc(PAGE_SIZE, 0, false, 1).unwrap();
        let b2 = a.alloc(PAGE_SIZE, 0, false, 2).unwrap();
        let b3 = a.alloc(PAGE_SIZE, 0, false, 3).unwrap();
        check_partition(&a);
        a.free(b1);
        a.free(b3);
        check_partition(&a);
        // Freeing the middle block merges all three with the trailing
        // free space.
        a.free(b2);
        check_partition(&a);
        assert_eq!(a.blocks.len(), 1);
    }

    #[test]
    fn async_quota_is_half_the_region() {
        let mut a = arena();
        assert_eq!(a.free_async_space(), SZ / 2);
        let req = SZ / 4;
        let b1 = a.alloc(req, 0, true, 1).unwrap();
        match a.alloc(req, 0, true, 2) {
            Err(AllocError::NoAsyncSpace(_)) => {}
            other => panic!("expected async exhaustion, got {:?}", other),
        }
        // Synchronous traffic is unaffected by the quota.
        let b2 = a.alloc(req, 0, false, 3).unwrap();
        a.free(b1);
        assert_eq!(a.free_async_space(), SZ / 2);
        a.free(b2);
        check_partition(&a);
    }

    #[test]
    fn reverse_lookup_is_exact() {
        let mut a = arena();
        let b = a.alloc(64, 8, false, 1).unwrap();
        let user = a.user_addr(a.get(b).unwrap().data());
        assert_eq!(a.from_user(user), Some(b));
        assert_eq!(a.from_user(user + 8), None);
        assert_eq!(a.from_user(0), None);
    }

    #[test]
    fn pages_are_lazy_and_released() {
        let mut a = arena();
        assert_eq!(a.backed_page_count(), 0);
        let b = a.alloc(3 * PAGE_SIZE, 0, false, 1).unwrap();
        assert!(a.backed_page_count() >= 3);
        let data = a.get(b).unwrap().data();
        a.write(data, &[0xAB; 16]).unwrap();
        let mut out = [0u8; 16];
        a.read(data, &mut out).unwrap();
        assert_eq!(out, [0xAB; 16]);
        a.free(b);
        assert_eq!(a.backed_page_count(), 0);
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Alloc { data: u16, offsets: u8, is_async: bool },
        Free { slot: u8 },
    }

    impl Arbitrary for Op {
        fn arbitrary(g: &mut Gen) -> Self {
            if bool::arbitrary(g) {
                Op::Alloc {
                    data: u16::arbitrary(g),
                    offsets: u8::arbitrary(g),
                    is_async: bool::arbitrary(g),
                }
            } else {
                Op::Free {
                    slot: u8::arbitrary(g),
                }
            }
        }
    }

    quickcheck::quickcheck! {
        fn partition_holds_under_random_traffic(ops: Vec<Op>) -> bool {
            let mut a = arena();
            let mut live: Vec<u64> = Vec::new();
            let mut async_outstanding = 0u64;
            for op in ops {
                match op {
                    Op::Alloc { data, offsets, is_async } => {
                        let offsets = u64::from(offsets) * 8;
                        if let Ok(b) = a.alloc(u64::from(data), offsets, is_async, 0) {
                            if is_async {
                                async_outstanding +=
                                    a.get(b).unwrap().payload_extent() + BUFFER_HEADER_SIZE;
                            }
                            live.push(b);
                        }
                    }
                    Op::Free { slot } => {
                        if !live.is_empty() {
                            let b = live.swap_remove(slot as usize % live.len());
                            if a.get(b).unwrap().is_async {
                                async_outstanding -=
                                    a.get(b).unwrap().payload_extent() + BUFFER_HEADER_SIZE;
                            }
                            a.free(b);
                        }
                    }
                }
                check_partition(&a);
                assert!(async_outstanding <= SZ / 2);
                assert_eq!(a.free_async_space(), SZ / 2 - async_outstanding);
            }
            for b in live {
                a.free(b);
            }
            check_partition(&a);
            a.blocks.len() == 1 && a.free_async_space() == SZ / 2
        }
    }
}
