//! Ring-provided receive buffer pool (IORING_REGISTER_PBUF_RING).
//!
//! One allocation holds the ring entries followed by the backing buffers.
//! The kernel picks a buffer for each buffer-select recv and reports its id
//! in the CQE flags; the worker borrows that buffer, consumes it, and hands
//! it back by re-adding it to the ring and advancing the tail.

use std::io;
use std::ops::Deref;
use std::sync::atomic::{AtomicU16, Ordering};

use io_uring::types;

use crate::reactor::Shared;

pub(crate) struct BufRing {
    /// Page-aligned memory: [BufRingEntry; ring_entries] then buffer data.
    memory: *mut u8,
    memory_layout: std::alloc::Layout,
    buffer_size: usize,
    ring_entries: u16,
    /// Pointer to the shared tail within the ring entry area.
    tail: *const AtomicU16,
    /// Local tail, committed to the kernel on return.
    local_tail: u16,
    mask: u16,
    /// Which buffers are currently lent out to sessions.
    borrowed: Vec<bool>,
    outstanding: usize,
}

impl BufRing {
    /// Allocate a ring with `ring_entries` buffers of `buffer_size` bytes.
    /// `ring_entries` must be a power of two.
    pub fn new(ring_entries: u16, buffer_size: usize) -> io::Result<Self> {
        assert!(ring_entries.is_power_of_two());

        let ring_size = ring_entries as usize * std::mem::size_of::<types::BufRingEntry>();
        let total_size = ring_size + ring_entries as usize * buffer_size;

        let page_size = 4096;
        let layout = std::alloc::Layout::from_size_align(total_size, page_size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid layout"))?;

        let memory = unsafe { std::alloc::alloc_zeroed(layout) };
        if memory.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "allocation failed",
            ));
        }

        let tail = unsafe {
            types::BufRingEntry::tail(memory as *const types::BufRingEntry) as *const AtomicU16
        };

        let mut ring = Self {
            memory,
            memory_layout: layout,
            buffer_size,
            ring_entries,
            tail,
            local_tail: 0,
            mask: ring_entries - 1,
            borrowed: vec![false; ring_entries as usize],
            outstanding: 0,
        };

        // Hand every buffer to the kernel up front.
        for bid in 0..ring_entries {
            ring.add_buffer(bid);
        }
        ring.commit();

        Ok(ring)
    }

    /// Ring base address for registration.
    pub fn ring_addr(&self) -> u64 {
        self.memory as u64
    }

    pub fn entries(&self) -> u16 {
        self.ring_entries
    }

    fn buffer_base(&self) -> *mut u8 {
        let ring_size = self.ring_entries as usize * std::mem::size_of::<types::BufRingEntry>();
        unsafe { self.memory.add(ring_size) }
    }

    fn buffer_ptr(&self, bid: u16) -> *const u8 {
        unsafe { self.buffer_base().add(bid as usize * self.buffer_size) }
    }

    /// Mark a buffer as lent out after a recv completion delivered it.
    /// Returns the buffer address; `len` is the byte count from the CQE.
    pub fn borrow(&mut self, bid: u16, len: usize) -> (*const u8, usize) {
        debug_assert!(!self.borrowed[bid as usize], "buffer {bid} borrowed twice");
        debug_assert!(len <= self.buffer_size);
        self.borrowed[bid as usize] = true;
        self.outstanding += 1;
        (self.buffer_ptr(bid), len)
    }

    /// Return a borrowed buffer to the kernel ring.
    pub fn recycle(&mut self, bid: u16) {
        debug_assert!(
            self.borrowed[bid as usize],
            "buffer {bid} returned without borrow"
        );
        self.borrowed[bid as usize] = false;
        self.outstanding -= 1;
        self.add_buffer(bid);
        self.commit();
    }

    /// Return a buffer that was selected by the kernel but never borrowed
    /// (completion for a detached recv).
    pub fn restore(&mut self, bid: u16) {
        debug_assert!(!self.borrowed[bid as usize]);
        self.add_buffer(bid);
        self.commit();
    }

    /// Buffers currently lent out.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    fn add_buffer(&mut self, bid: u16) {
        let idx = (self.local_tail & self.mask) as usize;
        let entry = unsafe { &mut *(self.memory as *mut types::BufRingEntry).add(idx) };

        entry.set_addr(self.buffer_ptr(bid) as u64);
        entry.set_len(self.buffer_size as u32);
        entry.set_bid(bid);

        self.local_tail = self.local_tail.wrapping_add(1);
    }

    fn commit(&self) {
        // Release ordering so the kernel sees the entry contents.
        unsafe {
            (*self.tail).store(self.local_tail, Ordering::Release);
        }
    }
}

impl Drop for BufRing {
    fn drop(&mut self) {
        unsafe {
            std::alloc::dealloc(self.memory, self.memory_layout);
        }
    }
}

// Safety: the ring is owned by exactly one worker; the atomic tail is the
// only concurrently accessed field and is shared with the kernel, not with
// other threads.
unsafe impl Send for BufRing {}

/// A receive buffer lent out by the kernel for exactly one completion.
///
/// Dereferences to the received bytes. Dropping the grant returns the buffer
/// to the kernel ring, so the 1:1 borrow/return discipline holds by
/// construction. The grant must be dropped before the owning session
/// suspends on its next recv.
pub struct BufferGrant {
    shared: Shared,
    bid: u16,
    ptr: *const u8,
    len: usize,
}

impl BufferGrant {
    pub(crate) fn new(shared: Shared, bid: u16, ptr: *const u8, len: usize) -> Self {
        BufferGrant {
            shared,
            bid,
            ptr,
            len,
        }
    }

    /// Kernel buffer id this grant covers.
    pub fn id(&self) -> u16 {
        self.bid
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for BufferGrant {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // Safety: the backing buffer is stable heap memory owned by the
        // worker's BufRing and is not re-added to the kernel ring until this
        // grant drops.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for BufferGrant {
    fn drop(&mut self) {
        self.shared.borrow_mut().buf_ring.recycle(self.bid);
    }
}
