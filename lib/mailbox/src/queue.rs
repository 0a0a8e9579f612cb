// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Single-producer/single-consumer byte queue over shared, non-coherent
//! memory.
//!
//! The queue structure itself (header + data) lives in memory shared with
//! the host and is laid out by [`npu_abi::QueueHeader`]. This module wraps
//! that raw memory in wraparound-safe read/write primitives.
//!
//! Each side of a queue owns exactly one cursor: the consumer advances
//! `read`, the producer advances `write`. Because the two processors do not
//! share a coherent cache domain, every cursor update is paired with an
//! explicit cache operation: the writer cleans (publishes) after updating its
//! cursor, and the reader invalidates (reloads) the other side's cursor
//! before trusting it. Payload bytes get the same treatment. These pairs are
//! the queue's only ordering mechanism; removing one is a correctness bug,
//! not a performance tweak.
//!
//! `capacity` must be a power of two so cursor arithmetic can be mask-based,
//! and the queue deliberately never fills the last byte: `read == write`
//! must always mean "empty".

use crate::hal::Hal;
use npu_abi::QueueHeader;

/// Handle to one queue in shared memory.
///
/// This is a raw view: it does not own the memory, and the host mutates the
/// far cursor concurrently. All cursor accesses are volatile.
pub struct Queue {
    header: *mut QueueHeader,
    data: *mut u8,
    capacity: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum QueueError {
    /// The queue's capacity field is zero or not a power of two.
    BadCapacity,
    /// A read asked for more bytes than are available right now.
    NotEnoughData,
    /// A write would overflow the space available right now. The caller may
    /// retry after the host drains the queue.
    Full,
}

impl Queue {
    /// Wraps the queue structure at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to a live `QueueHeader` followed by `capacity`
    /// bytes of data, and nothing else on this processor may alias the
    /// queue's firmware-owned cursor.
    pub unsafe fn from_raw(base: *mut u8) -> Result<Self, QueueError> {
        let header = base.cast::<QueueHeader>();
        let capacity =
            unsafe { core::ptr::addr_of!((*header).capacity).read_volatile() };
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(QueueError::BadCapacity);
        }
        Ok(Self {
            header,
            data: unsafe { base.add(npu_abi::QUEUE_HEADER_SIZE) },
            capacity,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn mask(&self) -> u32 {
        self.capacity - 1
    }

    fn read_cursor(&self) -> u32 {
        unsafe { core::ptr::addr_of!((*self.header).read).read_volatile() }
    }

    fn write_cursor(&self) -> u32 {
        unsafe { core::ptr::addr_of!((*self.header).write).read_volatile() }
    }

    /// Bytes available to read right now.
    pub fn size(&self) -> u32 {
        self.write_cursor().wrapping_sub(self.read_cursor()) & self.mask()
    }

    /// Bytes that can be written right now. One byte short of capacity so
    /// that a full queue never looks empty.
    pub fn free_space(&self) -> u32 {
        self.capacity - self.size() - 1
    }

    /// Whether `total` bytes could fit in this queue at all, even with the
    /// queue completely drained. Lets a writer fail fast instead of retrying
    /// forever on a payload that can never fit.
    pub fn can_ever_fit(&self, total: u32) -> bool {
        total < self.capacity
    }

    /// Reloads the host-owned write cursor from shared memory. Call before
    /// polling `size` on a queue the firmware consumes.
    pub fn invalidate_write_cursor<H: Hal>(&self, hal: &mut H) {
        let addr = unsafe { core::ptr::addr_of!((*self.header).write) };
        hal.invalidate_dcache_range(addr as usize, 4);
    }

    /// Reloads the host-owned read cursor from shared memory. Call before
    /// retrying a failed write on a queue the firmware produces.
    pub fn invalidate_read_cursor<H: Hal>(&self, hal: &mut H) {
        let addr = unsafe { core::ptr::addr_of!((*self.header).read) };
        hal.invalidate_dcache_range(addr as usize, 4);
    }

    /// Reads `dst.len()` bytes, failing without side effects if that much is
    /// not available. Does not block; the caller decides how to wait.
    ///
    /// On success the read cursor has advanced and been cleaned for the host
    /// to observe.
    pub fn read<H: Hal>(
        &mut self,
        hal: &mut H,
        dst: &mut [u8],
    ) -> Result<(), QueueError> {
        let len = dst.len() as u32;
        if len > self.size() {
            return Err(QueueError::NotEnoughData);
        }

        let read = self.read_cursor();
        let first = len.min(self.capacity - read) as usize;
        let second = len as usize - first;

        // The host wrote these bytes; drop any stale cached copy before
        // looking at them.
        hal.invalidate_dcache_range(self.data as usize + read as usize, first);
        if second != 0 {
            hal.invalidate_dcache_range(self.data as usize, second);
        }

        unsafe {
            core::ptr::copy_nonoverlapping(
                self.data.add(read as usize),
                dst.as_mut_ptr(),
                first,
            );
            if second != 0 {
                core::ptr::copy_nonoverlapping(
                    self.data,
                    dst.as_mut_ptr().add(first),
                    second,
                );
            }
        }

        let new_read = read.wrapping_add(len) & self.mask();
        unsafe {
            core::ptr::addr_of_mut!((*self.header).read)
                .write_volatile(new_read);
        }
        // Publish our progress so the host can reuse the space.
        let addr = unsafe { core::ptr::addr_of!((*self.header).read) };
        hal.clean_dcache_range(addr as usize, 4);

        Ok(())
    }

    /// Consumes `len` bytes without copying them anywhere, as if they had
    /// been read and discarded. Publishes the read cursor like `read`.
    pub fn skip<H: Hal>(
        &mut self,
        hal: &mut H,
        len: u32,
    ) -> Result<(), QueueError> {
        if len > self.size() {
            return Err(QueueError::NotEnoughData);
        }
        let new_read = self.read_cursor().wrapping_add(len) & self.mask();
        unsafe {
            core::ptr::addr_of_mut!((*self.header).read)
                .write_volatile(new_read);
        }
        let addr = unsafe { core::ptr::addr_of!((*self.header).read) };
        hal.clean_dcache_range(addr as usize, 4);
        Ok(())
    }

    /// Gather-writes `parts` as one contiguous block, failing without side
    /// effects if the block exceeds the free space *right now*. The caller
    /// retries after invalidating the host's read cursor.
    ///
    /// On success the payload has been cleaned to shared memory *before* the
    /// write cursor was published, so the host can never observe a partial
    /// message, and the cursor itself has been cleaned after.
    pub fn write<H: Hal>(
        &mut self,
        hal: &mut H,
        parts: &[&[u8]],
    ) -> Result<(), QueueError> {
        let total: u32 = parts.iter().map(|p| p.len() as u32).sum();
        if total > self.free_space() {
            return Err(QueueError::Full);
        }

        let start = self.write_cursor();
        let mut w = start;
        for part in parts {
            let first = part.len().min((self.capacity - w) as usize);
            let second = part.len() - first;
            unsafe {
                core::ptr::copy_nonoverlapping(
                    part.as_ptr(),
                    self.data.add(w as usize),
                    first,
                );
                if second != 0 {
                    core::ptr::copy_nonoverlapping(
                        part.as_ptr().add(first),
                        self.data,
                        second,
                    );
                }
            }
            w = w.wrapping_add(part.len() as u32) & self.mask();
        }

        // Payload must reach shared memory before the cursor moves, or the
        // host could read bytes that are still only in our cache.
        let first = total.min(self.capacity - start) as usize;
        let second = total as usize - first;
        hal.clean_dcache_range(self.data as usize + start as usize, first);
        if second != 0 {
            hal.clean_dcache_range(self.data as usize, second);
        }

        unsafe {
            core::ptr::addr_of_mut!((*self.header).write).write_volatile(w);
        }
        let addr = unsafe { core::ptr::addr_of!((*self.header).write) };
        hal.clean_dcache_range(addr as usize, 4);

        Ok(())
    }
}

// The queue is handed between boot and the dispatch loop; the raw pointers
// are to statically-placed shared memory.
unsafe impl Send for Queue {}

/// Builds a queue over leaked storage, host-initialized to `capacity`.
#[cfg(test)]
pub(crate) fn leak_queue(capacity: u32) -> Queue {
    let storage =
        vec![0u8; npu_abi::QUEUE_HEADER_SIZE + capacity as usize].leak();
    storage[..4].copy_from_slice(&capacity.to_le_bytes());
    unsafe { Queue::from_raw(storage.as_mut_ptr()).unwrap() }
}
