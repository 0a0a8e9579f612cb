// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hardware-access capability used by the mailbox and the dispatch loop.
//!
//! The same protocol logic runs on real silicon and in a simulator; the
//! difference is confined to this trait. On hardware the cache operations are
//! real clean/invalidate-by-address instructions -- they are what establishes
//! visibility ordering across the non-coherent domain shared with the host,
//! and must never be elided. The simulator runs in one coherent address
//! space, so its implementations are empty, but the call sites stay.

pub trait Hal {
    /// Reads a memory-mapped control register.
    fn read_reg(&mut self, addr: u32) -> u32;

    /// Writes a memory-mapped control register.
    fn write_reg(&mut self, addr: u32, value: u32);

    /// Raises the work interrupt line to the host, announcing a response.
    fn raise_host_irq(&mut self);

    /// Parks until something happens: a host doorbell, an engine event, or
    /// any other wakeup source. Spurious returns are fine; callers re-check
    /// their condition.
    fn wait_for_event(&mut self);

    /// Writes back `len` bytes at `base` from the data cache to shared
    /// memory, making them visible to the host.
    fn clean_dcache_range(&mut self, base: usize, len: usize);

    /// Discards any cached copy of `len` bytes at `base`, forcing the next
    /// access to fetch what the host wrote.
    fn invalidate_dcache_range(&mut self, base: usize, len: usize);

    /// Cleans and invalidates the entire data cache. Used around an
    /// inference handoff, where the host has rewritten the command stream
    /// and buffer table wholesale.
    fn clean_invalidate_dcache(&mut self);

    /// Busy-waits for `ticks` timer ticks.
    fn delay_ticks(&mut self, ticks: u32);
}
