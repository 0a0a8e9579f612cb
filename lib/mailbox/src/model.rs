// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulator implementation of the hardware-access capability.
//!
//! The model runs in a single coherent address space, so the cache
//! operations are empty; everything else is recorded so tests can assert on
//! it. A small fixed register file stands in for the control block.

use crate::hal::Hal;

const REG_SLOTS: usize = 32;

/// Number of `wait_for_event` calls the model tolerates before concluding
/// that the caller is spinning on a condition nothing will ever satisfy.
const WAIT_BUDGET: u32 = 1_000_000;

pub struct ModelHal {
    regs: [Option<(u32, u32)>; REG_SLOTS],
    /// Work interrupts raised toward the (simulated) host.
    pub host_irqs: u32,
    /// Total ticks spent in `delay_ticks`.
    pub delayed_ticks: u64,
    /// Whole-cache clean/invalidate calls, counted for handoff assertions.
    pub full_cache_ops: u32,
    waits: u32,
}

impl ModelHal {
    pub fn new() -> Self {
        Self {
            regs: [None; REG_SLOTS],
            host_irqs: 0,
            delayed_ticks: 0,
            full_cache_ops: 0,
            waits: 0,
        }
    }

    /// Pre-loads a register, as the host or hardware would before boot.
    pub fn set_reg(&mut self, addr: u32, value: u32) {
        self.write_reg(addr, value);
    }

    pub fn reg(&self, addr: u32) -> u32 {
        self.regs
            .iter()
            .flatten()
            .find(|(a, _)| *a == addr)
            .map(|(_, v)| *v)
            .unwrap_or(0)
    }
}

impl Default for ModelHal {
    fn default() -> Self {
        Self::new()
    }
}

impl Hal for ModelHal {
    fn read_reg(&mut self, addr: u32) -> u32 {
        self.reg(addr)
    }

    fn write_reg(&mut self, addr: u32, value: u32) {
        for slot in self.regs.iter_mut() {
            match slot {
                Some((a, v)) if *a == addr => {
                    *v = value;
                    return;
                }
                None => {
                    *slot = Some((addr, value));
                    return;
                }
                _ => {}
            }
        }
        panic!("model register file full");
    }

    fn raise_host_irq(&mut self) {
        self.host_irqs += 1;
    }

    fn wait_for_event(&mut self) {
        self.waits += 1;
        if self.waits > WAIT_BUDGET {
            panic!("model stuck in wait_for_event");
        }
    }

    // The model's memory is coherent; visibility is free here. The call
    // sites in the queue are still exercised.
    fn clean_dcache_range(&mut self, _base: usize, _len: usize) {}

    fn invalidate_dcache_range(&mut self, _base: usize, _len: usize) {}

    fn clean_invalidate_dcache(&mut self) {
        self.full_cache_ops += 1;
    }

    fn delay_ticks(&mut self, ticks: u32) {
        self.delayed_ticks += u64::from(ticks);
    }
}
