// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The supervisor's hardware-access capability: real registers, real cache
//! maintenance, real interrupt lines. The simulator twin lives in
//! `npu_mailbox::model`.

use npu_mailbox::hal::Hal;
use npu_regs::{dwt, priv_block, HostIrq};

pub struct HardwareHal;

impl HardwareHal {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HardwareHal {
    fn default() -> Self {
        Self::new()
    }
}

impl Hal for HardwareHal {
    fn read_reg(&mut self, addr: u32) -> u32 {
        unsafe { (addr as *const u32).read_volatile() }
    }

    fn write_reg(&mut self, addr: u32, value: u32) {
        unsafe { (addr as *mut u32).write_volatile(value) }
    }

    fn raise_host_irq(&mut self) {
        self.write_reg(priv_block::SETIRQ_EXT, HostIrq::JOB.bits());
    }

    fn wait_for_event(&mut self) {
        cortex_m::asm::wfe();
    }

    fn clean_dcache_range(&mut self, base: usize, len: usize) {
        // Manufacture access to the SCB cache-maintenance registers; they
        // cannot be threaded through this trait without poisoning every
        // caller with a peripheral singleton.
        let mut p = unsafe { cortex_m::Peripherals::steal() };
        p.SCB.clean_dcache_by_address(base, len);
    }

    fn invalidate_dcache_range(&mut self, base: usize, len: usize) {
        let mut p = unsafe { cortex_m::Peripherals::steal() };
        unsafe {
            p.SCB.invalidate_dcache_by_address(base, len);
        }
    }

    fn clean_invalidate_dcache(&mut self) {
        let mut p = unsafe { cortex_m::Peripherals::steal() };
        p.SCB.clean_invalidate_dcache(&mut p.CPUID);
    }

    fn delay_ticks(&mut self, ticks: u32) {
        let start = self.read_reg(dwt::CYCCNT);
        while self.read_reg(dwt::CYCCNT).wrapping_sub(start) < ticks {}
    }
}
