// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fault capture: the last line of defense.
//!
//! When a processor fault or the accelerator's error interrupt fires, this
//! path gathers the fault-status registers and the accelerator's error
//! state into a `FaultDump`, pushes it out through the scratch registers,
//! raises the error interrupt to the host, and parks the MCU for good.
//!
//! Constraints, deliberately harsher than the rest of the kernel: no
//! allocation, no calls into the protocol layer, and no assumption that the
//! queues -- or anything else in RAM -- are in a consistent state. The only
//! resources used are registers.
//!
//! The packing itself is a pure function over captured values so it can be
//! tested off-target.

use npu_abi::FaultDump;
use npu_regs::scb;

/// Raw processor state captured at fault entry.
#[derive(Copy, Clone, Debug, Default)]
pub struct FaultRegs {
    /// Active exception number, from IPSR.
    pub exception: u32,
    pub cfsr: u32,
    pub hfsr: u32,
    pub mmfar: u32,
    pub bfar: u32,
    /// Faulting PC recovered from the exception frame, if the stack was
    /// readable.
    pub pc: u32,
    pub global_err_cause: u32,
    pub global_err_address: u32,
}

/// Per-engine error-cause values, in engine order. `count` engines were
/// actually present and read.
#[derive(Copy, Clone, Debug, Default)]
pub struct EngineErrs {
    pub count: u32,
    pub causes: [u32; npu_regs::engine::MAX_COUNT as usize],
}

/// Packs the captured state into the fixed dump record.
///
/// Every engine with a nonzero cause is recorded in the bitmask; only the
/// first one's cause register fits in the record, so that is the one kept
/// in detail.
pub fn build_dump(regs: &FaultRegs, engines: &EngineErrs) -> FaultDump {
    let mut engines_with_error = 0u32;
    let mut first_cause = 0u32;
    for (i, &cause) in engines.causes.iter().enumerate() {
        if i as u32 >= engines.count {
            break;
        }
        if cause != 0 {
            if engines_with_error == 0 {
                first_cause = cause;
            }
            engines_with_error |= 1 << i;
        }
    }

    FaultDump {
        header: FaultDump::pack_header(
            regs.exception,
            regs.hfsr & scb::HFSR_FORCED != 0,
            regs.hfsr & scb::HFSR_VECTTBL != 0,
            engines_with_error,
        ),
        cfsr: regs.cfsr,
        mmfar: regs.mmfar,
        bfar: regs.bfar,
        global_err_cause: regs.global_err_cause,
        global_err_address: regs.global_err_address,
        engine_err_cause: first_cause,
        pc: regs.pc,
    }
}

#[cfg(target_os = "none")]
mod hw {
    use super::*;
    use npu_regs::{delegated, engine, global_err, priv_block, HostIrq};

    fn read(addr: u32) -> u32 {
        unsafe { (addr as *const u32).read_volatile() }
    }

    fn write(addr: u32, value: u32) {
        unsafe { (addr as *mut u32).write_volatile(value) }
    }

    /// Captures the machine state and halts. Called from the fault vectors
    /// with the PC dug out of the exception frame.
    pub fn capture(pc: u32) -> ! {
        // Identify the active exception from the bottom bits of IPSR.
        let exception = unsafe {
            let mut ipsr: u32;
            core::arch::asm!(
                "mrs {}, IPSR",
                out(reg) ipsr,
                options(pure, nomem, preserves_flags, nostack),
            );
            ipsr & 0x1FF
        };

        let regs = FaultRegs {
            exception,
            cfsr: read(scb::CFSR),
            hfsr: read(scb::HFSR),
            mmfar: read(scb::MMFAR),
            bfar: read(scb::BFAR),
            pc,
            global_err_cause: read(global_err::CAUSE),
            global_err_address: read(global_err::ADDRESS),
        };

        let mut engines = EngineErrs::default();
        engines.count =
            delegated::engine_count(read(delegated::UNIT_COUNT))
                .min(engine::MAX_COUNT);
        for e in 0..engines.count {
            engines.causes[e as usize] = read(engine::err_cause(e));
        }

        let dump = build_dump(&regs, &engines);
        for (i, word) in dump.words().iter().enumerate() {
            write(priv_block::scratch(i), *word);
        }

        // Tell the host, then lie down.
        write(priv_block::SETIRQ_EXT, HostIrq::ERR.bits());
        halt();
    }

    /// Terminal low-power park. Shared with the panic path.
    pub fn halt() -> ! {
        loop {
            cortex_m::asm::wfi();
        }
    }
}

#[cfg(target_os = "none")]
pub use hw::{capture, halt};
