// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register map of the accelerator's control block, as seen by the on-chip
//! control MCU.
//!
//! This is a hand-maintained subset covering only what the control firmware
//! touches. Addresses are grouped by bus region:
//!
//! ```text
//! 0x0000_0000  code, vector table, stacks
//! 0x4000_0000  delegated control block (engines, feature registers)
//! 0x5000_0000  privileged control block (interrupts, scratch, SRAM control)
//! 0x6000_0000  mailbox shared memory
//! 0x8000_0000  command-stream window (read-only to the MCU)
//! 0xE000_0000  private peripheral bus (SCB, DWT, MPU)
//! ```

#![no_std]

use bitflags::bitflags;

pub const CODE_BASE: u32 = 0x0000_0000;
pub const DELEGATED_REG_BASE: u32 = 0x4000_0000;
pub const PRIV_REG_BASE: u32 = 0x5000_0000;
/// Size of the privileged control block's MPU window.
pub const PRIV_REG_SIZE: u32 = 0x2_0000;
pub const MAILBOX_BASE: u32 = 0x6000_0000;
pub const COMMAND_STREAM_BASE: u32 = 0x8000_0000;
pub const PPB_BASE: u32 = 0xE000_0000;
pub const PPB_SIZE: u32 = 0x2000_0000;

/// Privileged control block: host interrupt lines, inter-processor scratch,
/// SRAM scrubbing, delegation of engine control to unprivileged code.
pub mod priv_block {
    use super::PRIV_REG_BASE;

    /// Raise an interrupt line to the host. Write-1-to-set.
    pub const SETIRQ_EXT: u32 = PRIV_REG_BASE + 0x0180;
    /// Clear a host interrupt line. Write-1-to-clear.
    pub const CLRIRQ_EXT: u32 = PRIV_REG_BASE + 0x0184;
    /// Kick the SRAM scrubber; polls busy until complete.
    pub const CLEAR_SRAM: u32 = PRIV_REG_BASE + 0x0190;
    /// Delegates selected control groups to unprivileged accesses.
    pub const DELEGATION: u32 = PRIV_REG_BASE + 0x01A0;

    /// Number of inter-processor scratch registers.
    pub const SCRATCH_COUNT: usize = 8;

    /// Address of inter-processor scratch register `n`.
    pub const fn scratch(n: usize) -> u32 {
        assert!(n < SCRATCH_COUNT);
        PRIV_REG_BASE + 0x0200 + 4 * n as u32
    }

    pub const CLEAR_SRAM_BUSY: u32 = 1 << 0;
    pub const CLEAR_SRAM_GO: u32 = 1 << 1;

    /// Delegation bits: power control and engine kick interface usable from
    /// the unprivileged context.
    pub const DELEGATE_PWRCTLR: u32 = 1 << 0;
    pub const DELEGATE_ENGINES: u32 = 1 << 1;
}

bitflags! {
    /// Bits of `priv_block::SETIRQ_EXT` / `CLRIRQ_EXT`.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct HostIrq: u32 {
        /// Work notification: a response message is available.
        const JOB = 1 << 0;
        /// Error notification: the firmware has faulted and dumped state.
        const ERR = 1 << 1;
    }
}

/// Delegated control block: hardware description and the stripe-dispatch
/// interface used by the unprivileged worker.
pub mod delegated {
    use super::DELEGATED_REG_BASE;

    /// Quad/engine topology, bitfields decoded below.
    pub const UNIT_COUNT: u32 = DELEGATED_REG_BASE + 0x0000;
    pub const DFC_FEATURES: u32 = DELEGATED_REG_BASE + 0x0004;
    pub const MCE_FEATURES: u32 = DELEGATED_REG_BASE + 0x0008;
    pub const VECTOR_ENGINE_FEATURES: u32 = DELEGATED_REG_BASE + 0x000C;

    /// Low 32 bits of the buffer-table address for the next dispatch.
    pub const STRIPE_BASE_LO: u32 = DELEGATED_REG_BASE + 0x0040;
    /// High bits (address extension) of the buffer-table address.
    pub const STRIPE_BASE_HI: u32 = DELEGATED_REG_BASE + 0x0044;
    /// Dispatch control; see `StripeControl`.
    pub const STRIPE_CONTROL: u32 = DELEGATED_REG_BASE + 0x0048;
    /// Dispatch status; see `StripeStatus`.
    pub const STRIPE_STATUS: u32 = DELEGATED_REG_BASE + 0x004C;

    /// Extracts log2 of the quad count from a `UNIT_COUNT` value.
    pub const fn quad_count_log2(w: u32) -> u32 {
        w & 0x3
    }

    /// Extracts log2 of engines-per-quad from a `UNIT_COUNT` value.
    pub const fn engines_per_quad_log2(w: u32) -> u32 {
        (w >> 2) & 0x3
    }

    /// Total engine count encoded in a `UNIT_COUNT` value.
    pub const fn engine_count(w: u32) -> u32 {
        1 << (quad_count_log2(w) + engines_per_quad_log2(w))
    }
}

bitflags! {
    /// Bits of `delegated::STRIPE_CONTROL`.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct StripeControl: u32 {
        const GO = 1 << 0;
    }

    /// Bits of `delegated::STRIPE_STATUS`.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct StripeStatus: u32 {
        const BUSY = 1 << 0;
        const DONE = 1 << 1;
        const ERR = 1 << 2;
    }
}

/// Global error aggregation block.
pub mod global_err {
    use super::PRIV_REG_BASE;

    pub const CAUSE: u32 = PRIV_REG_BASE + 0x0300;
    pub const ADDRESS: u32 = PRIV_REG_BASE + 0x0304;
}

bitflags! {
    /// Bits of `global_err::CAUSE`. Any set bit latches the error interrupt.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct GlobalErrCause: u32 {
        const ENGINE_RAM_CORRECTABLE = 1 << 0;
        const ENGINE_RAM_UNCORRECTABLE = 1 << 1;
        const MCU_LOCKUP = 1 << 2;
        const MCU_INSTR = 1 << 3;
        const MCU_DATA_READ = 1 << 4;
        const MCU_DATA_WRITE = 1 << 5;
        const DMA_READ = 1 << 6;
        const DMA_WRITE = 1 << 7;
        const DMA_QUEUE_PROGRAMMING = 1 << 8;
        const STRIPE_PROGRAMMING = 1 << 9;
        const STRIPE_WRITE_WHILE_BUSY = 1 << 10;
        const ENGINE_FUNC = 1 << 11;
    }
}

/// Per-engine error reporting.
pub mod engine {
    use super::DELEGATED_REG_BASE;

    /// Upper bound on engines; the real count comes from
    /// `delegated::UNIT_COUNT`.
    pub const MAX_COUNT: u32 = 8;

    const BASE: u32 = DELEGATED_REG_BASE + 0x1000;
    const STRIDE: u32 = 0x100;

    pub const fn err_cause(e: u32) -> u32 {
        assert!(e < MAX_COUNT);
        BASE + e * STRIDE
    }

    pub const fn err_address(e: u32) -> u32 {
        assert!(e < MAX_COUNT);
        BASE + e * STRIDE + 4
    }
}

bitflags! {
    /// Bits of a per-engine error-cause register.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct EngineErrCause: u32 {
        const RAM_CORRECTABLE = 1 << 0;
        const RAM_UNCORRECTABLE = 1 << 1;
        const MCU_LOCKUP = 1 << 2;
        const UDMA_LOAD = 1 << 3;
        const UDMA_STORE = 1 << 4;
        const ILLEGAL_COPROC = 1 << 5;
        const DIV_BY_ZERO = 1 << 6;
        const LANE = 1 << 7;
    }
}

/// System control block fault-status registers, read raw by the fault path.
pub mod scb {
    use super::PPB_BASE;

    pub const CFSR: u32 = PPB_BASE + 0xED28;
    pub const HFSR: u32 = PPB_BASE + 0xED2C;
    pub const MMFAR: u32 = PPB_BASE + 0xED34;
    pub const BFAR: u32 = PPB_BASE + 0xED38;

    pub const HFSR_VECTTBL: u32 = 1 << 1;
    pub const HFSR_FORCED: u32 = 1 << 30;
}

/// Data Watchpoint and Trace unit; the cycle counter backs both profiling
/// and the host-requested delay.
pub mod dwt {
    use super::PPB_BASE;

    pub const CTRL: u32 = PPB_BASE + 0x1000;
    pub const CYCCNT: u32 = PPB_BASE + 0x1004;

    pub const CTRL_CYCCNTENA: u32 = 1 << 0;

    /// Debug Exception and Monitor Control; TRCENA gates the whole DWT.
    pub const DEMCR: u32 = PPB_BASE + 0xEDFC;
    pub const DEMCR_TRCENA: u32 = 1 << 24;
}
