// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory-protection configuration.
//!
//! The firmware's security argument is this table: before the worker runs a
//! single instruction, the MPU is loaded with a fixed set of regions that
//! deny it the privileged register block, the supervisor's stack, and the
//! mailbox. Regions are evaluated in priority order -- higher-numbered
//! regions override lower ones for overlapping addresses -- so the table is
//! ordered from most general (a background deny-all) to most specific.
//!
//! Two of the regions are sized at boot from host-supplied parameters (the
//! mailbox and the command-stream windows); everything else is fixed by the
//! address map in `npu_regs` and the stack arenas the kernel carries.
//!
//! The PMSAv7 encoding here requires power-of-two sizes and natural
//! alignment, which is why sizes travel as log2 values.

/// Hardware ceiling on MPU regions; the table always fills all of them.
pub const REGION_COUNT: usize = 8;

/// What the *unprivileged* side may do with a region. The supervisor always
/// retains at least read access except for the background deny region; the
/// AP encodings below are chosen accordingly.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    /// Nobody, privileged or not. Backstop against speculative accesses.
    NoAccess,
    /// Privileged read-write, unprivileged nothing.
    PrivilegedOnly,
    /// Privileged read-write, unprivileged read-only.
    UserReadOnly,
    /// Read-write for everyone.
    Full,
    /// Read-only for everyone.
    ReadOnly,
    /// Privileged read-only, unprivileged nothing.
    PrivilegedReadOnly,
}

/// Memory type and cache policy for a region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryKind {
    /// Strongly-ordered; for the background region and the PPB.
    StronglyOrdered,
    /// Device registers.
    Device,
    /// Normal memory, write-back with write/read allocate.
    WriteBack,
    /// Normal memory, write-through; used for code and other read-mostly
    /// windows.
    WriteThrough,
}

/// One declarative MPU region. Compiled to register values by
/// `compute_region_data`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MpuRegion {
    pub base: u32,
    /// log2 of the region size; 5 (32 bytes) through 32 (the whole address
    /// space).
    pub size_log2: u8,
    /// Subregion disable mask: bit N set disables the Nth eighth of the
    /// region, letting those addresses fall through to lower-priority
    /// regions.
    pub subregion_disable: u8,
    pub access: Access,
    pub memory: MemoryKind,
    pub execute: bool,
}

/// Precomputed PMSAv7 register values for one region slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegionData {
    pub rbar: u32,
    pub rasr: u32,
}

/// Placement of the two stack arenas, threaded in from the architecture
/// layer so this module stays free of link-time symbol arithmetic.
#[derive(Copy, Clone, Debug)]
pub struct MemoryLayout {
    pub worker_stack_base: u32,
    pub worker_stack_size: u32,
    pub supervisor_stack_base: u32,
    pub supervisor_stack_size: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MpuError {
    /// A boot-time size is zero, not a power of two, or outside the range
    /// the MPU can express for a configurable window.
    BadRegionSize(u32),
    /// A region base is not naturally aligned for its size.
    Misaligned(u32),
}

/// Converts a window size in bytes to its log2, accepting only what the
/// original memory map allows for host-configurable windows: powers of two
/// from 4 KiB to 512 MiB.
pub fn region_size_log2(bytes: u32) -> Result<u8, MpuError> {
    if !bytes.is_power_of_two() {
        return Err(MpuError::BadRegionSize(bytes));
    }
    let log2 = bytes.trailing_zeros() as u8;
    if !(12..=29).contains(&log2) {
        return Err(MpuError::BadRegionSize(bytes));
    }
    Ok(log2)
}

/// Compiles one region to its RBAR/RASR values for `slot`.
///
/// Panics on a malformed region rather than programming the MPU with
/// garbage; the table is fixed at boot, so this is a build mistake, not a
/// runtime condition.
pub fn compute_region_data(slot: usize, region: &MpuRegion) -> RegionData {
    assert!(slot < REGION_COUNT);
    assert!((5..=32).contains(&region.size_log2));
    // Natural alignment, which also covers the 32-byte hardware minimum.
    if region.size_log2 < 32 {
        let align_mask = (1u32 << region.size_log2) - 1;
        assert!(region.base & align_mask == 0);
    } else {
        assert!(region.base == 0);
    }

    // RBAR: base | VALID | region number, so a single write retargets the
    // slot.
    let rbar = region.base | 1 << 4 | slot as u32;

    let xn = !region.execute as u32;
    let ap = match region.access {
        Access::NoAccess => 0b000,
        Access::PrivilegedOnly => 0b001,
        Access::UserReadOnly => 0b010,
        Access::Full => 0b011,
        Access::PrivilegedReadOnly => 0b101,
        Access::ReadOnly => 0b110,
    };
    // TEX and S/C/B select the memory type; see table B3-13 in the ARMv7-M
    // ARM.
    let (tex, scb) = match region.memory {
        MemoryKind::StronglyOrdered => (0b000, 0b000),
        MemoryKind::Device => (0b000, 0b001),
        MemoryKind::WriteBack => (0b001, 0b011),
        MemoryKind::WriteThrough => (0b000, 0b010),
    };

    // The size field is log2 minus one; regions are enabled in the register
    // image because the whole table is loaded with the MPU off.
    let l2size = u32::from(region.size_log2) - 1;
    let rasr = xn << 28
        | ap << 24
        | tex << 19
        | scb << 16
        | u32::from(region.subregion_disable) << 8
        | l2size << 1
        | 1;

    RegionData { rbar, rasr }
}

/// Builds the fixed region table from the two boot-time window sizes and
/// the stack layout.
///
/// Table order is load-bearing: slot 0 is the 4 GiB deny-all backstop and
/// each later slot carves out a more specific window on top of it.
pub fn region_table(
    layout: &MemoryLayout,
    mailbox_size: u32,
    command_stream_size: u32,
) -> Result<[MpuRegion; REGION_COUNT], MpuError> {
    // The code window runs from address zero up to the worker stack, which
    // the link layout places at a power-of-two boundary for exactly this
    // reason.
    let code_size_log2 = region_size_log2(layout.worker_stack_base)?;
    // The worker stack itself is covered by the general window (slot 1),
    // but its placement still has to be sane.
    region_size_log2(layout.worker_stack_size)?;
    let supervisor_log2 = region_size_log2(layout.supervisor_stack_size)?;
    if layout.worker_stack_base & (layout.worker_stack_size - 1) != 0 {
        return Err(MpuError::Misaligned(layout.worker_stack_base));
    }
    if layout.supervisor_stack_base & (layout.supervisor_stack_size - 1) != 0 {
        return Err(MpuError::Misaligned(layout.supervisor_stack_base));
    }

    Ok([
        // Slot 0: background. Deny everything not explicitly opened below,
        // including speculative accesses by privileged code.
        MpuRegion {
            base: 0,
            size_log2: 32,
            subregion_disable: 0,
            access: Access::NoAccess,
            memory: MemoryKind::StronglyOrdered,
            execute: false,
        },
        // Slot 1: the general read-write window over the low 2 GiB.
        // Subregions disable the eighths with nothing in them (and the
        // mailbox eighth, which slot 5 reopens as privileged-only), so
        // those fall through to the deny region.
        MpuRegion {
            base: 0,
            size_log2: 31,
            subregion_disable: 0b1100_1110,
            access: Access::Full,
            memory: MemoryKind::WriteBack,
            execute: false,
        },
        // Slot 2: code and vector table, up to the worker stack.
        MpuRegion {
            base: 0,
            size_log2: code_size_log2,
            subregion_disable: 0,
            access: Access::ReadOnly,
            memory: MemoryKind::WriteThrough,
            execute: true,
        },
        // Slot 3: supervisor stack, out of the worker's reach.
        MpuRegion {
            base: layout.supervisor_stack_base,
            size_log2: supervisor_log2,
            subregion_disable: 0,
            access: Access::PrivilegedOnly,
            memory: MemoryKind::WriteBack,
            execute: false,
        },
        // Slot 4: the privileged control block (interrupts, scratch, SRAM
        // control).
        MpuRegion {
            base: npu_regs::PRIV_REG_BASE,
            size_log2: region_size_log2(npu_regs::PRIV_REG_SIZE)?,
            subregion_disable: 0,
            access: Access::PrivilegedOnly,
            memory: MemoryKind::Device,
            execute: false,
        },
        // Slot 5: mailbox shared memory, supervisor only. Cacheable on
        // purpose; visibility is handled by explicit maintenance in the
        // queue code.
        MpuRegion {
            base: npu_regs::MAILBOX_BASE,
            size_log2: region_size_log2(mailbox_size)?,
            subregion_disable: 0,
            access: Access::PrivilegedOnly,
            memory: MemoryKind::WriteBack,
            execute: false,
        },
        // Slot 6: command-stream window, readable by the worker, writable
        // by nobody.
        MpuRegion {
            base: npu_regs::COMMAND_STREAM_BASE,
            size_log2: region_size_log2(command_stream_size)?,
            subregion_disable: 0,
            access: Access::ReadOnly,
            memory: MemoryKind::WriteThrough,
            execute: false,
        },
        // Slot 7: the private peripheral bus. The worker may read (it uses
        // the cycle counter) but only the supervisor writes.
        MpuRegion {
            base: npu_regs::PPB_BASE,
            size_log2: 29,
            subregion_disable: 0,
            access: Access::UserReadOnly,
            memory: MemoryKind::StronglyOrdered,
            execute: false,
        },
    ])
}

/// Loads the table into the hardware and switches the MPU on.
///
/// The MPU must be off while the slots are written: RBAR and RLAR-era
/// registers cannot be updated atomically, and a half-written slot with the
/// MPU live is a real crash.
#[cfg(target_os = "none")]
pub fn apply(regions: &[MpuRegion; REGION_COUNT]) {
    // Manufacture access to the MPU; it cannot be threaded through an
    // architecture-independent API.
    let mpu = unsafe { &*cortex_m::peripheral::MPU::PTR };

    unsafe {
        mpu.ctrl.write(0);
    }

    for (slot, region) in regions.iter().enumerate() {
        let data = compute_region_data(slot, region);
        unsafe {
            mpu.rbar.write(data.rbar);
            mpu.rasr.write(data.rasr);
        }
    }

    // Enable without PRIVDEFENA: slot 0 is our background policy, and we
    // want it to apply to privileged accesses too.
    const ENABLE: u32 = 0b001;
    unsafe {
        mpu.ctrl.write(ENABLE);
    }
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}
