// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel failure recording.
//!
//! A `panic!` anywhere in the firmware lands here. The failure reason is
//! written into a fixed "epitaph" buffer where a debugger can find it
//! (trim trailing NULs when printing), the host is signalled on the error
//! interrupt line, and the MCU parks. No dump is written to the scratch
//! registers -- the host distinguishes a panic from a hardware fault by
//! the missing dump magic.

use core::fmt::{Display, Write};
use core::sync::atomic::Ordering;

use npu_regs::{priv_block, HostIrq};

/// Set on the way down; a one-stop triage flag for tooling.
#[used]
static mut KERNEL_HAS_FAILED: bool = false;

const EPITAPH_LEN: usize = 128;

#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    // Safety: this is the only site that touches the flag, and it runs at
    // most once to completion -- a second entry spins below.
    let previous_fail = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if previous_fail {
        // Recursive panic; make the problem no worse.
        loop {
            core::sync::atomic::fence(Ordering::SeqCst);
        }
    }

    // Safety: only one execution gets past the flag above.
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

#[inline(always)]
pub(crate) fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    let buf = begin_epitaph();
    let mut writer = Eulogist { dest: buf };
    write!(writer, "{msg}").ok();

    // Signal the host that the firmware is gone, then park. No dump words
    // are written; stale scratch contents fail the magic check.
    unsafe {
        (priv_block::SETIRQ_EXT as *mut u32)
            .write_volatile(HostIrq::ERR.bits());
    }
    crate::fault::halt()
}

struct Eulogist {
    dest: &'static mut [u8],
}

impl Write for Eulogist {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
