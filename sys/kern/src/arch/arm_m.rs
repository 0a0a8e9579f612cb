// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ARMv7-M support: vector table, reset path, and the two exception
//! handlers that implement the cooperative context switch.
//!
//! # The switch, in one paragraph
//!
//! The supervisor runs privileged on the main stack (MSP); the worker runs
//! unprivileged on the process stack (PSP). Either side requests a
//! transfer with `SVC #0xFF`; the SVC handler just pends PendSV, which
//! runs once the SVC handler unwinds (both sit at the lowest exception
//! priority, so neither can preempt the other). PendSV stacks the
//! outgoing side's callee-saved registers on its own stack, unstacks the
//! incoming side's, forwards the call argument between the two exception
//! frames' r0 slots, flips CONTROL.nPRIV to match the destination, and
//! returns onto the other stack. From each side's point of view the
//! transfer is an ordinary blocking call.
//!
//! The very first transfer needs somewhere to "return" to, so boot
//! synthesizes the worker's initial context by hand: zeroed callee-saved
//! registers, an exception frame whose PC is the worker entry point, and
//! LR of zero so a debugger knows it hit the bottom of the call stack.
//!
//! Faults (and the accelerator's error interrupt, which is wired to the
//! one external vector) all funnel into `fault::capture` with the
//! faulting PC dug out of whichever stack was live.

use core::arch::global_asm;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use num_traits::FromPrimitive;

use npu_abi::{LogSeverity, TaskConfig};
use npu_mailbox::hal::Hal;
use npu_mailbox::Mailbox;

use crate::hal::HardwareHal;
use crate::klog;
use crate::mpu;

/// Stack arena size for each of the two contexts.
pub const STACK_SIZE: usize = 0x4_0000;

/// A stack arena, aligned to its own size so it can double as an MPU
/// region.
#[repr(C, align(262144))]
struct StackArena([u8; STACK_SIZE]);

/// The two fixed stacks. Carried in the image so neither the host nor the
/// loader has to allocate them; the link layout places them on the
/// power-of-two boundaries the MPU table requires.
#[link_section = ".worker_stack"]
static mut WORKER_STACK: StackArena = StackArena([0; STACK_SIZE]);
#[link_section = ".supervisor_stack"]
static mut SUPERVISOR_STACK: StackArena = StackArena([0; STACK_SIZE]);

/// Boot configuration handed to the worker; lives for the process
/// lifetime so the pointer planted in the worker's first frame stays
/// valid.
static mut WORKER_CONFIG: TaskConfig = TaskConfig {
    log_severity: LogSeverity::Info,
    address_extend: 0,
};

/// Where the stack arenas ended up, for the MPU table.
pub fn memory_layout() -> mpu::MemoryLayout {
    mpu::MemoryLayout {
        worker_stack_base: core::ptr::addr_of!(WORKER_STACK) as u32,
        worker_stack_size: STACK_SIZE as u32,
        supervisor_stack_base: core::ptr::addr_of!(SUPERVISOR_STACK) as u32,
        supervisor_stack_size: STACK_SIZE as u32,
    }
}

/// The worker's initial context: callee-saved registers (in PendSV's
/// stacking order), then the hardware exception frame.
#[repr(C)]
struct TaskContextFrame {
    // Software-stacked context.
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    // Hardware-stacked context.
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    psr: u32,
}

/// Thumb state bit; the only PSR bit the worker needs at entry.
const INITIAL_PSR: u32 = 1 << 24;

/// Builds the worker's first context frame at the top of its stack and
/// points PSP at it. Returns the config pointer the start-up transfer
/// must deliver.
pub fn stage_worker(config: TaskConfig) -> *const TaskConfig {
    unsafe {
        core::ptr::addr_of_mut!(WORKER_CONFIG).write(config);
        let config_ptr = core::ptr::addr_of!(WORKER_CONFIG);

        let stack_top =
            core::ptr::addr_of!(WORKER_STACK) as usize + STACK_SIZE;
        let frame = (stack_top - core::mem::size_of::<TaskContextFrame>())
            as *mut TaskContextFrame;

        frame.write(TaskContextFrame {
            r4: 0,
            r5: 0,
            r6: 0,
            r7: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r0: config_ptr as u32,
            r1: 0,
            r2: 0,
            r3: 0,
            r12: 0,
            // Zero LR so a debugger can detect the bottom of the call
            // stack.
            lr: 0,
            pc: crate::worker::worker_entry as usize as u32 | 1, // thumb
            psr: INITIAL_PSR,
        });

        cortex_m::register::psp::write(frame as u32);
        config_ptr
    }
}

/// One transfer through the switch: traps with the argument in r0 and
/// returns whatever word the other context sends back.
///
/// # Safety
///
/// The other context interprets `arg` per the task-message protocol; a
/// bogus pointer here is a bogus pointer there.
pub unsafe fn task_switch(arg: u32) -> u32 {
    let ret;
    unsafe {
        core::arch::asm!(
            "svc #0xff", // abi::svc::TASK_SWITCH
            inout("r0") arg => ret,
            clobber_abi("C"),
        );
    }
    ret
}

/// Worker side of the same trap: yields `echo` back to the supervisor and
/// blocks until the next task message arrives.
pub fn wait_for_task_message(echo: u32) -> u32 {
    unsafe { task_switch(echo) }
}

/// Worker-callable log service.
pub fn svc_log(severity: LogSeverity, bytes: &[u8]) {
    unsafe {
        core::arch::asm!(
            "svc #0x00", // abi::svc::LOG_MESSAGE
            in("r0") severity as u32,
            in("r1") bytes.as_ptr(),
            in("r2") bytes.len() as u32,
            clobber_abi("C"),
        );
    }
}

/// Worker-callable whole-cache clean/invalidate.
pub fn svc_dcache_clean_invalidate() {
    unsafe {
        core::arch::asm!(
            "svc #0x01", // abi::svc::DCACHE_CLEAN_INVALIDATE
            clobber_abi("C"),
        );
    }
}

/// Mailbox used by the SVC log service, stored as a raw pointer because
/// the service runs in handler mode while the supervisor thread is parked
/// inside the switch.
///
/// Safety argument: the worker can only reach the log service while the
/// supervisor is suspended in `task_switch`, at which point nothing else
/// is touching the mailbox. The pointer is written once at startup.
static LOG_MAILBOX: AtomicPtr<Mailbox> =
    AtomicPtr::new(core::ptr::null_mut());
static LOG_THRESHOLD: AtomicU32 = AtomicU32::new(LogSeverity::Panic as u32);

pub fn publish_log_sink(mailbox: &mut Mailbox, threshold: LogSeverity) {
    LOG_THRESHOLD.store(threshold as u32, Ordering::Relaxed);
    LOG_MAILBOX.store(mailbox, Ordering::Relaxed);
}

/// Rust half of the SVC handler. `args` points at the caller's exception
/// frame, so `args[0..4]` are its r0-r3.
#[no_mangle]
unsafe extern "C" fn svc_entry(number: u32, args: *mut u32) {
    match number {
        npu_abi::svc::LOG_MESSAGE => {
            let severity = LogSeverity::from_u32(unsafe { args.read() })
                .unwrap_or(LogSeverity::Info);
            let ptr = unsafe { args.add(1).read() } as *const u8;
            let len =
                (unsafe { args.add(2).read() } as usize).min(klog::MAX_LINE);
            let bytes = unsafe { core::slice::from_raw_parts(ptr, len) };
            log_from_service(severity, bytes);
        }
        npu_abi::svc::DCACHE_CLEAN_INVALIDATE => {
            HardwareHal::new().clean_invalidate_dcache();
        }
        npu_abi::svc::TASK_SWITCH => {
            cortex_m::peripheral::SCB::set_pendsv();
        }
        _ => {
            let mut line = klog::LineBuf::new();
            use core::fmt::Write;
            write!(line, "unknown svc number: {}", number).ok();
            log_from_service(LogSeverity::Warning, line.as_bytes());
        }
    }
}

fn log_from_service(severity: LogSeverity, bytes: &[u8]) {
    if severity as u32 > LOG_THRESHOLD.load(Ordering::Relaxed) {
        return;
    }
    let mailbox = LOG_MAILBOX.load(Ordering::Relaxed);
    if mailbox.is_null() {
        return;
    }
    let mut hal = HardwareHal::new();
    // Safety: see LOG_MAILBOX.
    unsafe {
        (*mailbox).send_text(&mut hal, severity, bytes).ok();
    }
}

/// Rust half of the fault vectors.
#[no_mangle]
unsafe extern "C" fn fault_entry(pc: u32) -> ! {
    crate::fault::capture(pc)
}

/// Rust half of the reset path: exception plumbing, caches, then the
/// supervisor.
#[no_mangle]
unsafe extern "C" fn reset_entry() -> ! {
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // Split MemManage/BusFault/UsageFault out of HardFault so the
        // dump carries a precise exception number.
        scb.shcsr.modify(|x| x | 0b111 << 16);
        // SVCall and PendSV share the lowest priority: they cannot
        // preempt each other, and nothing needs a critical section.
        scb.shpr[7].write(0xFF);
        scb.shpr[10].write(0xFF);
        // Trap divide-by-zero instead of quietly producing zero.
        scb.ccr.modify(|x| x | 1 << 4);

        // The single external interrupt is the hardware-error line.
        let nvic = &*cortex_m::peripheral::NVIC::PTR;
        nvic.iser[0].write(1);

        let mut p = cortex_m::Peripherals::steal();
        p.SCB.enable_icache();
        p.SCB.enable_dcache(&mut p.CPUID);
    }

    unsafe { crate::startup::start_supervisor() }
}

/// Terminal handler for vectors that should never fire.
unsafe extern "C" fn unexpected_exception() {
    crate::fail::die("unexpected exception")
}

extern "C" {
    fn Reset();
    fn SVCall();
    fn PendSV();
    fn ConfigurableFault();
}

/// A vector table entry.
pub union Vector {
    handler: unsafe extern "C" fn(),
    reserved: u32,
}

/// The vector table: 16 system exceptions plus the one external
/// interrupt.
///
/// Entry 0 is the initial MSP. The loader patches it with the supervisor
/// stack top before releasing the MCU from reset (it must do so anyway
/// when booting the second core of a dual-core part), so the image
/// carries a zero here.
#[link_section = ".vector_table"]
#[no_mangle]
#[used]
pub static VECTOR_TABLE: [Vector; 17] = [
    Vector { reserved: 0 },                          // initial MSP (patched)
    Vector { handler: Reset },                       // reset
    Vector { handler: unexpected_exception },        // NMI
    Vector { handler: ConfigurableFault },           // HardFault
    Vector { handler: ConfigurableFault },           // MemManage
    Vector { handler: ConfigurableFault },           // BusFault
    Vector { handler: ConfigurableFault },           // UsageFault
    Vector { reserved: 0 },
    Vector { reserved: 0 },
    Vector { reserved: 0 },
    Vector { reserved: 0 },
    Vector { handler: SVCall },                      // SVCall
    Vector { handler: unexpected_exception },        // DebugMonitor
    Vector { reserved: 0 },
    Vector { handler: PendSV },                      // PendSV
    Vector { handler: unexpected_exception },        // SysTick (unused)
    Vector { handler: ConfigurableFault },           // IRQ0: hardware error
];

// Reset: give every register a defined value before anything can stack
// it, then continue in Rust.
global_asm! {"
    .section .text.Reset
    .globl Reset
    .type Reset,function
    .thumb_func
    Reset:
        movs r0, #0
        movs r1, #0
        movs r2, #0
        movs r3, #0
        movs r4, #0
        movs r5, #0
        movs r6, #0
        movs r7, #0
        mov r8, r0
        mov r9, r0
        mov r10, r0
        mov r11, r0
        mov r12, r0
        mov lr, r0
        b reset_entry
"}

// SVC entry: recover the service number from the SVC instruction's
// immediate (two bytes behind the stacked return address) and hand it,
// plus a pointer to the caller's exception frame, to the Rust handler.
global_asm! {"
    .section .text.SVCall
    .globl SVCall
    .type SVCall,function
    .thumb_func
    SVCall:
        @ EQ: caller was on MSP; NE: caller was on PSP.
        tst lr, #4
        ite eq
        mrseq r1, msp
        mrsne r1, psp
        @ Stacked PC -> the instruction after the SVC.
        ldr r0, [r1, #24]
        ldrb r0, [r0, #-2]
        @ r0 = service number, r1 = caller's frame.
        push {{r4, lr}}
        bl svc_entry
        pop {{r4, lr}}
        bx lr
"}

// PendSV: the context switch proper. See the module comment.
global_asm! {"
    .section .text.PendSV
    .globl PendSV
    .type PendSV,function
    .thumb_func
    PendSV:
        @ EQ: leaving the supervisor (MSP); NE: leaving the worker (PSP).
        tst lr, #4
        ite eq
        mrseq r0, msp
        mrsne r0, psp
        @ Keep the outgoing exception frame address for the handoff below.
        mov r2, r0
        stmdb r0!, {{r4-r11}}
        ite eq
        msreq msp, r0
        msrne psp, r0

        @ Unstack the incoming context from the other stack.
        ite eq
        mrseq r0, psp
        mrsne r0, msp
        ldmia r0!, {{r4-r11}}
        ite eq
        msreq psp, r0
        msrne msp, r0

        @ Forward the call argument between the two frames' r0 slots.
        ldr r1, [r2]
        str r1, [r0]

        @ Privilege tracks the destination: drop it entering the worker,
        @ restore it entering the supervisor. No barrier needed; the
        @ exception return serves as one.
        mrs r1, control
        ite eq
        orreq r1, r1, #1
        bicne r1, r1, #1
        msr control, r1

        @ Return onto the destination's stack in thread mode.
        ite eq
        mvneq lr, #2    @ 0xFFFFFFFD: thread mode, PSP
        mvnne lr, #6    @ 0xFFFFFFF9: thread mode, MSP
        bx lr
"}

// Shared fault entry: all faults and the hardware-error interrupt gather
// the faulting PC (if the frame is readable) and funnel into Rust. Must
// not touch the stack before reading it.
global_asm! {"
    .section .text.ConfigurableFault
    .globl ConfigurableFault
    .type ConfigurableFault,function
    .thumb_func
    ConfigurableFault:
        tst lr, #4
        ite eq
        mrseq r1, msp
        mrsne r1, psp
        ldr r0, [r1, #24]
        b fault_entry
"}
