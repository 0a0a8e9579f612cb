// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Supervisor-side interface to the privilege-separated task runtime.
//!
//! There are exactly two execution contexts: the privileged supervisor
//! (which owns the hardware, the queues, and all interrupts) and the
//! unprivileged worker. Control moves between them only through the
//! synchronous call in this module; the state machine is strictly
//! call/return, with no preemption and no third context.
//!
//! The mechanics of the switch -- the SVC/PendSV handler pair, the saved
//! register state, the privilege-bit flip -- are architecture-specific and
//! live in `arch`. This module defines the portable seam, so the dispatch
//! loop can be driven by a scripted worker in host tests.

use npu_abi::{TaskConfig, TaskMessage, TaskStatus};

/// The supervisor's handle on the worker context.
///
/// Both operations block, in the strong sense: control does not return
/// until the worker yields back. A worker that never yields stalls the
/// dispatch loop forever, by design -- there is no cancellation.
pub trait TaskPort {
    /// Performs the worker's first start-up transfer, delivering its boot
    /// configuration. The worker runs from its entry point to its first
    /// yield.
    fn start(&mut self, config: *const TaskConfig) -> TaskStatus;

    /// Hands `msg` to the worker and returns its status once it yields
    /// back. The worker mutates the message in place.
    fn send(&mut self, msg: &mut TaskMessage) -> TaskStatus;
}

/// The real port: a synchronous call through the SVC/PendSV switch pair.
#[cfg(target_os = "none")]
pub struct SvcPort;

#[cfg(target_os = "none")]
impl TaskPort for SvcPort {
    fn start(&mut self, config: *const TaskConfig) -> TaskStatus {
        // The worker echoes the word it was handed once it reaches its
        // message loop; anything else means it never got there.
        let echoed = unsafe { crate::arch::task_switch(config as u32) };
        if echoed == config as u32 {
            TaskStatus::Ok
        } else {
            TaskStatus::Failed
        }
    }

    fn send(&mut self, msg: &mut TaskMessage) -> TaskStatus {
        unsafe {
            crate::arch::task_switch(msg as *mut TaskMessage as u32);
        }
        // The worker wrote its verdict into the message before yielding.
        msg.status
    }
}
