// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! NPU control firmware kernel.
//!
//! This crate is the privileged core of the firmware: boot and MPU setup,
//! the two-context task runtime, the supervisor's message loop, and fault
//! capture. The unprivileged worker lives here too (`worker`), but runs with
//! its own stack and no access to the privileged register blocks -- the MPU
//! table in `mpu` is what enforces that split.
//!
//! Design principles, in rough order of importance:
//!
//! 1. Recoverable errors become response messages; the firmware never
//!    terminates itself over malformed host input. Only hardware faults are
//!    fatal, and those end in `fault::capture`.
//! 2. No heap, no dynamic configuration: everything is sized at build time
//!    or read once from the scratch registers at boot.
//! 3. The architecture-specific entry/exit sequences are confined to
//!    `arch`; everything else is ordinary code and builds (and is tested)
//!    on the host.

#![cfg_attr(target_os = "none", no_std)]

pub mod dispatch;
pub mod fault;
pub mod klog;
pub mod mpu;
pub mod profiling;
pub mod startup;
pub mod task;
pub mod worker;

#[cfg(test)]
mod test_support;

#[cfg(target_os = "none")]
pub mod arch;
#[cfg(target_os = "none")]
pub(crate) mod fail;
#[cfg(target_os = "none")]
pub mod hal;
