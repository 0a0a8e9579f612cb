// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture selection. Everything target-specific -- the vector table,
//! the SVC/PendSV switch pair, the fault entry sequences -- is behind this
//! seam; the rest of the kernel is ordinary code.

#[cfg(target_arch = "arm")]
mod arm_m;

#[cfg(target_arch = "arm")]
pub use arm_m::*;

#[cfg(not(target_arch = "arm"))]
compile_error!("no architecture support for this target");
