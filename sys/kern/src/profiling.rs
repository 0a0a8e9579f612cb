// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cycle-counter control for host-configured profiling.
//!
//! The supervisor owns the DWT cycle counter: the dispatch loop starts it
//! when the host enables profiling, stops it on disable, and samples it for
//! the worker through the `CYCLE_COUNT` service. The counter sits on the
//! PPB, which the MPU leaves readable (not writable) to the worker, so the
//! worker can also sample it directly around an inference.

use npu_abi::{ProfilingConfig, PROFILING_MAX_HW_COUNTERS};
use npu_mailbox::hal::Hal;
use npu_regs::dwt;

/// Turns the DWT on at boot so that cycle sampling works even before the
/// host configures profiling.
pub fn enable_cycle_counter<H: Hal>(hal: &mut H) {
    let demcr = hal.read_reg(dwt::DEMCR);
    hal.write_reg(dwt::DEMCR, demcr | dwt::DEMCR_TRCENA);
    hal.write_reg(dwt::CYCCNT, 0);
    let ctrl = hal.read_reg(dwt::CTRL);
    hal.write_reg(dwt::CTRL, ctrl | dwt::CTRL_CYCCNTENA);
}

/// Zeroes and starts the cycle counter for a profiling session.
pub fn reset_and_start<H: Hal>(hal: &mut H) {
    hal.write_reg(dwt::CYCCNT, 0);
    let ctrl = hal.read_reg(dwt::CTRL);
    hal.write_reg(dwt::CTRL, ctrl | dwt::CTRL_CYCCNTENA);
}

pub fn stop<H: Hal>(hal: &mut H) {
    let ctrl = hal.read_reg(dwt::CTRL);
    hal.write_reg(dwt::CTRL, ctrl & !dwt::CTRL_CYCCNTENA);
}

pub fn cycle_count<H: Hal>(hal: &mut H) -> u32 {
    hal.read_reg(dwt::CYCCNT)
}

/// Whether a profiling configuration's counter selection is acceptable.
/// Only meaningful for enable requests; a disable carries no counters.
pub fn counter_selection_valid(config: &ProfilingConfig) -> bool {
    !config.enabled() || config.num_hw_counters <= PROFILING_MAX_HW_COUNTERS
}

#[cfg(test)]
mod tests {
    use super::*;
    use npu_mailbox::model::ModelHal;

    #[test]
    fn counter_control() {
        let mut hal = ModelHal::new();

        enable_cycle_counter(&mut hal);
        assert_eq!(hal.reg(dwt::DEMCR) & dwt::DEMCR_TRCENA, dwt::DEMCR_TRCENA);
        assert_eq!(hal.reg(dwt::CTRL) & dwt::CTRL_CYCCNTENA, 1);

        hal.set_reg(dwt::CYCCNT, 1234);
        reset_and_start(&mut hal);
        assert_eq!(hal.reg(dwt::CYCCNT), 0);
        assert_eq!(hal.reg(dwt::CTRL) & dwt::CTRL_CYCCNTENA, 1);

        stop(&mut hal);
        assert_eq!(hal.reg(dwt::CTRL) & dwt::CTRL_CYCCNTENA, 0);
    }

    #[test]
    fn counter_selection_limits() {
        let mut config = ProfilingConfig {
            enable: 1,
            buffer_address: 0,
            buffer_size: 0,
            num_hw_counters: PROFILING_MAX_HW_COUNTERS,
            hw_counters: [0; 6],
        };
        assert!(counter_selection_valid(&config));

        config.num_hw_counters = PROFILING_MAX_HW_COUNTERS + 1;
        assert!(!counter_selection_valid(&config));

        // A disable never cares about the counter field.
        config.enable = 0;
        assert!(counter_selection_valid(&config));
    }
}
