// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Supervisor startup.
//!
//! The architecture reset path (`arch`) has already zeroed the register
//! file, set exception priorities, and turned the caches on by the time
//! control arrives here. This module does the ordered, policy-level part:
//! read the boot parameters the host staged in the scratch registers,
//! lock down the MPU, wire up the mailbox, start the worker, and only
//! then -- as the very last step -- tell the host the firmware is open for
//! business.

use npu_abi::LogSeverity;
use npu_mailbox::hal::Hal;
use npu_regs::priv_block;
use num_traits::FromPrimitive;

/// Boot-time configuration, read exactly once from the scratch registers.
#[derive(Copy, Clone, Debug)]
pub struct BootParams {
    pub mailbox_address: u32,
    pub mailbox_size: u32,
    pub command_stream_size: u32,
    pub log_severity: LogSeverity,
    pub address_extend: u32,
}

/// Reads the host-staged parameters. An unrecognized severity value falls
/// back to `Info` rather than wedging boot over a logging knob.
pub fn read_boot_params<H: Hal>(hal: &mut H) -> BootParams {
    let mailbox_address =
        hal.read_reg(priv_block::scratch(npu_abi::scratch::MAILBOX));
    let mailbox_size =
        hal.read_reg(priv_block::scratch(npu_abi::scratch::MAILBOX_SIZE));
    let command_stream_size = hal
        .read_reg(priv_block::scratch(npu_abi::scratch::COMMAND_STREAM_SIZE));
    let raw_severity =
        hal.read_reg(priv_block::scratch(npu_abi::scratch::LOG_SEVERITY));
    let address_extend =
        hal.read_reg(priv_block::scratch(npu_abi::scratch::ADDRESS_EXTEND));

    BootParams {
        mailbox_address,
        mailbox_size,
        command_stream_size,
        log_severity: LogSeverity::from_u32(raw_severity)
            .unwrap_or(LogSeverity::Info),
        address_extend,
    }
}

#[cfg(target_os = "none")]
mod hw {
    use super::*;
    use crate::dispatch::{self, DispatchState};
    use crate::hal::HardwareHal;
    use crate::klog::Logger;
    use crate::task::{SvcPort, TaskPort};
    use crate::{arch, fail, mpu, profiling};
    use npu_abi::{TaskConfig, TaskStatus, BOOT_SUCCESS_MAGIC};
    use npu_mailbox::Mailbox;

    /// Brings the system up and never returns.
    ///
    /// # Safety
    ///
    /// Must be called exactly once per boot, from privileged thread mode on
    /// the main stack, with the reset path's hardware setup already done.
    pub unsafe fn start_supervisor() -> ! {
        let mut hal = HardwareHal::new();
        let params = read_boot_params(&mut hal);

        // Nothing untrusted runs until this table is live.
        let layout = arch::memory_layout();
        let regions = match mpu::region_table(
            &layout,
            params.mailbox_size,
            params.command_stream_size,
        ) {
            Ok(regions) => regions,
            Err(_) => fail::die("bad boot-time window size"),
        };
        mpu::apply(&regions);

        // Scrub whatever a previous tenant left in the accelerator SRAM.
        dispatch::clear_sram(&mut hal);

        let mut mailbox = match unsafe {
            Mailbox::from_header(&mut hal, params.mailbox_address)
        } {
            Ok(mailbox) => mailbox,
            Err(_) => fail::die("bad mailbox header"),
        };

        // From here on the worker's log service has somewhere to go.
        arch::publish_log_sink(&mut mailbox, params.log_severity);

        // Hand the engine-control group to the unprivileged side.
        let delegation = hal.read_reg(priv_block::DELEGATION);
        hal.write_reg(
            priv_block::DELEGATION,
            delegation
                | priv_block::DELEGATE_PWRCTLR
                | priv_block::DELEGATE_ENGINES,
        );

        profiling::enable_cycle_counter(&mut hal);

        let logger = Logger::new(params.log_severity);
        let mut state = DispatchState::new(logger);

        let config = TaskConfig {
            log_severity: params.log_severity,
            address_extend: params.address_extend,
        };
        let config_ptr = arch::stage_worker(config);

        state.logger.log(
            &mut hal,
            &mut mailbox,
            npu_abi::LogSeverity::Debug,
            format_args!("starting worker task"),
        );
        let mut port = SvcPort;
        if port.start(config_ptr) != TaskStatus::Ok {
            fail::die("failed to start worker task");
        }
        state.task_running = true;

        // Last step of boot: the host may now send its first request.
        hal.write_reg(
            priv_block::scratch(npu_abi::scratch::BOOT_STATUS),
            BOOT_SUCCESS_MAGIC,
        );
        state.logger.log(
            &mut hal,
            &mut mailbox,
            npu_abi::LogSeverity::Info,
            format_args!("firmware running"),
        );

        dispatch::run(&mut hal, &mut mailbox, &mut port, &mut state)
    }
}

#[cfg(target_os = "none")]
pub use hw::start_supervisor;
