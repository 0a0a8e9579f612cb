// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The unprivileged worker: everything accelerator-specific.
//!
//! The worker owns the compute side of the firmware -- capability
//! discovery, stripe dispatch for an inference, profiling bookkeeping. It
//! runs with privilege dropped and its view of the machine cut down to the
//! delegated register block, the command-stream window, and its own stack;
//! anything it needs beyond that goes through the supervisor services.
//!
//! `handle` is the worker's half of the task-message protocol and is pure
//! dispatch; the hardware specifics sit behind the [`Npu`] trait so host
//! tests can script them.

use core::fmt::Write;

use npu_abi::{
    BufferTableHeader, LogSeverity, ProfilingConfig, TaskMessage, TaskRequest,
    TaskStatus,
};
use npu_mailbox::hal::Hal;
use npu_regs::{delegated, dwt, StripeControl, StripeStatus};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::klog::LineBuf;

/// Ceiling on buffers in one inference's buffer table; a table claiming
/// more is rejected as garbage before any engine is touched.
pub const MAX_INFERENCE_BUFFERS: u32 = 64;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InferenceError {
    /// The buffer-table reference was out of range or its header was
    /// nonsense.
    BadBufferTable,
    /// An engine latched an error during stripe processing.
    EngineFault,
}

/// The accelerator as the worker sees it.
pub trait Npu {
    /// The capability blob, stable for the worker's lifetime.
    fn capabilities(&self) -> &[u8];

    /// Runs one inference against the given buffer table; returns the cycle
    /// count it took.
    fn run_inference(&mut self, buffer_table: u64)
        -> Result<u64, InferenceError>;

    fn enable_profiling(&mut self, config: &ProfilingConfig);

    fn disable_profiling(&mut self);

    /// Post-inference bookkeeping: report statistics for the most recent
    /// inference.
    fn post_inference(&mut self);
}

/// Processes one task message in place, filling in result data and status.
pub fn handle<N: Npu>(msg: &mut TaskMessage, npu: &mut N) {
    let status = match &mut msg.request {
        TaskRequest::Capabilities(call) => {
            let caps = npu.capabilities();
            call.data = caps.as_ptr();
            call.len = caps.len();
            TaskStatus::Ok
        }
        TaskRequest::Inference(call) => {
            match npu.run_inference(call.buffer_table) {
                Ok(cycle_count) => {
                    call.cycle_count = cycle_count;
                    TaskStatus::Ok
                }
                Err(_) => TaskStatus::Failed,
            }
        }
        TaskRequest::ProfilingEnable(config) => {
            let config = *config;
            npu.enable_profiling(&config);
            TaskStatus::Ok
        }
        TaskRequest::ProfilingDisable => {
            npu.disable_profiling();
            TaskStatus::Ok
        }
        TaskRequest::PostInferenceCleanup => {
            npu.post_inference();
            TaskStatus::Ok
        }
    };
    msg.status = status;
}

/// Firmware version advertised in the capability blob.
pub const VERSION: (u32, u32, u32) = (1, 0, 0);

/// The capability record returned to the host, built once from the feature
/// registers. Opaque bytes as far as the protocol is concerned; the layout
/// is shared with the host-side support library.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CapabilityBlob {
    pub version_major: u32,
    pub version_minor: u32,
    pub version_patch: u32,
    pub unit_count: u32,
    pub dfc_features: u32,
    pub mce_features: u32,
    pub vector_engine_features: u32,
}

/// Real accelerator control, generic over the hardware capability so the
/// stripe-dispatch state machine is testable against the model.
pub struct EngineControl<H> {
    hal: H,
    address_extend: u32,
    caps: CapabilityBlob,
    profiling: Option<ProfilingConfig>,
    last_cycle_count: u64,
    log: fn(LogSeverity, &[u8]),
}

impl<H: Hal> EngineControl<H> {
    pub fn new(
        mut hal: H,
        address_extend: u32,
        log: fn(LogSeverity, &[u8]),
    ) -> Self {
        let caps = CapabilityBlob {
            version_major: VERSION.0,
            version_minor: VERSION.1,
            version_patch: VERSION.2,
            unit_count: hal.read_reg(delegated::UNIT_COUNT),
            dfc_features: hal.read_reg(delegated::DFC_FEATURES),
            mce_features: hal.read_reg(delegated::MCE_FEATURES),
            vector_engine_features: hal
                .read_reg(delegated::VECTOR_ENGINE_FEATURES),
        };
        Self {
            hal,
            address_extend,
            caps,
            profiling: None,
            last_cycle_count: 0,
            log,
        }
    }

    fn log_line(&self, severity: LogSeverity, args: core::fmt::Arguments<'_>) {
        let mut line = LineBuf::new();
        write!(line, "{args}").ok();
        (self.log)(severity, line.as_bytes());
    }
}

impl<H: Hal> Npu for EngineControl<H> {
    fn capabilities(&self) -> &[u8] {
        self.caps.as_bytes()
    }

    fn run_inference(
        &mut self,
        buffer_table: u64,
    ) -> Result<u64, InferenceError> {
        if buffer_table > usize::MAX as u64 {
            return Err(InferenceError::BadBufferTable);
        }
        // The table sits in shared memory the MPU lets us read; sanity-check
        // its header before kicking anything.
        let header = unsafe {
            (buffer_table as usize as *const BufferTableHeader).read_unaligned()
        };
        let num_buffers = header.num_buffers;
        if num_buffers == 0 || num_buffers > MAX_INFERENCE_BUFFERS {
            self.log_line(
                LogSeverity::Error,
                format_args!("bad buffer table: {num_buffers} buffers"),
            );
            return Err(InferenceError::BadBufferTable);
        }

        self.hal
            .write_reg(delegated::STRIPE_BASE_LO, buffer_table as u32);
        self.hal
            .write_reg(delegated::STRIPE_BASE_HI, self.address_extend);

        let start = self.hal.read_reg(dwt::CYCCNT);
        self.hal
            .write_reg(delegated::STRIPE_CONTROL, StripeControl::GO.bits());

        loop {
            let status = StripeStatus::from_bits_truncate(
                self.hal.read_reg(delegated::STRIPE_STATUS),
            );
            if status.contains(StripeStatus::ERR) {
                self.log_line(
                    LogSeverity::Error,
                    format_args!("engine error during stripe processing"),
                );
                return Err(InferenceError::EngineFault);
            }
            if status.contains(StripeStatus::DONE) {
                break;
            }
            self.hal.wait_for_event();
        }

        let cycle_count =
            u64::from(self.hal.read_reg(dwt::CYCCNT).wrapping_sub(start));
        self.last_cycle_count = cycle_count;
        Ok(cycle_count)
    }

    fn enable_profiling(&mut self, config: &ProfilingConfig) {
        self.profiling = Some(*config);
        self.log_line(
            LogSeverity::Debug,
            format_args!(
                "profiling enabled: {} counters",
                { config.num_hw_counters }
            ),
        );
    }

    fn disable_profiling(&mut self) {
        self.profiling = None;
    }

    fn post_inference(&mut self) {
        // Limited statistics are reported even with profiling off.
        self.log_line(
            LogSeverity::Info,
            format_args!(
                "total inference cycle count: {}",
                self.last_cycle_count
            ),
        );
    }
}

/// Hardware entry point and the worker's restricted HAL.
#[cfg(target_os = "none")]
mod hw {
    use super::*;
    use npu_abi::TaskConfig;

    /// The worker's view of the hardware. Register access within the
    /// delegated block and event waits are direct; cache maintenance is a
    /// supervisor service; everything else is out of reach and a call is a
    /// firmware bug that ends in a fault.
    pub struct WorkerHal;

    impl Hal for WorkerHal {
        fn read_reg(&mut self, addr: u32) -> u32 {
            unsafe { (addr as *const u32).read_volatile() }
        }

        fn write_reg(&mut self, addr: u32, value: u32) {
            unsafe { (addr as *mut u32).write_volatile(value) }
        }

        fn raise_host_irq(&mut self) {
            panic!("worker cannot signal the host");
        }

        fn wait_for_event(&mut self) {
            cortex_m::asm::wfe();
        }

        fn clean_dcache_range(&mut self, _base: usize, _len: usize) {
            // Range maintenance is privileged; the worker's shared-memory
            // traffic (command stream, buffer table) is handled by the
            // supervisor around the inference handoff.
            crate::arch::svc_dcache_clean_invalidate();
        }

        fn invalidate_dcache_range(&mut self, _base: usize, _len: usize) {
            crate::arch::svc_dcache_clean_invalidate();
        }

        fn clean_invalidate_dcache(&mut self) {
            crate::arch::svc_dcache_clean_invalidate();
        }

        fn delay_ticks(&mut self, ticks: u32) {
            let start = self.read_reg(dwt::CYCCNT);
            while self.read_reg(dwt::CYCCNT).wrapping_sub(start) < ticks {}
        }
    }

    fn svc_log(severity: LogSeverity, bytes: &[u8]) {
        crate::arch::svc_log(severity, bytes);
    }

    /// Worker context entry point. `config` arrives in r0, planted there by
    /// the synthesized first context frame and re-sent by the supervisor's
    /// start-up transfer.
    pub extern "C" fn worker_entry(config: *const TaskConfig) -> ! {
        let config = unsafe { &*config };
        let mut npu =
            EngineControl::new(WorkerHal, config.address_extend, svc_log);

        // Announce readiness by echoing the config word back; from here on
        // every yield returns the next task message.
        let mut echo = config as *const TaskConfig as u32;
        loop {
            let ptr = crate::arch::wait_for_task_message(echo);
            let msg = unsafe { &mut *(ptr as *mut TaskMessage) };
            handle(msg, &mut npu);
            echo = ptr;
        }
    }
}

#[cfg(target_os = "none")]
pub use hw::{worker_entry, WorkerHal};

#[cfg(test)]
mod tests {
    use super::*;
    use npu_abi::{BufferDesc, CapabilitiesCall, InferenceCall};
    use npu_mailbox::model::ModelHal;

    fn no_log(_severity: LogSeverity, _bytes: &[u8]) {}

    fn engine_with_status(status: StripeStatus) -> EngineControl<ModelHal> {
        let mut hal = ModelHal::new();
        hal.set_reg(delegated::UNIT_COUNT, 0b0101);
        hal.set_reg(delegated::STRIPE_STATUS, status.bits());
        EngineControl::new(hal, 0x3, no_log)
    }

    /// A buffer table in (host test) memory, address-cast the way the real
    /// one is.
    fn table(num_buffers: u32) -> (Vec<u8>, u64) {
        let mut bytes =
            BufferTableHeader { num_buffers }.as_bytes().to_vec();
        for i in 0..num_buffers {
            bytes.extend_from_slice(
                BufferDesc {
                    address: 0x6000_0000 + u64::from(i) * 0x1000,
                    size: 0x1000,
                }
                .as_bytes(),
            );
        }
        let addr = bytes.as_ptr() as u64;
        (bytes, addr)
    }

    #[test]
    fn capability_blob_reflects_feature_registers() {
        let npu = engine_with_status(StripeStatus::DONE);
        let caps =
            CapabilityBlob::read_from_bytes(npu.capabilities()).unwrap();
        assert_eq!(caps.version_major, VERSION.0);
        assert_eq!(caps.unit_count, 0b0101);
    }

    #[test]
    fn inference_programs_engines_and_counts_cycles() {
        let mut npu = engine_with_status(StripeStatus::DONE);
        let (storage, addr) = table(3);

        let cycles = npu.run_inference(addr).unwrap();
        drop(storage);

        assert_eq!(npu.hal.reg(delegated::STRIPE_BASE_LO), addr as u32);
        assert_eq!(npu.hal.reg(delegated::STRIPE_BASE_HI), 0x3);
        assert_eq!(
            npu.hal.reg(delegated::STRIPE_CONTROL),
            StripeControl::GO.bits()
        );
        // Model cycle counter is frozen, so the delta is zero; what matters
        // is that the count was sampled around the run.
        assert_eq!(cycles, 0);
        assert_eq!(npu.last_cycle_count, cycles);
    }

    #[test]
    fn engine_error_is_reported() {
        let mut npu = engine_with_status(StripeStatus::ERR);
        let (_storage, addr) = table(1);
        assert_eq!(npu.run_inference(addr), Err(InferenceError::EngineFault));
    }

    #[test]
    fn garbage_buffer_table_rejected_without_dispatch() {
        let mut npu = engine_with_status(StripeStatus::DONE);

        let (_storage, addr) = table(0);
        assert_eq!(
            npu.run_inference(addr),
            Err(InferenceError::BadBufferTable)
        );

        let (_storage, addr) = table(MAX_INFERENCE_BUFFERS + 1);
        assert_eq!(
            npu.run_inference(addr),
            Err(InferenceError::BadBufferTable)
        );

        // No kick happened.
        assert_eq!(npu.hal.reg(delegated::STRIPE_CONTROL), 0);
    }

    #[test]
    fn handle_fills_capabilities_call() {
        let mut npu = engine_with_status(StripeStatus::DONE);
        let mut msg =
            TaskMessage::new(TaskRequest::Capabilities(CapabilitiesCall {
                data: core::ptr::null(),
                len: 0,
            }));
        handle(&mut msg, &mut npu);
        assert_eq!(msg.status, TaskStatus::Ok);
        let TaskRequest::Capabilities(call) = msg.request else {
            panic!("request kind changed");
        };
        assert_eq!(call.len, core::mem::size_of::<CapabilityBlob>());
        assert!(!call.data.is_null());
    }

    #[test]
    fn handle_marks_failed_inference() {
        let mut npu = engine_with_status(StripeStatus::ERR);
        let (_storage, addr) = table(1);
        let mut msg = TaskMessage::new(TaskRequest::Inference(InferenceCall {
            buffer_table: addr,
            cycle_count: 0,
        }));
        handle(&mut msg, &mut npu);
        assert_eq!(msg.status, TaskStatus::Failed);
    }

    #[test]
    fn profiling_config_is_retained_until_disable() {
        let mut npu = engine_with_status(StripeStatus::DONE);
        let config = ProfilingConfig {
            enable: 1,
            buffer_address: 0x6800_0000,
            buffer_size: 4096,
            num_hw_counters: 2,
            hw_counters: [0; 6],
        };

        let mut msg =
            TaskMessage::new(TaskRequest::ProfilingEnable(config));
        handle(&mut msg, &mut npu);
        assert_eq!(msg.status, TaskStatus::Ok);
        assert!(npu.profiling.is_some());

        let mut msg = TaskMessage::new(TaskRequest::ProfilingDisable);
        handle(&mut msg, &mut npu);
        assert_eq!(msg.status, TaskStatus::Ok);
        assert!(npu.profiling.is_none());
    }
}
