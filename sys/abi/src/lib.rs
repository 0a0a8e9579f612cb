// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire-format and cross-boundary definitions shared by the control kernel,
//! the unprivileged worker, and (conceptually) the host driver.
//!
//! Everything in this crate is plain data: message framing, queue layout,
//! boot-time configuration, the fault-dump record, and the in-memory call
//! record used across the supervisor/worker boundary. The layout of the wire
//! types is part of the host ABI and must not change without coordinating
//! with the driver; `static_assertions` pins the sizes that matter.

#![cfg_attr(not(test), no_std)]

use num_derive::FromPrimitive;
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Worst-case cache line length across the host and the NPU's own MCU. Data
/// that is written by one side and read by the other is padded to this size
/// so that the two never dirty the same line.
pub const CACHE_LINE_SIZE: usize = 128;

/// Ceiling on the number of hardware counters a profiling configuration may
/// select.
pub const PROFILING_MAX_HW_COUNTERS: u32 = 6;

/// Value written to [`scratch::BOOT_STATUS`] as the very last step of a
/// successful boot. The host must not send requests until it observes this.
pub const BOOT_SUCCESS_MAGIC: u32 = 0xCAFE_F00D;

/// Roles of the inter-processor scratch registers, as register indices into
/// the scratch file (see the register crate for the actual addresses).
///
/// The host programs the first five before releasing the MCU from reset; the
/// firmware reads them exactly once during boot. After a fault the entire
/// scratch file is reused as the fault-dump window, clobbering these -- by
/// then the boot values are dead.
pub mod scratch {
    /// Base address of the mailbox header in shared memory.
    pub const MAILBOX: usize = 0;
    /// Size in bytes of the mailbox region (for MPU sizing).
    pub const MAILBOX_SIZE: usize = 1;
    /// Size in bytes of the command-stream region (for MPU sizing).
    pub const COMMAND_STREAM_SIZE: usize = 2;
    /// Initial logging severity threshold, as a `LogSeverity` value.
    pub const LOG_SEVERITY: usize = 3;
    /// Address-extension value applied to 32-bit addresses handed to the
    /// accelerator's DMA engines.
    pub const ADDRESS_EXTEND: usize = 4;
    /// Boot progress; set to `BOOT_SUCCESS_MAGIC` when startup completes.
    pub const BOOT_STATUS: usize = 5;
}

/// Severity of a `Text` log message, and the boot-time filtering threshold.
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, FromPrimitive)]
#[repr(u32)]
pub enum LogSeverity {
    Panic = 0,
    Error = 1,
    Warning = 2,
    Info = 3,
    Debug = 4,
    Verbose = 5,
}

/// Message types carried in `MessageHeader::msg_type`.
///
/// The numeric values are host ABI; in particular the inference pair must
/// stay first for compatibility with the driver's test rig.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u32)]
pub enum MessageType {
    /// Host -> firmware: `InferenceRequest` payload.
    InferenceRequest = 0,
    /// Firmware -> host: `InferenceResponse` payload.
    InferenceResponse = 1,
    /// Firmware -> host: `TextHeader` followed by NUL-terminated bytes.
    Text = 2,
    /// Host -> firmware: `ProfilingConfig` payload.
    ConfigureProfiling = 3,
    /// Firmware -> host: empty ack for `ConfigureProfiling`.
    ConfigureProfilingAck = 4,
    /// Host -> firmware: `u32` tick count to busy-wait.
    Delay = 5,
    /// Host -> firmware: empty liveness probe.
    Ping = 6,
    /// Firmware -> host: empty reply to `Ping`.
    Pong = 7,
    /// Host -> firmware: empty request for the capability blob.
    CapabilitiesRequest = 8,
    /// Firmware -> host: raw capability blob.
    CapabilitiesResponse = 9,
    /// Firmware -> host: `ErrorResponse` payload.
    ErrorResponse = 10,
}

/// Fixed header preceding every message in either queue.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout,
    Immutable, Unaligned,
)]
#[repr(C, packed)]
pub struct MessageHeader {
    /// A `MessageType` value. Kept as a raw `u32` so that an unknown type can
    /// be reported back to the host instead of failing to parse.
    pub msg_type: u32,
    /// Payload byte count; the payload follows immediately.
    pub length: u32,
}

pub const MESSAGE_HEADER_SIZE: usize = core::mem::size_of::<MessageHeader>();
const_assert_eq!(MESSAGE_HEADER_SIZE, 8);

/// Status reported in an `InferenceResponse`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u32)]
pub enum InferenceStatus {
    Ok = 0,
    Error = 1,
}

/// Status reported in an `ErrorResponse`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u32)]
pub enum ErrorStatus {
    /// The worker rejected or failed the operation.
    Failed = 0,
    /// A request arrived before the worker completed startup.
    InvalidState = 1,
    /// Malformed, oversized, or unknown message.
    InvalidMessage = 2,
}

/// Payload of an `InferenceRequest`.
///
/// The buffer table and the pre-built command stream live in their own shared
/// regions; only this reference travels through the queue. `user_token` is
/// opaque to the firmware and echoed back unchanged.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C, packed)]
pub struct InferenceRequest {
    pub user_token: u64,
    pub buffer_table: u64,
}

/// Payload of an `InferenceResponse`.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C, packed)]
pub struct InferenceResponse {
    pub user_token: u64,
    /// An `InferenceStatus` value.
    pub status: u32,
    pub cycle_count: u64,
}

/// Leading payload of a `Text` message; the message bytes follow,
/// NUL-terminated.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C, packed)]
pub struct TextHeader {
    /// A `LogSeverity` value.
    pub severity: u32,
}

/// Payload of a `ConfigureProfiling` request.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C, packed)]
pub struct ProfilingConfig {
    /// Nonzero to enable profiling, zero to disable it.
    pub enable: u32,
    /// Firmware-accessible address of the profiling buffer.
    pub buffer_address: u64,
    pub buffer_size: u32,
    /// Number of valid entries in `hw_counters`; at most
    /// `PROFILING_MAX_HW_COUNTERS`.
    pub num_hw_counters: u32,
    pub hw_counters: [u32; 6],
}

impl ProfilingConfig {
    pub fn enabled(&self) -> bool {
        self.enable != 0
    }
}

/// Payload of an `ErrorResponse`.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C, packed)]
pub struct ErrorResponse {
    /// `msg_type` of the request being rejected, echoed raw.
    pub original_type: u32,
    /// An `ErrorStatus` value.
    pub status: u32,
}

/// The mailbox header, placed by the host at the address it publishes in
/// `scratch::MAILBOX`. Points at the two queues.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C, packed)]
pub struct MailboxHeader {
    /// Address of the host -> firmware queue.
    pub request: u64,
    /// Address of the firmware -> host queue.
    pub response: u64,
}

/// Header of a single-producer/single-consumer byte queue in shared memory;
/// `capacity` bytes of data follow.
///
/// The consumer's fields (`capacity` + `read`) and the producer's field
/// (`write`) sit in separate cache lines: the two sides run on processors
/// that do not share a coherent cache domain, and each side cleans or
/// invalidates exactly the line holding the cursor it is interested in.
///
/// The queue is empty iff `read == write`, so it can never be allowed to
/// become completely full -- that would be indistinguishable from empty.
/// `capacity` must be a power of two; cursor arithmetic is mask-based.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct QueueHeader {
    pub capacity: u32,
    pub read: u32,
    _pad0: [u8; CACHE_LINE_SIZE - 8],
    pub write: u32,
    _pad1: [u8; CACHE_LINE_SIZE - 4],
}

pub const QUEUE_HEADER_SIZE: usize = core::mem::size_of::<QueueHeader>();
const_assert_eq!(QUEUE_HEADER_SIZE, 2 * CACHE_LINE_SIZE);

/// Buffer descriptor within the buffer table referenced by an inference
/// request.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C, packed)]
pub struct BufferDesc {
    pub address: u64,
    pub size: u32,
}

/// Leading header of the buffer table; `num_buffers` `BufferDesc` records
/// follow.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C, packed)]
pub struct BufferTableHeader {
    pub num_buffers: u32,
}

/// Fault dump record, sized to exactly fill the eight inter-processor scratch
/// registers. Produced once per fault, transmitted word-by-word, never
/// retained.
///
/// Word 0 packs a magic value (so the host can tell a real dump from stale
/// scratch contents), the active exception number, the two meaningful
/// HardFault status bits, and a bitmask of engines reporting an error. Only
/// the first failing engine's cause register fits; the per-engine error
/// address does not, and is dropped.
#[derive(
    Copy, Clone, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
#[repr(C)]
pub struct FaultDump {
    pub header: u32,
    /// Raw Configurable Fault Status Register.
    pub cfsr: u32,
    /// MemManage fault address.
    pub mmfar: u32,
    /// Bus fault address.
    pub bfar: u32,
    /// Accelerator global error-cause register.
    pub global_err_cause: u32,
    /// Accelerator global error-address register.
    pub global_err_address: u32,
    /// Error-cause register of the first engine reporting an error.
    pub engine_err_cause: u32,
    /// Faulting program counter, recovered from the exception frame.
    pub pc: u32,
}

pub const FAULT_DUMP_WORDS: usize = 8;
const_assert_eq!(core::mem::size_of::<FaultDump>(), FAULT_DUMP_WORDS * 4);

/// 12-bit magic in the top bits of `FaultDump::header`.
pub const FAULT_DUMP_MAGIC: u32 = 0xFD5;

const MAGIC_SHIFT: u32 = 20;
const EXCEPTION_SHIFT: u32 = 11;
const EXCEPTION_MASK: u32 = 0x1FF;
const HFSR_FORCED_BIT: u32 = 1 << 10;
const HFSR_VECTTBL_BIT: u32 = 1 << 9;
const ENGINE_MASK: u32 = 0xFF;

impl FaultDump {
    /// Packs the header word from its parts. `engines_with_error` is
    /// truncated to the eight engines the mask has room for.
    pub fn pack_header(
        exception: u32,
        hfsr_forced: bool,
        hfsr_vecttbl: bool,
        engines_with_error: u32,
    ) -> u32 {
        FAULT_DUMP_MAGIC << MAGIC_SHIFT
            | (exception & EXCEPTION_MASK) << EXCEPTION_SHIFT
            | if hfsr_forced { HFSR_FORCED_BIT } else { 0 }
            | if hfsr_vecttbl { HFSR_VECTTBL_BIT } else { 0 }
            | (engines_with_error & ENGINE_MASK)
    }

    /// Checks the magic, distinguishing a real dump from whatever the scratch
    /// registers held before.
    pub fn is_valid(&self) -> bool {
        self.header >> MAGIC_SHIFT == FAULT_DUMP_MAGIC
    }

    /// Exception number active when the dump was taken.
    pub fn exception(&self) -> u32 {
        self.header >> EXCEPTION_SHIFT & EXCEPTION_MASK
    }

    pub fn hfsr_forced(&self) -> bool {
        self.header & HFSR_FORCED_BIT != 0
    }

    pub fn hfsr_vecttbl(&self) -> bool {
        self.header & HFSR_VECTTBL_BIT != 0
    }

    /// Bitmask of engines that had any error latched.
    pub fn engines_with_error(&self) -> u32 {
        self.header & ENGINE_MASK
    }

    /// The dump as scratch-register words, in write order.
    pub fn words(&self) -> [u32; FAULT_DUMP_WORDS] {
        [
            self.header,
            self.cfsr,
            self.mmfar,
            self.bfar,
            self.global_err_cause,
            self.global_err_address,
            self.engine_err_cause,
            self.pc,
        ]
    }
}

/// Supervisor services reachable from the unprivileged worker via the SVC
/// instruction. The SVC immediate selects the service.
pub mod svc {
    /// Log a message through the mailbox: arg0 = severity, arg1 = byte
    /// address, arg2 = byte count.
    pub const LOG_MESSAGE: u32 = 0x00;
    /// Clean and invalidate the entire data cache.
    pub const DCACHE_CLEAN_INVALIDATE: u32 = 0x01;
    /// Switch between the privileged and unprivileged contexts. arg0 carries
    /// the `TaskMessage` address from the worker to the supervisor.
    pub const TASK_SWITCH: u32 = 0xFF;
}

/// Outcome of one supervisor/worker call, written by the worker before
/// control returns.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskStatus {
    Ok,
    Failed,
}

/// Per-call data for an inference transfer. `buffer_table` is filled by the
/// supervisor; `cycle_count` is written back by the worker.
#[derive(Copy, Clone, Debug)]
pub struct InferenceCall {
    pub buffer_table: u64,
    pub cycle_count: u64,
}

/// Result slot for a capabilities transfer; the worker points it at its
/// capability blob, which outlives the call.
#[derive(Copy, Clone, Debug)]
pub struct CapabilitiesCall {
    pub data: *const u8,
    pub len: usize,
}

/// The request half of a `TaskMessage`: what the supervisor is asking the
/// worker to do, plus in/out data for the call.
#[derive(Copy, Clone, Debug)]
pub enum TaskRequest {
    Capabilities(CapabilitiesCall),
    Inference(InferenceCall),
    ProfilingEnable(ProfilingConfig),
    ProfilingDisable,
    PostInferenceCleanup,
}

/// The synchronous call record passed across the privilege boundary.
///
/// Stack-allocated by the supervisor for the duration of one call; the worker
/// reads and mutates it in place and never retains a reference past the call.
#[derive(Copy, Clone, Debug)]
pub struct TaskMessage {
    pub request: TaskRequest,
    pub status: TaskStatus,
}

impl TaskMessage {
    pub fn new(request: TaskRequest) -> Self {
        Self {
            request,
            status: TaskStatus::Failed,
        }
    }
}

/// Boot-time parameters handed to the worker. The startup code places this
/// record at the top of the worker's stack, above its initial context frame.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct TaskConfig {
    pub log_severity: LogSeverity,
    pub address_extend: u32,
}
