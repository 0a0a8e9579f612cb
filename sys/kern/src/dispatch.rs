// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The supervisor's message loop.
//!
//! One request in, one of three things out: a typed response, a typed error
//! response, or (for hardware faults only) nothing ever again. Malformed
//! host input is never grounds for terminating; every recoverable problem
//! turns into an `ErrorResponse` and the loop continues.
//!
//! The loop body is a plain function over the HAL and the worker port so
//! the decision logic runs under host tests with a scripted worker.

use num_traits::FromPrimitive;

use npu_abi::{
    CapabilitiesCall, ErrorStatus, InferenceCall, InferenceRequest,
    InferenceStatus, LogSeverity, MessageType, ProfilingConfig, TaskMessage,
    TaskRequest, TaskStatus,
};
use npu_mailbox::{hal::Hal, Mailbox, MailboxError};
use npu_regs::priv_block;
use zerocopy::FromBytes;

use crate::klog::Logger;
use crate::profiling;
use crate::task::TaskPort;

/// Largest request payload the loop accepts; sized for the profiling
/// configuration, the biggest message the host sends.
pub const MAX_PAYLOAD: usize = 64;

pub struct DispatchState {
    /// Set once the worker's start-up transfer has completed. Requests that
    /// need the worker are rejected with `InvalidState` until then.
    pub task_running: bool,
    /// Whether a profiling session is active (scenario assertions and the
    /// disable path use this).
    pub profiling_active: bool,
    pub logger: Logger,
}

impl DispatchState {
    pub fn new(logger: Logger) -> Self {
        Self {
            task_running: false,
            profiling_active: false,
            logger,
        }
    }
}

/// Runs the loop forever.
pub fn run<H: Hal, P: TaskPort>(
    hal: &mut H,
    mailbox: &mut Mailbox,
    port: &mut P,
    state: &mut DispatchState,
) -> ! {
    loop {
        step(hal, mailbox, port, state);
    }
}

/// Receives and fully handles exactly one message.
pub fn step<H: Hal, P: TaskPort>(
    hal: &mut H,
    mailbox: &mut Mailbox,
    port: &mut P,
    state: &mut DispatchState,
) {
    let mut payload = [0u8; MAX_PAYLOAD];
    let header = match mailbox.read_message(hal, &mut payload) {
        Ok(header) => header,
        Err(MailboxError::LengthExceeded { msg_type, length }) => {
            state.logger.log(
                hal,
                mailbox,
                LogSeverity::Error,
                format_args!("oversized message: type={msg_type} len={length}"),
            );
            mailbox
                .send_error_response(hal, msg_type, ErrorStatus::InvalidMessage)
                .ok();
            return;
        }
        Err(_) => return,
    };

    let Some(msg_type) = MessageType::from_u32(header.msg_type) else {
        let (raw_msg_type, raw_length) = (header.msg_type, header.length);
        state.logger.log(
            hal,
            mailbox,
            LogSeverity::Error,
            format_args!(
                "invalid message type: type={} length={}",
                raw_msg_type, raw_length
            ),
        );
        mailbox
            .send_error_response(
                hal,
                header.msg_type,
                ErrorStatus::InvalidMessage,
            )
            .ok();
        return;
    };

    if !state.task_running
        && matches!(
            msg_type,
            MessageType::CapabilitiesRequest
                | MessageType::ConfigureProfiling
                | MessageType::InferenceRequest
        )
    {
        state.logger.log(
            hal,
            mailbox,
            LogSeverity::Error,
            format_args!("unable to process message: task not running"),
        );
        mailbox
            .send_error_response(hal, header.msg_type, ErrorStatus::InvalidState)
            .ok();
        return;
    }

    let payload = &payload[..header.length as usize];
    match msg_type {
        MessageType::Delay => {
            let Ok(ticks) = <[u8; 4]>::try_from(payload) else {
                invalid_message(hal, mailbox, header.msg_type);
                return;
            };
            hal.delay_ticks(u32::from_le_bytes(ticks));
        }

        MessageType::Ping => {
            mailbox.send_pong(hal).ok();
        }

        MessageType::CapabilitiesRequest => {
            let mut msg =
                TaskMessage::new(TaskRequest::Capabilities(CapabilitiesCall {
                    data: core::ptr::null(),
                    len: 0,
                }));
            if port.send(&mut msg) != TaskStatus::Ok {
                state.logger.log(
                    hal,
                    mailbox,
                    LogSeverity::Error,
                    format_args!("failed to get capabilities"),
                );
                mailbox
                    .send_error_response(
                        hal,
                        header.msg_type,
                        ErrorStatus::Failed,
                    )
                    .ok();
                return;
            }
            if let TaskRequest::Capabilities(call) = msg.request {
                // The worker handed us a view of its (static) blob, valid
                // beyond the call by contract.
                let data =
                    unsafe { core::slice::from_raw_parts(call.data, call.len) };
                mailbox.send_capabilities_response(hal, data).ok();
            }
        }

        MessageType::ConfigureProfiling => {
            let Ok(config) = ProfilingConfig::read_from_bytes(payload) else {
                invalid_message(hal, mailbox, header.msg_type);
                return;
            };
            if !profiling::counter_selection_valid(&config) {
                state.logger.log(
                    hal,
                    mailbox,
                    LogSeverity::Error,
                    format_args!(
                        "invalid counter count in profiling config: {}",
                        { config.num_hw_counters }
                    ),
                );
                invalid_message(hal, mailbox, header.msg_type);
                return;
            }

            let enable = config.enabled();
            let mut msg = TaskMessage::new(if enable {
                TaskRequest::ProfilingEnable(config)
            } else {
                TaskRequest::ProfilingDisable
            });
            if enable {
                profiling::reset_and_start(hal);
            } else {
                profiling::stop(hal);
            }
            if port.send(&mut msg) != TaskStatus::Ok {
                state.logger.log(
                    hal,
                    mailbox,
                    LogSeverity::Error,
                    format_args!("configure profiling request failed"),
                );
                mailbox
                    .send_error_response(
                        hal,
                        header.msg_type,
                        ErrorStatus::Failed,
                    )
                    .ok();
                return;
            }
            state.profiling_active = enable;
            mailbox.send_configure_profiling_ack(hal).ok();
        }

        MessageType::InferenceRequest => {
            let Ok(request) = InferenceRequest::read_from_bytes(payload) else {
                invalid_message(hal, mailbox, header.msg_type);
                return;
            };

            let mut msg =
                TaskMessage::new(TaskRequest::Inference(InferenceCall {
                    buffer_table: request.buffer_table,
                    cycle_count: 0,
                }));

            // The host has just written the command stream and the buffer
            // table; make sure the worker reads what it wrote, and that our
            // stale lines don't mask it.
            hal.clean_invalidate_dcache();
            let status = port.send(&mut msg);
            hal.clean_invalidate_dcache();

            let cycle_count = match msg.request {
                TaskRequest::Inference(call) => call.cycle_count,
                _ => 0,
            };
            let status = match status {
                TaskStatus::Ok => InferenceStatus::Ok,
                TaskStatus::Failed => InferenceStatus::Error,
            };
            mailbox
                .send_inference_response(
                    hal,
                    status,
                    request.user_token,
                    cycle_count,
                )
                .ok();

            // Scrub the scratch SRAM between inferences so one job's
            // tensors can't leak into the next.
            clear_sram(hal);

            let mut cleanup =
                TaskMessage::new(TaskRequest::PostInferenceCleanup);
            port.send(&mut cleanup);
        }

        // Host-bound types showing up on the request queue are host bugs;
        // answer them rather than silently dropping.
        MessageType::InferenceResponse
        | MessageType::Text
        | MessageType::ConfigureProfilingAck
        | MessageType::Pong
        | MessageType::CapabilitiesResponse
        | MessageType::ErrorResponse => {
            state.logger.log(
                hal,
                mailbox,
                LogSeverity::Error,
                format_args!(
                    "invalid message type: type={} length={}",
                    { header.msg_type }, { header.length }
                ),
            );
            mailbox
                .send_error_response(
                    hal,
                    header.msg_type,
                    ErrorStatus::InvalidMessage,
                )
                .ok();
        }
    }
}

fn invalid_message<H: Hal>(hal: &mut H, mailbox: &mut Mailbox, msg_type: u32) {
    mailbox
        .send_error_response(hal, msg_type, ErrorStatus::InvalidMessage)
        .ok();
}

/// Kicks the SRAM scrubber and waits for it to finish. Also used at boot
/// before the first request is accepted.
pub(crate) fn clear_sram<H: Hal>(hal: &mut H) {
    hal.write_reg(priv_block::CLEAR_SRAM, priv_block::CLEAR_SRAM_GO);
    while hal.read_reg(priv_block::CLEAR_SRAM) & priv_block::CLEAR_SRAM_BUSY != 0
    {
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{host_pop, host_push, mailbox};
    use npu_abi::{ErrorResponse, InferenceResponse, MessageHeader};
    use npu_mailbox::model::ModelHal;
    use zerocopy::IntoBytes;

    /// Scripted worker standing in for the SVC port.
    struct FakeWorker {
        caps: &'static [u8],
        inference: Result<u64, ()>,
        fail_all: bool,
        calls: Vec<&'static str>,
    }

    impl FakeWorker {
        fn new() -> Self {
            Self {
                caps: b"npu-caps-v1",
                inference: Ok(777),
                fail_all: false,
                calls: Vec::new(),
            }
        }
    }

    impl TaskPort for FakeWorker {
        fn start(&mut self, _config: *const npu_abi::TaskConfig) -> TaskStatus {
            TaskStatus::Ok
        }

        fn send(&mut self, msg: &mut TaskMessage) -> TaskStatus {
            if self.fail_all {
                msg.status = TaskStatus::Failed;
                return TaskStatus::Failed;
            }
            msg.status = TaskStatus::Ok;
            match &mut msg.request {
                TaskRequest::Capabilities(call) => {
                    self.calls.push("caps");
                    call.data = self.caps.as_ptr();
                    call.len = self.caps.len();
                }
                TaskRequest::Inference(call) => {
                    self.calls.push("inference");
                    match self.inference {
                        Ok(cycles) => call.cycle_count = cycles,
                        Err(()) => msg.status = TaskStatus::Failed,
                    }
                }
                TaskRequest::ProfilingEnable(_) => self.calls.push("prof-on"),
                TaskRequest::ProfilingDisable => self.calls.push("prof-off"),
                TaskRequest::PostInferenceCleanup => self.calls.push("cleanup"),
            }
            msg.status
        }
    }

    fn running_state() -> DispatchState {
        let mut state = DispatchState::new(Logger::new(LogSeverity::Panic));
        state.task_running = true;
        state
    }

    fn pop_response(
        hal: &mut ModelHal,
        mb: &mut Mailbox,
    ) -> (MessageHeader, Vec<u8>) {
        let (_, response) = mb.queues_mut();
        host_pop(hal, response)
    }

    fn response_empty(mb: &mut Mailbox) -> bool {
        let (_, response) = mb.queues_mut();
        response.size() == 0
    }

    fn push_request(
        hal: &mut ModelHal,
        mb: &mut Mailbox,
        ty: MessageType,
        payload: &[u8],
    ) {
        let (request, _) = mb.queues_mut();
        host_push(hal, request, ty as u32, payload);
    }

    #[test]
    fn ping_pong() {
        let mut hal = ModelHal::new();
        let mut mb = mailbox(256);
        let mut worker = FakeWorker::new();
        let mut state = running_state();

        push_request(&mut hal, &mut mb, MessageType::Ping, &[]);
        step(&mut hal, &mut mb, &mut worker, &mut state);

        let (h, p) = pop_response(&mut hal, &mut mb);
        assert_eq!({ h.msg_type }, MessageType::Pong as u32);
        assert!(p.is_empty());
        assert!(response_empty(&mut mb), "exactly one response");
        // Ping never involves the worker.
        assert!(worker.calls.is_empty());
    }

    #[test]
    fn requests_rejected_before_task_start() {
        for ty in [
            MessageType::CapabilitiesRequest,
            MessageType::ConfigureProfiling,
            MessageType::InferenceRequest,
        ] {
            let mut hal = ModelHal::new();
            let mut mb = mailbox(256);
            let mut worker = FakeWorker::new();
            let mut state =
                DispatchState::new(Logger::new(LogSeverity::Panic));

            // Payload contents don't matter; the state check comes first.
            push_request(&mut hal, &mut mb, ty, &[0; 44]);
            step(&mut hal, &mut mb, &mut worker, &mut state);

            let (h, p) = pop_response(&mut hal, &mut mb);
            assert_eq!({ h.msg_type }, MessageType::ErrorResponse as u32);
            let err = ErrorResponse::read_from_bytes(&p[..]).unwrap();
            assert_eq!({ err.original_type }, ty as u32);
            assert_eq!({ err.status }, ErrorStatus::InvalidState as u32);
            assert!(worker.calls.is_empty(), "worker must not be invoked");
        }
    }

    #[test]
    fn ping_works_before_task_start() {
        let mut hal = ModelHal::new();
        let mut mb = mailbox(256);
        let mut worker = FakeWorker::new();
        let mut state = DispatchState::new(Logger::new(LogSeverity::Panic));

        push_request(&mut hal, &mut mb, MessageType::Ping, &[]);
        step(&mut hal, &mut mb, &mut worker, &mut state);
        let (h, _) = pop_response(&mut hal, &mut mb);
        assert_eq!({ h.msg_type }, MessageType::Pong as u32);
    }

    #[test]
    fn capabilities_forwarded() {
        let mut hal = ModelHal::new();
        let mut mb = mailbox(256);
        let mut worker = FakeWorker::new();
        let mut state = running_state();

        push_request(&mut hal, &mut mb, MessageType::CapabilitiesRequest, &[]);
        step(&mut hal, &mut mb, &mut worker, &mut state);

        let (h, p) = pop_response(&mut hal, &mut mb);
        assert_eq!({ h.msg_type }, MessageType::CapabilitiesResponse as u32);
        assert_eq!(p, b"npu-caps-v1");
        assert_eq!(worker.calls, ["caps"]);
    }

    #[test]
    fn inference_round_trip() {
        let mut hal = ModelHal::new();
        let mut mb = mailbox(256);
        let mut worker = FakeWorker::new();
        let mut state = running_state();

        let request = npu_abi::InferenceRequest {
            user_token: 0xFEED_BEEF,
            buffer_table: 0x7000_0000,
        };
        push_request(
            &mut hal,
            &mut mb,
            MessageType::InferenceRequest,
            request.as_bytes(),
        );
        step(&mut hal, &mut mb, &mut worker, &mut state);

        let (h, p) = pop_response(&mut hal, &mut mb);
        assert_eq!({ h.msg_type }, MessageType::InferenceResponse as u32);
        let resp = InferenceResponse::read_from_bytes(&p[..]).unwrap();
        assert_eq!({ resp.user_token }, 0xFEED_BEEF);
        assert_eq!({ resp.status }, InferenceStatus::Ok as u32);
        assert_eq!({ resp.cycle_count }, 777);

        // Handoff hygiene: caches flushed around the worker call, SRAM
        // scrubbed, post-inference transfer issued.
        assert_eq!(hal.full_cache_ops, 2);
        assert_eq!(worker.calls, ["inference", "cleanup"]);
        assert!(response_empty(&mut mb), "exactly one response");
    }

    #[test]
    fn failed_inference_reports_error_status() {
        let mut hal = ModelHal::new();
        let mut mb = mailbox(256);
        let mut worker = FakeWorker::new();
        worker.inference = Err(());
        let mut state = running_state();

        let request = npu_abi::InferenceRequest {
            user_token: 7,
            buffer_table: 0,
        };
        push_request(
            &mut hal,
            &mut mb,
            MessageType::InferenceRequest,
            request.as_bytes(),
        );
        step(&mut hal, &mut mb, &mut worker, &mut state);

        let (h, p) = pop_response(&mut hal, &mut mb);
        assert_eq!({ h.msg_type }, MessageType::InferenceResponse as u32);
        let resp = InferenceResponse::read_from_bytes(&p[..]).unwrap();
        assert_eq!({ resp.status }, InferenceStatus::Error as u32);
        // An operation failure is a response, not an error response, and
        // the loop keeps going.
        assert_eq!(worker.calls, ["inference", "cleanup"]);
    }

    #[test]
    fn profiling_enable_and_disable() {
        let mut hal = ModelHal::new();
        let mut mb = mailbox(256);
        let mut worker = FakeWorker::new();
        let mut state = running_state();

        let config = ProfilingConfig {
            enable: 1,
            buffer_address: 0x6800_0000,
            buffer_size: 4096,
            num_hw_counters: 2,
            hw_counters: [0; 6],
        };
        push_request(
            &mut hal,
            &mut mb,
            MessageType::ConfigureProfiling,
            config.as_bytes(),
        );
        step(&mut hal, &mut mb, &mut worker, &mut state);

        let (h, _) = pop_response(&mut hal, &mut mb);
        assert_eq!({ h.msg_type }, MessageType::ConfigureProfilingAck as u32);
        assert!(state.profiling_active);
        assert_eq!(
            hal.reg(npu_regs::dwt::CTRL) & npu_regs::dwt::CTRL_CYCCNTENA,
            1,
            "cycle counter running"
        );

        let config = ProfilingConfig {
            enable: 0,
            ..config
        };
        push_request(
            &mut hal,
            &mut mb,
            MessageType::ConfigureProfiling,
            config.as_bytes(),
        );
        step(&mut hal, &mut mb, &mut worker, &mut state);

        let (h, _) = pop_response(&mut hal, &mut mb);
        assert_eq!({ h.msg_type }, MessageType::ConfigureProfilingAck as u32);
        assert!(!state.profiling_active);
        assert_eq!(
            hal.reg(npu_regs::dwt::CTRL) & npu_regs::dwt::CTRL_CYCCNTENA,
            0,
            "cycle counter stopped"
        );
        assert_eq!(worker.calls, ["prof-on", "prof-off"]);
    }

    #[test]
    fn out_of_range_counter_count_rejected() {
        let mut hal = ModelHal::new();
        let mut mb = mailbox(256);
        let mut worker = FakeWorker::new();
        let mut state = running_state();

        let config = ProfilingConfig {
            enable: 1,
            buffer_address: 0,
            buffer_size: 0,
            num_hw_counters: npu_abi::PROFILING_MAX_HW_COUNTERS + 1,
            hw_counters: [0; 6],
        };
        push_request(
            &mut hal,
            &mut mb,
            MessageType::ConfigureProfiling,
            config.as_bytes(),
        );
        step(&mut hal, &mut mb, &mut worker, &mut state);

        let (h, p) = pop_response(&mut hal, &mut mb);
        assert_eq!({ h.msg_type }, MessageType::ErrorResponse as u32);
        let err = ErrorResponse::read_from_bytes(&p[..]).unwrap();
        assert_eq!({ err.status }, ErrorStatus::InvalidMessage as u32);

        // Profiling state untouched: worker never saw the request and the
        // counter was never started.
        assert!(!state.profiling_active);
        assert!(worker.calls.is_empty());
        assert_eq!(
            hal.reg(npu_regs::dwt::CTRL) & npu_regs::dwt::CTRL_CYCCNTENA,
            0
        );
    }

    #[test]
    fn unknown_type_gets_error_response() {
        let mut hal = ModelHal::new();
        let mut mb = mailbox(256);
        let mut worker = FakeWorker::new();
        let mut state = running_state();

        let (request, _) = mb.queues_mut();
        host_push(&mut hal, request, 0x55AA, &[1, 2, 3]);
        step(&mut hal, &mut mb, &mut worker, &mut state);

        let (h, p) = pop_response(&mut hal, &mut mb);
        assert_eq!({ h.msg_type }, MessageType::ErrorResponse as u32);
        let err = ErrorResponse::read_from_bytes(&p[..]).unwrap();
        assert_eq!({ err.original_type }, 0x55AA);
        assert_eq!({ err.status }, ErrorStatus::InvalidMessage as u32);
    }

    #[test]
    fn truncated_payload_rejected() {
        let mut hal = ModelHal::new();
        let mut mb = mailbox(256);
        let mut worker = FakeWorker::new();
        let mut state = running_state();

        // An inference request with half a payload.
        push_request(&mut hal, &mut mb, MessageType::InferenceRequest, &[0; 8]);
        step(&mut hal, &mut mb, &mut worker, &mut state);

        let (h, p) = pop_response(&mut hal, &mut mb);
        assert_eq!({ h.msg_type }, MessageType::ErrorResponse as u32);
        let err = ErrorResponse::read_from_bytes(&p[..]).unwrap();
        assert_eq!({ err.status }, ErrorStatus::InvalidMessage as u32);
        assert!(worker.calls.is_empty());
    }

    #[test]
    fn delay_busy_waits_and_sends_nothing() {
        let mut hal = ModelHal::new();
        let mut mb = mailbox(256);
        let mut worker = FakeWorker::new();
        let mut state = running_state();

        push_request(
            &mut hal,
            &mut mb,
            MessageType::Delay,
            &500u32.to_le_bytes(),
        );
        step(&mut hal, &mut mb, &mut worker, &mut state);

        assert_eq!(hal.delayed_ticks, 500);
        assert!(response_empty(&mut mb));
    }

    #[test]
    fn worker_failure_on_capabilities_is_reported() {
        let mut hal = ModelHal::new();
        let mut mb = mailbox(256);
        let mut worker = FakeWorker::new();
        worker.fail_all = true;
        let mut state = running_state();

        push_request(&mut hal, &mut mb, MessageType::CapabilitiesRequest, &[]);
        step(&mut hal, &mut mb, &mut worker, &mut state);

        let (h, p) = pop_response(&mut hal, &mut mb);
        assert_eq!({ h.msg_type }, MessageType::ErrorResponse as u32);
        let err = ErrorResponse::read_from_bytes(&p[..]).unwrap();
        assert_eq!({ err.status }, ErrorStatus::Failed as u32);
    }
}
