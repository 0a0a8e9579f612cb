// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host <-> firmware mailbox: a pair of SPSC byte queues in shared memory
//! plus typed message framing on top.
//!
//! The firmware consumes the request queue and produces the response queue;
//! the host owns the complementary cursors. Full messages are atomic from
//! the reader's perspective because a writer only publishes its write cursor
//! after the complete message bytes are committed (see `queue`); partial
//! messages are never observable.
//!
//! All hardware access goes through the [`hal::Hal`] capability, so the same
//! code drives real silicon and the simulator in `model`.

#![cfg_attr(not(test), no_std)]

pub mod hal;
pub mod model;
pub mod queue;

use arrayvec::ArrayVec;
use zerocopy::{FromBytes, IntoBytes};

use hal::Hal;
use npu_abi::{
    ErrorResponse, ErrorStatus, InferenceResponse, InferenceStatus,
    LogSeverity, MailboxHeader, MessageHeader, MessageType, TextHeader,
    MESSAGE_HEADER_SIZE,
};
use queue::{Queue, QueueError};

/// Header plus up to three gathered payload parts per message.
const MAX_MESSAGE_PARTS: usize = 4;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MailboxError {
    /// The incoming payload is longer than the caller's buffer. The payload
    /// has been consumed and discarded so the queue stays framed.
    LengthExceeded { msg_type: u32, length: u32 },
    /// The outgoing message could never fit in the response queue, even
    /// empty. Reported instead of retrying forever.
    TooLarge { total: u32 },
    /// A queue address from the mailbox header is outside the MCU's 32-bit
    /// window.
    BadAddress,
    Queue(QueueError),
}

impl From<QueueError> for MailboxError {
    fn from(e: QueueError) -> Self {
        Self::Queue(e)
    }
}

pub struct Mailbox {
    request: Queue,
    response: Queue,
}

impl Mailbox {
    /// Builds the mailbox from the header the host placed at `header_addr`
    /// (read from the scratch register file at boot).
    ///
    /// # Safety
    ///
    /// `header_addr` must point at a live `MailboxHeader` whose queue
    /// addresses point at live queue structures; see `Queue::from_raw`.
    pub unsafe fn from_header<H: Hal>(
        hal: &mut H,
        header_addr: u32,
    ) -> Result<Self, MailboxError> {
        hal.invalidate_dcache_range(
            header_addr as usize,
            core::mem::size_of::<MailboxHeader>(),
        );
        let header =
            unsafe { (header_addr as *const MailboxHeader).read_unaligned() };

        let request = u32::try_from(header.request)
            .map_err(|_| MailboxError::BadAddress)?;
        let response = u32::try_from(header.response)
            .map_err(|_| MailboxError::BadAddress)?;

        hal.invalidate_dcache_range(
            request as usize,
            npu_abi::QUEUE_HEADER_SIZE,
        );
        hal.invalidate_dcache_range(
            response as usize,
            npu_abi::QUEUE_HEADER_SIZE,
        );
        Ok(Self {
            request: unsafe { Queue::from_raw(request as *mut u8)? },
            response: unsafe { Queue::from_raw(response as *mut u8)? },
        })
    }

    /// Builds the mailbox directly from two queues (simulator and tests).
    pub fn from_queues(request: Queue, response: Queue) -> Self {
        Self { request, response }
    }

    /// Direct access to the underlying queues, for the host side of a
    /// simulation. The firmware proper never touches cursors except through
    /// `read_message`/`write_message`.
    pub fn queues_mut(&mut self) -> (&mut Queue, &mut Queue) {
        (&mut self.request, &mut self.response)
    }

    /// Blocks until a request is available, then reads it: header first,
    /// then `length` payload bytes into `payload`.
    ///
    /// If there is any data in the queue at all, the full message is there;
    /// the host only publishes its write cursor once the complete message is
    /// written.
    pub fn read_message<H: Hal>(
        &mut self,
        hal: &mut H,
        payload: &mut [u8],
    ) -> Result<MessageHeader, MailboxError> {
        loop {
            self.request.invalidate_write_cursor(hal);
            if self.request.size() != 0 {
                break;
            }
            hal.wait_for_event();
        }

        let mut raw = [0u8; MESSAGE_HEADER_SIZE];
        self.request.read(hal, &mut raw)?;
        let header = MessageHeader::read_from_bytes(&raw[..])
            .unwrap_or(MessageHeader {
                msg_type: 0,
                length: 0,
            });

        if header.length as usize > payload.len() {
            // Drop the payload on the floor; leaving it would desync the
            // framing for every later message.
            self.request.skip(hal, header.length)?;
            return Err(MailboxError::LengthExceeded {
                msg_type: header.msg_type,
                length: header.length,
            });
        }

        self.request
            .read(hal, &mut payload[..header.length as usize])?;
        Ok(header)
    }

    /// Frames `parts` as one message and writes it to the response queue,
    /// then raises the host interrupt.
    ///
    /// Fails fast with `TooLarge` for a message that could never fit;
    /// otherwise retries until the host has drained enough space.
    pub fn write_message<H: Hal>(
        &mut self,
        hal: &mut H,
        msg_type: MessageType,
        parts: &[&[u8]],
    ) -> Result<(), MailboxError> {
        let length: u32 = parts.iter().map(|p| p.len() as u32).sum();
        let header = MessageHeader {
            msg_type: msg_type as u32,
            length,
        };

        let total = MESSAGE_HEADER_SIZE as u32 + length;
        if !self.response.can_ever_fit(total) {
            return Err(MailboxError::TooLarge { total });
        }

        let mut gathered: ArrayVec<&[u8], MAX_MESSAGE_PARTS> = ArrayVec::new();
        let header_bytes = header.as_bytes();
        gathered.push(header_bytes);
        for part in parts {
            gathered.push(part);
        }

        loop {
            match self.response.write(hal, &gathered) {
                Ok(()) => break,
                Err(QueueError::Full) => {
                    // Pick up whatever progress the host has made.
                    self.response.invalidate_read_cursor(hal);
                }
                Err(e) => return Err(e.into()),
            }
        }

        hal.raise_host_irq();
        Ok(())
    }

    pub fn send_pong<H: Hal>(&mut self, hal: &mut H) -> Result<(), MailboxError> {
        self.write_message(hal, MessageType::Pong, &[])
    }

    pub fn send_configure_profiling_ack<H: Hal>(
        &mut self,
        hal: &mut H,
    ) -> Result<(), MailboxError> {
        self.write_message(hal, MessageType::ConfigureProfilingAck, &[])
    }

    pub fn send_error_response<H: Hal>(
        &mut self,
        hal: &mut H,
        original_type: u32,
        status: ErrorStatus,
    ) -> Result<(), MailboxError> {
        let payload = ErrorResponse {
            original_type,
            status: status as u32,
        };
        self.write_message(hal, MessageType::ErrorResponse, &[payload.as_bytes()])
    }

    pub fn send_inference_response<H: Hal>(
        &mut self,
        hal: &mut H,
        status: InferenceStatus,
        user_token: u64,
        cycle_count: u64,
    ) -> Result<(), MailboxError> {
        let payload = InferenceResponse {
            user_token,
            status: status as u32,
            cycle_count,
        };
        self.write_message(
            hal,
            MessageType::InferenceResponse,
            &[payload.as_bytes()],
        )
    }

    pub fn send_capabilities_response<H: Hal>(
        &mut self,
        hal: &mut H,
        data: &[u8],
    ) -> Result<(), MailboxError> {
        self.write_message(hal, MessageType::CapabilitiesResponse, &[data])
    }

    /// Sends a `Text` log message: severity word, message bytes, NUL.
    pub fn send_text<H: Hal>(
        &mut self,
        hal: &mut H,
        severity: LogSeverity,
        msg: &[u8],
    ) -> Result<(), MailboxError> {
        let text = TextHeader {
            severity: severity as u32,
        };
        self.write_message(
            hal,
            MessageType::Text,
            &[text.as_bytes(), msg, &[0]],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelHal;
    use crate::queue::leak_queue;
    use npu_abi::QUEUE_HEADER_SIZE;
    use proptest::prelude::*;

    /// Host side of the protocol: frames a message straight into a queue,
    /// the way the kernel driver would.
    fn host_push(hal: &mut ModelHal, q: &mut Queue, msg_type: u32, payload: &[u8]) {
        let header = MessageHeader {
            msg_type,
            length: payload.len() as u32,
        };
        q.write(hal, &[header.as_bytes(), payload]).unwrap();
    }

    /// Host side: pops one message from the response queue.
    fn host_pop(hal: &mut ModelHal, q: &mut Queue) -> (MessageHeader, Vec<u8>) {
        let mut raw = [0u8; MESSAGE_HEADER_SIZE];
        q.read(hal, &mut raw).unwrap();
        let header = MessageHeader::read_from_bytes(&raw[..]).unwrap();
        let mut payload = vec![0u8; header.length as usize];
        q.read(hal, &mut payload).unwrap();
        (header, payload)
    }

    fn mailbox(capacity: u32) -> Mailbox {
        Mailbox::from_queues(leak_queue(capacity), leak_queue(capacity))
    }

    #[test]
    fn framing_round_trip() {
        let mut hal = ModelHal::new();
        let mut mb = mailbox(256);

        for len in [0usize, 1, 7, 100, 256 - MESSAGE_HEADER_SIZE - 1] {
            let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
            mb.write_message(&mut hal, MessageType::Text, &[&data]).unwrap();
            // Route the response back in as a request to exercise the read
            // path with the same bytes.
            let (header, payload) = {
                let (h, p) = host_pop(&mut hal, &mut mb.response);
                host_push(&mut hal, &mut mb.request, h.msg_type, &p);
                (h, p)
            };
            assert_eq!(header.length as usize, len);
            assert_eq!(payload, data);

            let mut buf = vec![0u8; 256];
            let echoed = mb.read_message(&mut hal, &mut buf).unwrap();
            assert_eq!({ echoed.msg_type }, MessageType::Text as u32);
            assert_eq!(echoed.length as usize, len);
            assert_eq!(&buf[..len], &data[..]);
        }
    }

    #[test]
    fn read_two_messages_in_a_row() {
        let mut hal = ModelHal::new();
        let mut mb = mailbox(128);

        host_push(
            &mut hal,
            &mut mb.request,
            MessageType::ConfigureProfilingAck as u32,
            &[],
        );
        host_push(&mut hal, &mut mb.request, MessageType::Ping as u32, &[]);

        let mut buf = [0u8; 64];
        let first = mb.read_message(&mut hal, &mut buf).unwrap();
        assert_eq!({ first.msg_type }, MessageType::ConfigureProfilingAck as u32);
        assert_eq!({ first.length }, 0);

        let second = mb.read_message(&mut hal, &mut buf).unwrap();
        assert_eq!({ second.msg_type }, MessageType::Ping as u32);
        assert_eq!({ second.length }, 0);

        // Both fully consumed: read has caught up with write.
        assert_eq!(mb.request.size(), 0);
        // Nothing leaked onto the response queue.
        assert_eq!(mb.response.size(), 0);
    }

    #[test]
    fn write_two_messages_in_a_row() {
        let mut hal = ModelHal::new();
        let mut mb = mailbox(128);
        let token = 0xABCD;

        mb.send_pong(&mut hal).unwrap();
        mb.send_inference_response(&mut hal, InferenceStatus::Ok, token, 99)
            .unwrap();
        assert_eq!(hal.host_irqs, 2);

        let (h1, p1) = host_pop(&mut hal, &mut mb.response);
        assert_eq!({ h1.msg_type }, MessageType::Pong as u32);
        assert!(p1.is_empty());

        let (h2, p2) = host_pop(&mut hal, &mut mb.response);
        assert_eq!({ h2.msg_type }, MessageType::InferenceResponse as u32);
        let resp = InferenceResponse::read_from_bytes(&p2[..]).unwrap();
        assert_eq!({ resp.user_token }, token);
        assert_eq!({ resp.status }, InferenceStatus::Ok as u32);
        assert_eq!({ resp.cycle_count }, 99);

        // The request queue was never touched.
        assert_eq!(mb.request.size(), 0);
    }

    #[test]
    fn message_order_is_fifo() {
        let mut hal = ModelHal::new();
        let mut mb = mailbox(64);

        host_push(&mut hal, &mut mb.request, MessageType::Delay as u32, &[1, 0, 0, 0]);
        host_push(&mut hal, &mut mb.request, MessageType::Ping as u32, &[]);

        let mut buf = [0u8; 16];
        let m1 = mb.read_message(&mut hal, &mut buf).unwrap();
        assert_eq!({ m1.msg_type }, MessageType::Delay as u32);
        assert_eq!(&buf[..4], &[1, 0, 0, 0]);
        let m2 = mb.read_message(&mut hal, &mut buf).unwrap();
        assert_eq!({ m2.msg_type }, MessageType::Ping as u32);
    }

    #[test]
    fn oversized_message_fails_fast() {
        let mut hal = ModelHal::new();
        let mut mb = mailbox(32);

        let big = [0u8; 64];
        let r = mb.write_message(&mut hal, MessageType::Text, &[&big]);
        assert_eq!(
            r,
            Err(MailboxError::TooLarge {
                total: MESSAGE_HEADER_SIZE as u32 + 64
            })
        );
        // Nothing was written and the host was not interrupted.
        assert_eq!(mb.response.size(), 0);
        assert_eq!(hal.host_irqs, 0);
    }

    #[test]
    fn payload_longer_than_buffer_is_rejected() {
        let mut hal = ModelHal::new();
        let mut mb = mailbox(128);

        host_push(&mut hal, &mut mb.request, MessageType::Text as u32, &[7; 32]);
        host_push(&mut hal, &mut mb.request, MessageType::Ping as u32, &[]);
        let mut small = [0u8; 8];
        let r = mb.read_message(&mut hal, &mut small);
        assert_eq!(
            r,
            Err(MailboxError::LengthExceeded {
                msg_type: MessageType::Text as u32,
                length: 32
            })
        );

        // The oversized payload was discarded, not left to corrupt the
        // framing: the next message still parses.
        let next = mb.read_message(&mut hal, &mut small).unwrap();
        assert_eq!({ next.msg_type }, MessageType::Ping as u32);
        assert_eq!(mb.request.size(), 0);
    }

    #[test]
    fn text_message_is_nul_terminated() {
        let mut hal = ModelHal::new();
        let mut mb = mailbox(128);

        mb.send_text(&mut hal, LogSeverity::Error, b"engine timeout").unwrap();
        let (h, p) = host_pop(&mut hal, &mut mb.response);
        assert_eq!({ h.msg_type }, MessageType::Text as u32);
        let text = TextHeader::read_from_bytes(&p[..4]).unwrap();
        assert_eq!({ text.severity }, LogSeverity::Error as u32);
        assert_eq!(&p[4..], b"engine timeout\0");
    }

    #[test]
    fn queue_header_is_two_cache_lines() {
        // The host lays the queues out with this assumption baked in.
        assert_eq!(QUEUE_HEADER_SIZE, 256);
    }

    proptest! {
        /// Any sequence of messages that individually fit round-trips
        /// byte-for-byte, in order, across arbitrary wraparound positions.
        #[test]
        fn round_trip_sequences(
            msgs in prop::collection::vec(
                prop::collection::vec(any::<u8>(), 0..48),
                1..20,
            )
        ) {
            let mut hal = ModelHal::new();
            let mut mb = mailbox(64);
            let mut buf = [0u8; 64];

            for msg in &msgs {
                host_push(
                    &mut hal,
                    &mut mb.request,
                    MessageType::Text as u32,
                    msg,
                );
                let header = mb.read_message(&mut hal, &mut buf).unwrap();
                prop_assert_eq!(header.length as usize, msg.len());
                prop_assert_eq!(&buf[..msg.len()], &msg[..]);
            }
            prop_assert_eq!(mb.request.size(), 0);
        }
    }
}
