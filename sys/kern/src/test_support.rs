// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared scaffolding for the host-side unit tests: queue storage, a
//! mailbox wired to it, and host-side framing helpers.

use npu_abi::{MessageHeader, MESSAGE_HEADER_SIZE};
use npu_mailbox::model::ModelHal;
use npu_mailbox::queue::Queue;
use npu_mailbox::Mailbox;
use zerocopy::{FromBytes, IntoBytes};

/// Builds a queue over leaked storage, host-initialized to `capacity`.
pub fn leak_queue(capacity: u32) -> Queue {
    let storage =
        vec![0u8; npu_abi::QUEUE_HEADER_SIZE + capacity as usize].leak();
    storage[..4].copy_from_slice(&capacity.to_le_bytes());
    unsafe { Queue::from_raw(storage.as_mut_ptr()).unwrap() }
}

pub fn mailbox(capacity: u32) -> Mailbox {
    Mailbox::from_queues(leak_queue(capacity), leak_queue(capacity))
}

/// Frames a message into a queue the way the host driver would.
pub fn host_push(hal: &mut ModelHal, q: &mut Queue, msg_type: u32, payload: &[u8]) {
    let header = MessageHeader {
        msg_type,
        length: payload.len() as u32,
    };
    q.write(hal, &[header.as_bytes(), payload]).unwrap();
}

/// Pops one framed message from a queue, host-side.
pub fn host_pop(hal: &mut ModelHal, q: &mut Queue) -> (MessageHeader, Vec<u8>) {
    let mut raw = [0u8; MESSAGE_HEADER_SIZE];
    q.read(hal, &mut raw).unwrap();
    let header = MessageHeader::read_from_bytes(&raw[..]).unwrap();
    let mut payload = vec![0u8; header.length as usize];
    q.read(hal, &mut payload).unwrap();
    (header, payload)
}
