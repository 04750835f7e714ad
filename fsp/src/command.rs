//! The command/response ring.
//!
//! Commands that carry no message body (requests the device originates, and
//! the status responses to peer commands) are queued as packed words and
//! encoded into frames when the radio worker is clear to send.  Each word
//! packs either `request << 16` or `(response << 8) | status`.

use arraydeque::ArrayDeque;
use arrayvec::ArrayVec;

use crate::{CMD_QUERY, STATUS_OK};

pub const COMMAND_QUEUE_LENGTH: usize = 8;

/// Device identity and transfer progress reported by a QUERY response.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryInfo {
    pub offset: u16,
    pub length: u16,
    pub model: u32,
    pub serial: u32,
}

/// Ring of pending command words.  Mutated under the radio's command lock.
pub struct CommandQueue {
    queue: ArrayDeque<u32, COMMAND_QUEUE_LENGTH>,
}

impl CommandQueue {
    pub fn new() -> CommandQueue {
        CommandQueue {
            queue: ArrayDeque::new(),
        }
    }

    /// Queue a device-originated request frame.
    pub fn push_request(&mut self, opcode: u8) {
        self.push((opcode as u32) << 16);
    }

    /// Queue a response to a peer command.
    pub fn push_response(&mut self, opcode: u8, status: u8) {
        self.push(((opcode as u32) << 8) | status as u32);
    }

    fn push(&mut self, entry: u32) {
        if self.queue.push_back(entry).is_err() {
            log::warn!("command queue overflow; entry {entry:06x} dropped");
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Encode the next sendable command frame.
    ///
    /// OK responses other than QUERY are consumed without producing a frame;
    /// the peer learns of success implicitly from the transport ack.
    pub fn dequeue(&mut self, info: &QueryInfo) -> Option<ArrayVec<u8, 16>> {
        while let Some(entry) = self.queue.pop_front() {
            let mut frame = ArrayVec::new();

            let request = ((entry >> 16) & 0xff) as u8;
            if request != 0 {
                frame.push(request);
                return Some(frame);
            }

            let opcode = ((entry >> 8) & 0xff) as u8;
            let status = (entry & 0xff) as u8;
            if status != STATUS_OK {
                frame.push(status);
                frame.push(opcode);
                return Some(frame);
            }

            if opcode == CMD_QUERY {
                frame.push(STATUS_OK);
                frame.push(CMD_QUERY);
                frame.push(0x01);
                frame.extend(info.offset.to_be_bytes());
                frame.extend(info.length.to_be_bytes());
                frame.extend(info.model.to_be_bytes());
                frame.extend(info.serial.to_be_bytes());
                return Some(frame);
            }
        }
        None
    }
}
