//! The message engine.
//!
//! One message is in flight at a time.  The engine owns the message buffer
//! (digest header plus payload area) and advances through a single framing
//! cycle: `Ready → Receiving → Received → Processing → Sending → Ready`.
//! Frames arrive as raw attribute writes via [`Engine::handle_write`]; the
//! outbound side is pumped chunk by chunk via [`Engine::next_chunk`], one
//! frame per indication slot.
//!
//! The engine never talks to a radio and holds no lock; the runtime wraps it
//! in a mutex and routes the outcomes.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;

use arrayvec::{ArrayString, ArrayVec};
use minicbor::{Decoder, Encoder};
use sha2::{Digest, Sha256};

use crate::cbor;
use crate::{
    CMD_CONTINUE_MESSAGE, CMD_QUERY, CMD_RESET, CMD_START_MESSAGE, DIGEST_LENGTH,
    ENVELOPE_OVERHEAD, ERROR_BAD_CHECKSUM, ERROR_BAD_COMMAND, ERROR_BUFFER_OVERRUN, ERROR_BUSY,
    ERROR_MISSING_MESSAGE, MAX_FRAME, MAX_FRAME_BODY, MAX_MESSAGE_SIZE, MAX_METHOD_LENGTH,
    MAX_WRITE, STATUS_OK,
};

/// Capacity of the message buffer: digest header, payload, reply framing.
pub const BUFFER_SIZE: usize = MAX_MESSAGE_SIZE + ENVELOPE_OVERHEAD;

/// Error code of the automatic reply sent when no panel accepts a message.
const NOT_READY_CODE: u32 = 2;
const NOT_READY_MESSAGE: &str = "NOT READY";

/// Longest message accepted by `reply_error`.
const MAX_ERROR_MESSAGE: usize = 128;

/// A bounded method name (1..=31 bytes of UTF-8).
pub type MethodName = ArrayString<{ MAX_METHOD_LENGTH - 1 }>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageState {
    /// Nothing in flight; the buffer is free for a new receive.
    Ready,
    /// Reassembling an inbound message.
    Receiving,
    /// Inbound message verified and decoded, not yet claimed by a panel.
    Received,
    /// A panel owns the message and will reply.
    Processing,
    /// An outbound message is being chunked to the peer.
    Sending,
}

/// A `(status, opcode)` pair to report back to the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: u8,
    pub opcode: u8,
}

/// A verified, decoded inbound message, detached from the buffer so it can
/// travel through an event queue.
#[derive(Clone, Debug)]
pub struct IncomingMessage {
    /// Device-assigned id the panel replies with.  Distinct from the peer's
    /// `id` field, which only resurfaces inside the reply payload.
    pub id: u32,
    pub method: MethodName,
    /// Raw CBOR of the `params` map or array.
    pub params: Vec<u8>,
}

/// What a single attribute write amounted to.
#[derive(Clone, Debug)]
pub enum FrameOutcome {
    /// State advanced (or the write was ignored); nothing to report.
    None,
    /// Queue this response to the peer.
    Respond(Response),
    /// A full message was verified; hand it to the focused panel.
    Received(IncomingMessage),
}

pub struct Engine {
    state: MessageState,
    data: Box<[u8]>,
    /// Receive: bytes filled so far.  Send: bytes handed to the transport.
    offset: usize,
    /// Total message length, digest included.
    length: usize,
    /// Device-assigned id of the in-flight message; 0 when none.
    id: u32,
    /// The peer's `id` field, echoed in the reply payload.
    reply_id: u32,
    next_id: u32,
}

impl Engine {
    pub fn new() -> Engine {
        Engine {
            state: MessageState::Ready,
            data: vec![0u8; BUFFER_SIZE].into_boxed_slice(),
            offset: 0,
            length: 0,
            id: 0,
            reply_id: 0,
            next_id: 1,
        }
    }

    pub fn state(&self) -> MessageState {
        self.state
    }

    /// Transfer progress as reported by a QUERY response.
    pub fn progress(&self) -> (u16, u16) {
        (self.offset as u16, self.length as u16)
    }

    /// Drop all in-flight state, e.g. on a fresh link-layer connection.
    pub fn clear(&mut self) {
        self.reply_id = 0;
        self.reset();
    }

    fn reset(&mut self) {
        self.state = MessageState::Ready;
        self.offset = 0;
        self.length = 0;
    }

    /// Process one inbound attribute write.
    pub fn handle_write(&mut self, req: &[u8]) -> FrameOutcome {
        if req.is_empty() {
            return respond(ERROR_BUFFER_OVERRUN, 0);
        }
        if req.len() > MAX_WRITE {
            return respond(ERROR_BUFFER_OVERRUN, req[0]);
        }

        match req[0] {
            CMD_QUERY => respond(STATUS_OK, CMD_QUERY),

            CMD_RESET => {
                if !matches!(self.state, MessageState::Ready | MessageState::Receiving) {
                    return respond(ERROR_BUSY, CMD_RESET);
                }
                self.clear();
                FrameOutcome::None
            }

            CMD_START_MESSAGE => self.handle_start(&req[1..]),
            CMD_CONTINUE_MESSAGE => self.handle_continue(&req[1..]),

            opcode => respond(ERROR_BAD_COMMAND, opcode),
        }
    }

    fn handle_start(&mut self, body: &[u8]) -> FrameOutcome {
        if self.state != MessageState::Ready {
            return respond(ERROR_BUSY, CMD_START_MESSAGE);
        }
        if body.len() < 2 {
            return respond(ERROR_BUFFER_OVERRUN, CMD_START_MESSAGE);
        }

        let length = u16::from_be_bytes([body[0], body[1]]) as usize;
        let chunk = &body[2..];

        if length == 0 || chunk.is_empty() || self.offset != 0 {
            return respond(ERROR_MISSING_MESSAGE, CMD_START_MESSAGE);
        }
        if length > BUFFER_SIZE || chunk.len() > length {
            self.reset();
            return respond(ERROR_BUFFER_OVERRUN, CMD_START_MESSAGE);
        }

        self.data[..chunk.len()].copy_from_slice(chunk);
        self.length = length;
        self.offset = chunk.len();
        self.state = MessageState::Receiving;

        if self.offset == self.length {
            self.process_message()
        } else {
            FrameOutcome::None
        }
    }

    fn handle_continue(&mut self, body: &[u8]) -> FrameOutcome {
        if self.state != MessageState::Receiving {
            return respond(ERROR_BUSY, CMD_CONTINUE_MESSAGE);
        }
        if body.len() < 2 {
            return respond(ERROR_BUFFER_OVERRUN, CMD_CONTINUE_MESSAGE);
        }

        let offset = u16::from_be_bytes([body[0], body[1]]) as usize;
        let chunk = &body[2..];

        if self.offset == 0 || chunk.is_empty() || offset != self.offset {
            self.reset();
            return respond(ERROR_MISSING_MESSAGE, CMD_CONTINUE_MESSAGE);
        }
        if self.offset + chunk.len() > self.length {
            self.reset();
            return respond(ERROR_BUFFER_OVERRUN, CMD_CONTINUE_MESSAGE);
        }

        self.data[offset..offset + chunk.len()].copy_from_slice(chunk);
        self.offset += chunk.len();

        if self.offset == self.length {
            self.process_message()
        } else {
            FrameOutcome::None
        }
    }

    /// The reassembly is complete: verify the envelope and decode the
    /// payload.
    fn process_message(&mut self) -> FrameOutcome {
        self.id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        if self.length < DIGEST_LENGTH {
            self.reset();
            return respond(ERROR_MISSING_MESSAGE, CMD_START_MESSAGE);
        }

        let digest = Sha256::digest(&self.data[DIGEST_LENGTH..self.length]);
        if digest.as_slice() != &self.data[..DIGEST_LENGTH] {
            self.reset();
            return respond(ERROR_BAD_CHECKSUM, CMD_START_MESSAGE);
        }

        match self.parse_payload() {
            Some((reply_id, method, params)) => {
                log::debug!("<<< id={} method={}", self.id, method.as_str());
                self.reply_id = reply_id;
                let message = IncomingMessage {
                    id: self.id,
                    method,
                    params: self.data[params].to_vec(),
                };
                self.state = MessageState::Received;
                FrameOutcome::Received(message)
            }
            None => {
                log::warn!("malformed message payload; dropped");
                self.reset();
                FrameOutcome::None
            }
        }
    }

    /// Validate `{id, method, params}` and locate the raw params item.
    fn parse_payload(&self) -> Option<(u32, MethodName, Range<usize>)> {
        let payload = &self.data[DIGEST_LENGTH..self.length];
        let root = Decoder::new(payload);

        let mut value = cbor::follow_key(&root, "method")?;
        let name = cbor::str_value(&mut value)?;
        if name.is_empty() {
            return None;
        }
        let mut method = MethodName::new();
        for ch in name.chars() {
            // Over-long names are truncated, as the original wire tooling did.
            if method.try_push(ch).is_err() {
                break;
            }
        }

        let mut value = cbor::follow_key(&root, "params")?;
        if !cbor::is_container(&value) {
            return None;
        }
        let range = cbor::item_range(&mut value)?;
        let params = DIGEST_LENGTH + range.start..DIGEST_LENGTH + range.end;

        let mut value = cbor::follow_key(&root, "id")?;
        let id = cbor::uint_value(&mut value)?;
        if id == 0 || id > 0x7fff_ffff {
            return None;
        }

        Some((id as u32, method, params))
    }

    /// Claim the received message for processing.  Called when a panel
    /// accepted the Message event.
    pub fn begin_processing(&mut self) -> bool {
        if self.state != MessageState::Received {
            return false;
        }
        self.state = MessageState::Processing;
        true
    }

    /// No panel accepted the message; turn it into the NOT-READY error
    /// reply.  Returns true when the reply is staged for sending.
    pub fn reject(&mut self) -> bool {
        if self.state != MessageState::Received {
            return false;
        }
        self.stage_reply(ReplyBody::Error {
            code: NOT_READY_CODE,
            message: NOT_READY_MESSAGE,
        })
    }

    /// Reply to message `id` with a CBOR-encoded result.
    pub fn reply(&mut self, id: u32, result: &[u8]) -> bool {
        if id == 0
            || id != self.id
            || self.state != MessageState::Processing
            || result.len() > MAX_MESSAGE_SIZE
        {
            log::warn!("wrong reply: id={} msg.id={} state={:?}", id, self.id, self.state);
            return false;
        }
        self.stage_reply(ReplyBody::Result(result))
    }

    /// Reply to message `id` with an `error: {code, message}` payload.
    pub fn reply_error(&mut self, id: u32, code: u32, message: &str) -> bool {
        if id == 0 || message.len() > MAX_ERROR_MESSAGE {
            return false;
        }
        if id != self.id || self.state != MessageState::Processing {
            log::warn!("wrong error reply: id={} msg.id={} state={:?}", id, self.id, self.state);
            return false;
        }
        self.stage_reply(ReplyBody::Error { code, message })
    }

    fn stage_reply(&mut self, body: ReplyBody<'_>) -> bool {
        let reply_id = self.reply_id;
        let encoded = match encode_reply(&mut self.data[DIGEST_LENGTH..], reply_id, body) {
            Ok(n) => n,
            Err(OutOfSpace) => {
                log::warn!("reply does not fit the message buffer");
                return false;
            }
        };

        log::debug!(">>> id={} reply_id={}", self.id, reply_id);

        let digest = Sha256::digest(&self.data[DIGEST_LENGTH..DIGEST_LENGTH + encoded]);
        self.data[..DIGEST_LENGTH].copy_from_slice(&digest);

        self.length = DIGEST_LENGTH + encoded;
        self.offset = 0;
        self.id = 0;
        self.state = MessageState::Sending;
        true
    }

    /// Build the next outbound frame of the staged message.  One frame per
    /// indication slot; the engine returns to Ready once the last chunk has
    /// been handed over.
    pub fn next_chunk(&mut self) -> Option<ArrayVec<u8, MAX_FRAME>> {
        if self.state != MessageState::Sending {
            return None;
        }

        let take = (self.length - self.offset).min(MAX_FRAME_BODY);
        let mut frame = ArrayVec::new();
        if self.offset == 0 {
            frame.push(CMD_START_MESSAGE);
            frame.extend((self.length as u16).to_be_bytes());
        } else {
            frame.push(CMD_CONTINUE_MESSAGE);
            frame.extend((self.offset as u16).to_be_bytes());
        }
        frame
            .try_extend_from_slice(&self.data[self.offset..self.offset + take])
            .unwrap();
        self.offset += take;

        if self.offset == self.length {
            self.reset();
        }
        Some(frame)
    }
}

fn respond(status: u8, opcode: u8) -> FrameOutcome {
    FrameOutcome::Respond(Response { status, opcode })
}

#[derive(Clone, Copy)]
enum ReplyBody<'a> {
    Result(&'a [u8]),
    Error { code: u32, message: &'a str },
}

#[derive(Debug)]
struct OutOfSpace;

/// A bounds-checked writer over the reply area of the message buffer.
struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl minicbor::encode::Write for SliceWriter<'_> {
    type Error = OutOfSpace;

    fn write_all(&mut self, data: &[u8]) -> Result<(), OutOfSpace> {
        let end = self.pos + data.len();
        if end > self.buf.len() {
            return Err(OutOfSpace);
        }
        self.buf[self.pos..end].copy_from_slice(data);
        self.pos = end;
        Ok(())
    }
}

/// Encode `{v: 1, id, result | error}` into `out`, returning the encoded
/// length.
fn encode_reply(out: &mut [u8], reply_id: u32, body: ReplyBody<'_>) -> Result<usize, OutOfSpace> {
    let mut e = Encoder::new(SliceWriter { buf: out, pos: 0 });

    let header: Result<(), minicbor::encode::Error<OutOfSpace>> = (|| {
        e.map(3)?;
        e.str("v")?.u32(1)?;
        e.str("id")?.u32(reply_id)?;
        match body {
            ReplyBody::Result(_) => {
                e.str("result")?;
            }
            ReplyBody::Error { code, message } => {
                e.str("error")?;
                e.map(2)?;
                e.str("code")?.u32(code)?;
                e.str("message")?.str(message)?;
            }
        }
        Ok(())
    })();
    header.map_err(|_| OutOfSpace)?;

    let mut writer = e.into_writer();
    if let ReplyBody::Result(raw) = body {
        use minicbor::encode::Write;
        writer.write_all(raw)?;
    }
    Ok(writer.pos)
}
