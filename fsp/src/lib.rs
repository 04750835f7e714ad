//! The Firefly Serial Protocol
//!
//! FSP carries structured (CBOR-encoded) messages between a device and a
//! single peer over a transport that only moves small frames: an attribute
//! write in one direction, an indication in the other, each bounded by the
//! link MTU and with at most one indication pending at a time.
//!
//! A message is prefixed by a SHA-256 digest of its payload and is cut into
//! `START_MESSAGE`/`CONTINUE_MESSAGE` frames.  The receiver reassembles,
//! verifies the digest and hands the decoded payload up; the reply travels
//! back the same way, initiated by the device.  Command frames with no
//! message body (`QUERY`, `RESET`) and error responses share the same
//! characteristic and are serialized through a small ring so the indication
//! pipe is never double-booked.
//!
//! This crate is sans-io: it owns the framing state machine, the envelope
//! and the payload validation, but never touches a radio.  The runtime wraps
//! it in a lock and pumps it from its radio worker.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

extern crate alloc;

pub mod cbor;
mod command;
mod engine;

pub use command::{CommandQueue, QueryInfo, COMMAND_QUEUE_LENGTH};
pub use engine::{Engine, FrameOutcome, IncomingMessage, MessageState, Response};

/// Abandon an in-flight receive, if any.
pub const CMD_RESET: u8 = 0x02;

/// Report device identity and transfer progress.
pub const CMD_QUERY: u8 = 0x03;

/// Begin a message: `length[2, BE] || bytes`.
pub const CMD_START_MESSAGE: u8 = 0x06;

/// Append to a message: `offset[2, BE] || bytes`.
pub const CMD_CONTINUE_MESSAGE: u8 = 0x07;

pub const STATUS_OK: u8 = 0x00;
pub const ERROR_UNSUPPORTED_VERSION: u8 = 0x81;
pub const ERROR_BAD_COMMAND: u8 = 0x82;
pub const ERROR_BUFFER_OVERRUN: u8 = 0x84;
pub const ERROR_MISSING_MESSAGE: u8 = 0x85;
pub const ERROR_BAD_CHECKSUM: u8 = 0x86;
pub const ERROR_UNKNOWN: u8 = 0x8f;
pub const ERROR_BUSY: u8 = 0x91;

/// Payload capacity of a single message.
pub const MAX_MESSAGE_SIZE: usize = 1 << 14;

/// Envelope overhead on top of the payload: the 32-byte digest plus the
/// CBOR framing of a reply map.
pub const ENVELOPE_OVERHEAD: usize = 84;

/// The SHA-256 digest occupying the first bytes of every message.
pub const DIGEST_LENGTH: usize = 32;

/// Method names are 1..=31 bytes of UTF-8 (the extra byte held the NUL in
/// the original wire tooling).
pub const MAX_METHOD_LENGTH: usize = 32;

/// Longest body of an outbound START/CONTINUE frame.
pub const MAX_FRAME_BODY: usize = 506;

/// Longest outbound frame: three bytes of header plus the body.
pub const MAX_FRAME: usize = MAX_FRAME_BODY + 3;

/// Longest inbound attribute write accepted before opcode dispatch.
pub const MAX_WRITE: usize = 513;
