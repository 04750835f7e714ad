//! The radio worker.
//!
//! The transport below the attribute layer is an external collaborator
//! behind [`Transport`]; it calls up into the runtime on writes, connection
//! events and indication completions.  This module owns everything above
//! that: the singleton connection state, the message engine (from `fsp`)
//! and the command ring behind their locks, the bounded log ring that feeds
//! the Logger characteristic, and the worker task that pumps all three out
//! through the single indication slot.
//!
//! Backpressure is the clear-to-send flag: it drops when an indication is
//! queued and re-arms when the transport reports the peer's ack (or when
//! the indication failed and should be retried).  The worker parks on a
//! notification with a one second breath while there is nothing to do.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use bitflags::bitflags;

use fsp::{CommandQueue, Engine, FrameOutcome, QueryInfo, CMD_RESET};

use crate::{Event, Runtime};

/// The characteristics the worker indicates on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Characteristic {
    /// Framed protocol content (0xABF1).
    Content,
    /// Log line broadcasts (0xABF2).
    Logger,
}

#[derive(Debug)]
pub struct TransportError;

/// The attribute-layer seam.  Completion of an indication is reported back
/// through [`Runtime::indication_complete`].
pub trait Transport: Send + Sync {
    fn indicate(&self, characteristic: Characteristic, data: &[u8]) -> Result<(), TransportError>;
    fn disconnect(&self);
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct ConnState: u8 {
        const CONNECTED  = 1 << 0;
        const SUBSCRIBED = 1 << 1;
        const ENCRYPTED  = 1 << 2;
    }
}

/// Capacity of the log ring feeding the Logger characteristic.
pub const MAX_LOGGER_LENGTH: usize = 256;

/// Byte ring for log lines; oldest data gives way.
pub(crate) struct LogRing {
    data: VecDeque<u8>,
}

impl LogRing {
    fn new() -> LogRing {
        LogRing {
            data: VecDeque::new(),
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if self.data.len() == MAX_LOGGER_LENGTH {
                self.data.pop_front();
            }
            self.data.push_back(byte);
        }
    }

    fn drain(&mut self, max: usize) -> Option<Vec<u8>> {
        if self.data.is_empty() {
            return None;
        }
        let take = self.data.len().min(max);
        Some(self.data.drain(..take).collect())
    }
}

/// The singleton link state; reset on each link-layer connect.
#[derive(Default)]
struct Connection {
    state: ConnState,
    conn_id: u32,
    clear_to_send: bool,
}

pub(crate) struct Radio {
    engine: Mutex<Engine>,
    commands: Mutex<CommandQueue>,
    conn: Mutex<Connection>,
    log: Mutex<LogRing>,
    transport: Arc<dyn Transport>,
    next_conn_id: AtomicU32,
    wake_flag: Mutex<bool>,
    wake: Condvar,
}

impl Radio {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Radio {
        Radio {
            engine: Mutex::new(Engine::new()),
            commands: Mutex::new(CommandQueue::new()),
            conn: Mutex::new(Connection::default()),
            log: Mutex::new(LogRing::new()),
            transport,
            next_conn_id: AtomicU32::new(1),
            wake_flag: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    /// Wake the worker task.
    pub(crate) fn wake(&self) {
        *self.wake_flag.lock().unwrap() = true;
        self.wake.notify_one();
    }

    fn wait(&self, timeout: Duration) {
        let armed = self.wake_flag.lock().unwrap();
        let (mut armed, _) = self
            .wake
            .wait_timeout_while(armed, timeout, |armed| !*armed)
            .unwrap();
        *armed = false;
    }

    fn set_clear_to_send(&self, cts: bool) {
        self.conn.lock().unwrap().clear_to_send = cts;
    }

    /// Append a line to the log ring and nudge the worker.
    pub(crate) fn push_log(&self, line: &[u8]) {
        {
            let mut ring = self.log.lock().unwrap();
            ring.push(line);
            ring.push(b"\n");
        }
        self.wake();
    }
}

impl Runtime {
    /// The peer wrote the content characteristic: run the frame through the
    /// engine and route the outcome.
    pub fn radio_write(&self, data: &[u8]) {
        let outcome = self.radio.engine.lock().unwrap().handle_write(data);
        match outcome {
            FrameOutcome::None => {}
            FrameOutcome::Respond(response) => {
                self.radio
                    .commands
                    .lock()
                    .unwrap()
                    .push_response(response.opcode, response.status);
                self.radio.wake();
            }
            FrameOutcome::Received(message) => {
                let accepted = self.emit_event(Event::Message(message));
                let mut engine = self.radio.engine.lock().unwrap();
                if accepted {
                    engine.begin_processing();
                } else if engine.reject() {
                    // Nobody is listening; the NOT-READY reply is staged.
                    drop(engine);
                    self.radio.commands.lock().unwrap().push_request(CMD_RESET);
                    self.radio.wake();
                }
            }
        }
    }

    /// A link-layer connection came up.
    pub fn radio_connected(&self) {
        let conn_id = self.radio.next_conn_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut conn = self.radio.conn.lock().unwrap();
            conn.state = ConnState::CONNECTED;
            conn.conn_id = conn_id;
            conn.clear_to_send = true;
        }
        self.radio.engine.lock().unwrap().clear();

        self.emit_event(Event::RadioState {
            id: conn_id,
            radio_on: true,
            connected: true,
        });
    }

    /// The link dropped; the transport resumes advertising on its own.
    pub fn radio_disconnected(&self) {
        let conn_id = {
            let mut conn = self.radio.conn.lock().unwrap();
            conn.state = ConnState::empty();
            conn.conn_id
        };
        self.emit_event(Event::RadioState {
            id: conn_id,
            radio_on: true,
            connected: false,
        });
    }

    /// The peer subscribed to indications.
    pub fn radio_subscribed(&self) {
        self.radio.conn.lock().unwrap().state |= ConnState::SUBSCRIBED;
        self.radio.wake();
    }

    /// The link finished pairing/encryption.
    pub fn radio_encrypted(&self) {
        self.radio.conn.lock().unwrap().state |= ConnState::ENCRYPTED;
    }

    /// The peer acked the pending indication: clear to send again.
    pub fn indication_complete(&self) {
        self.radio.set_clear_to_send(true);
        self.radio.wake();
    }

    pub fn is_connected(&self) -> bool {
        self.radio
            .conn
            .lock()
            .unwrap()
            .state
            .contains(ConnState::CONNECTED)
    }

    /// Tear down the active connection, if any.
    pub fn disconnect(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.radio.transport.disconnect();
        true
    }

    /// Reply to message `id` with a CBOR-encoded result.  True exactly once
    /// per received id.
    pub fn send_reply(&self, id: u32, result: &[u8]) -> bool {
        let ok = self.radio.engine.lock().unwrap().reply(id, result);
        if ok {
            // Ask the peer to drop any half-received state, then pump.
            self.radio.commands.lock().unwrap().push_request(CMD_RESET);
            self.radio.wake();
        }
        ok
    }

    /// Reply to message `id` with an `error: {code, message}` payload.
    pub fn send_error_reply(&self, id: u32, code: u32, message: &str) -> bool {
        let ok = self.radio.engine.lock().unwrap().reply_error(id, code, message);
        if ok {
            self.radio.commands.lock().unwrap().push_request(CMD_RESET);
            self.radio.wake();
        }
        ok
    }

    /// Push a line toward the Logger characteristic.  It sits in the ring
    /// until a subscribed peer drains it.
    pub fn log_line(&self, line: &str) {
        self.radio.push_log(line.as_bytes());
    }

    fn query_info(&self) -> QueryInfo {
        let (offset, length) = self.radio.engine.lock().unwrap().progress();
        QueryInfo {
            offset,
            length,
            model: self.device.model_number(),
            serial: self.device.serial_number(),
        }
    }
}

/// The worker task: one indication in flight, commands before message
/// chunks before log drains.
pub(crate) fn radio_main(rt: Arc<Runtime>) {
    log::info!("radio worker running");
    let radio = &rt.radio;

    while rt.running() {
        let (connected, subscribed, clear_to_send) = {
            let conn = radio.conn.lock().unwrap();
            (
                conn.state.contains(ConnState::CONNECTED),
                conn.state.contains(ConnState::SUBSCRIBED),
                conn.clear_to_send,
            )
        };

        if !clear_to_send {
            // Wait for the completion callback to re-arm us.
            radio.wait(Duration::from_secs(1));
            continue;
        }

        let mut characteristic = Characteristic::Content;
        let frame: Option<Vec<u8>> = {
            let info = rt.query_info();
            if let Some(command) = radio.commands.lock().unwrap().dequeue(&info) {
                Some(command.to_vec())
            } else if let Some(chunk) = radio.engine.lock().unwrap().next_chunk() {
                Some(chunk.to_vec())
            } else if subscribed {
                radio.log.lock().unwrap().drain(MAX_LOGGER_LENGTH).map(|line| {
                    characteristic = Characteristic::Logger;
                    line
                })
            } else {
                None
            }
        };

        let Some(frame) = frame else {
            radio.wait(Duration::from_secs(1));
            continue;
        };

        if !connected {
            log::debug!("indicate: not connected; frame dropped");
            continue;
        }

        radio.set_clear_to_send(false);
        if radio.transport.indicate(characteristic, &frame).is_err() {
            // Transport refused it; re-arm and retry at the next wake.
            log::warn!("indicate failed; retrying");
            radio.set_clear_to_send(true);
        }
    }
}

/// Forwards host log records into the log ring, so a peer subscribed to
/// the Logger characteristic sees them too.
pub struct RingLogger {
    runtime: Weak<Runtime>,
}

impl RingLogger {
    pub fn new(runtime: &Arc<Runtime>) -> RingLogger {
        RingLogger {
            runtime: Arc::downgrade(runtime),
        }
    }
}

impl log::Log for RingLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        // The radio worker's own lines stay host-side; feeding them back
        // into the ring would loop on a failing transport.
        if record.target().starts_with("hollows::radio") {
            return;
        }
        let Some(rt) = self.runtime.upgrade() else {
            return;
        };
        let line = format!("{}:{}: {}", record.level(), record.target(), record.args());
        rt.radio.push_log(line.as_bytes());
    }

    fn flush(&self) {}
}

/// Register the ring logger as the process logger.  Fails when another
/// logger (a test harness, say) got there first; the ring then only
/// carries explicit [`Runtime::log_line`] pushes.
pub fn install_ring_logger(rt: &Arc<Runtime>) -> Result<(), log::SetLoggerError> {
    log::set_logger(Box::leak(Box::new(RingLogger::new(rt))))?;
    log::set_max_level(log::LevelFilter::Info);
    Ok(())
}
