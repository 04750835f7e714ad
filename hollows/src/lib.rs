//! The Hollows runtime
//!
//! Runtime for a handheld, battery-powered cryptographic device: a color
//! display, a four-key keypad, a few RGB pixels and a short-range radio.
//! Application code composes against three things:
//!
//! - a stack of UI [panels](panel), each running as its own task with a
//!   bounded event queue and animated push/pop transitions;
//! - a [framed message protocol](radio) over the radio's indicated
//!   characteristic, carrying CBOR requests in and replies out (the framing
//!   itself lives in the `fsp` crate);
//! - a [device attestation and key-derivation core](device) that binds
//!   requests to a hardware-sealed RSA key and derives deterministic account
//!   keys from it.
//!
//! Hardware sits behind narrow traits (display, keypad, LED group, radio
//! transport, fuses, secure store, sealed signer, entropy), so the whole
//! runtime also runs on a host with in-memory stand-ins; that is how the
//! test suite drives it.
//!
//! Five long-lived tasks cooperate, pinned to one core on the real target:
//! IO (display/keypad/LEDs), the radio worker, one task per live panel, a
//! background key-priming task, and the transient boot task that wires
//! everything together in [`init`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use bitflags::bitflags;

pub mod attest;
pub mod device;
pub mod gatt;
pub mod info;
pub mod io;
pub mod leds;
pub mod panel;
pub mod radio;
pub mod scene;

pub use panel::{Panel, PanelStyle};
pub use scene::{NodeId, Scene};

#[cfg(test)]
pub(crate) mod testlog;
#[cfg(test)]
pub(crate) mod testutil;

/// Task priorities on the target RTOS (higher number runs first).  On the
/// host these are documentation; thread names still match.
pub const PRIORITY_IO: u8 = 6;
pub const PRIORITY_RADIO: u8 = 5;
pub const PRIORITY_APP: u8 = 3;
pub const PRIORITY_PRIME: u8 = 2;

bitflags! {
    /// The four keypad keys.
    #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
    pub struct Keys: u16 {
        const CANCEL = 1 << 0;
        const OK     = 1 << 1;
        const NORTH  = 1 << 2;
        const SOUTH  = 1 << 3;
    }
}

impl Keys {
    /// Holding this chord for two seconds restarts the device.
    pub const RESET: Keys = Keys::CANCEL.union(Keys::NORTH);
}

/// Provisioning and boot status of the device.  Sticks at the first failure.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeviceStatus {
    Ok = 0,
    Failed = 1,
    NotInitialized = 10,
    MissingFuses = 40,
    MissingStore = 41,
    OutOfMemory = 50,
}

/// An event delivered to the focused panel.
#[derive(Clone, Debug)]
pub enum Event {
    /// A frame completed; drive animations and redraw.  Coalesced: at most
    /// one is queued per panel at any time.
    RenderScene { ticks: u32, dt: u32 },

    /// The radio link changed state.
    RadioState { id: u32, radio_on: bool, connected: bool },

    /// The debounced keypad changed.
    Keys { down: Keys, changed: Keys, cancelled: bool },

    /// The panel became (or returned to being) the focused panel.
    Focus { id: u32, first_focus: bool, child_result: i32 },

    /// A verified message arrived for this panel to answer.
    Message(fsp::IncomingMessage),

    /// Application-defined; only ever fired by explicit emits.
    User1,
    User2,
}

/// The event kinds, used to index handler tables.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EventKind {
    RenderScene,
    RadioState,
    Keys,
    Focus,
    Message,
    User1,
    User2,
}

pub const EVENT_COUNT: usize = 7;

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::RenderScene { .. } => EventKind::RenderScene,
            Event::RadioState { .. } => EventKind::RadioState,
            Event::Keys { .. } => EventKind::Keys,
            Event::Focus { .. } => EventKind::Focus,
            Event::Message(_) => EventKind::Message,
            Event::User1 => EventKind::User1,
            Event::User2 => EventKind::User2,
        }
    }
}

impl EventKind {
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// The hardware the runtime drives, behind its seams.
pub struct Hardware {
    pub display: Box<dyn io::Display>,
    pub keypad: Box<dyn io::Keypad>,
    pub leds: leds::LedManager,
    pub transport: Arc<dyn radio::Transport>,
    pub platform: Arc<dyn io::Platform>,
}

/// Provisioning material sources consumed once at boot.
pub struct Provisioning {
    pub fuses: Box<dyn device::Fuses>,
    pub store: Box<dyn device::SecureStore>,
    pub signer: Box<dyn device::SealedSigner>,
    pub entropy: Box<dyn device::EntropySource>,
}

/// Installed behind the scene root before the panel canvas; used for
/// ambient backdrops.
pub type BackgroundFn = Box<dyn FnOnce(&Arc<Runtime>, NodeId) + Send>;

/// The process-wide singletons, owned by the boot task and shared by
/// reference with every long-lived task.  Mutable interior state hides
/// behind small mutexes; none of the public methods take `&mut self`.
pub struct Runtime {
    start: Instant,
    running: AtomicBool,
    pub(crate) scene: Arc<dyn Scene>,
    /// The group panels attach their subtrees to.
    pub(crate) canvas: NodeId,
    pub(crate) panels: panel::Panels,
    pub(crate) radio: radio::Radio,
    pub(crate) device: device::Device,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Runtime {
    pub(crate) fn new(
        scene: Arc<dyn Scene>,
        transport: Arc<dyn radio::Transport>,
        device: device::Device,
    ) -> Arc<Runtime> {
        let canvas = scene.create_group();
        scene.append_child(scene.root(), canvas);

        Arc::new(Runtime {
            start: Instant::now(),
            running: AtomicBool::new(true),
            scene,
            canvas,
            panels: panel::Panels::new(),
            radio: radio::Radio::new(transport),
            device,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Milliseconds since boot.
    pub fn ticks(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }

    pub(crate) fn running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Fire an event at the focused panel.  Returns true iff a handler was
    /// installed for it (a queued `RenderScene` absorbs further ones).
    pub fn emit_event(&self, event: Event) -> bool {
        self.panels.emit(event)
    }

    /// Stop the long-lived workers and wait for them.  Panel tasks end on
    /// their own pops.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.radio.wake();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            let _ = handle.join();
        }
    }
}

/// Bring the device up: load provisioning state, start the IO task and wait
/// for the display, start the radio worker, run `root` on the app task and
/// prime the account-0 key in the background.
pub fn init(
    scene: Arc<dyn Scene>,
    hardware: Hardware,
    provisioning: Provisioning,
    background: Option<BackgroundFn>,
    root: impl FnOnce(&Arc<Runtime>) -> i32 + Send + 'static,
) -> Arc<Runtime> {
    let device = device::Device::new(
        provisioning.fuses,
        provisioning.store,
        provisioning.signer,
        provisioning.entropy,
    );
    match device.status() {
        DeviceStatus::Ok => log::info!(
            "device: serial={} model={:#x} name={:?}",
            device.serial_number(),
            device.model_number(),
            device.model_name(),
        ),
        status => log::warn!("device: status={status:?} (unprovisioned)"),
    }

    let rt = Runtime::new(scene, hardware.transport.clone(), device);

    // Forward host log records toward the Logger characteristic.  A logger
    // installed earlier (a test harness, say) wins and the ring then only
    // carries explicit log_line pushes.
    let _ = radio::install_ring_logger(&rt);

    // IO task; wait for the display to come up before anything renders.
    {
        let (ready_tx, ready_rx) = mpsc::channel();
        let rt = rt.clone();
        let handle = thread::Builder::new()
            .name("io".into())
            .spawn({
                let rt = rt.clone();
                move || {
                    io::io_main(
                        rt,
                        hardware.display,
                        hardware.keypad,
                        hardware.leds,
                        hardware.platform,
                        background,
                        ready_tx,
                    )
                }
            })
            .expect("spawn io task");
        ready_rx.recv().expect("io task ready");
        rt.workers.lock().unwrap().push(handle);
    }

    // Radio worker.
    {
        let handle = thread::Builder::new()
            .name("radio".into())
            .spawn({
                let rt = rt.clone();
                move || radio::radio_main(rt)
            })
            .expect("spawn radio task");
        rt.workers.lock().unwrap().push(handle);
    }

    // App task: runs the root panel until it pops.
    {
        let (ready_tx, ready_rx) = mpsc::channel();
        let rt2 = rt.clone();
        thread::Builder::new()
            .name("app".into())
            .spawn(move || {
                let _ = ready_tx.send(());
                let status = root(&rt2);
                log::info!("root panel returned: status={status}");
            })
            .expect("spawn app task");
        ready_rx.recv().expect("app task ready");
    }

    // Prime task: pre-compute the account-0 key while the UI is idle.
    {
        let rt2 = rt.clone();
        thread::Builder::new()
            .name("prime".into())
            .spawn(move || {
                let _ = rt2.device.test_privkey(0);
                log::info!("prime task done");
            })
            .expect("spawn prime task");
    }

    rt
}
