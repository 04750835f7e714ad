//! The panel scheduler.
//!
//! A panel is one screen of UI: a scene subtree, a typed state value, a
//! table of event handlers and a task of its own.  Panels form a stack; the
//! panel on top is the focused one and is the only panel that receives
//! events.  Pushing a panel spawns its task, runs its init callback there,
//! animates the transition and blocks the pusher until the new panel pops,
//! at which point the pop status is handed back.
//!
//! Events are queued per panel in a bounded FIFO and dispatched on the
//! panel's own task.  `RenderScene` coalesces: while one is queued, further
//! emits are absorbed.  A full queue drops the event with a log line; that
//! is the only overload behavior.

use std::cell::RefCell;
use std::mem::replace;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::scene::{Curve, NodeId, Point, DISPLAY_HEIGHT, DISPLAY_WIDTH};
use crate::{Event, EventKind, Runtime, EVENT_COUNT};

/// Capacity of a panel's event queue.
pub const MAX_EVENT_BACKLOG: usize = 16;

/// Duration of push/pop transitions.
const TRANSITION_MS: u32 = 300;

/// How a panel transitions onto the screen (and, reversed, back off).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum PanelStyle {
    /// No animation.
    Instant,
    /// Same motion as `SlideLeft`.
    #[default]
    Default,
    /// The new panel rises from the bottom edge; the old one stays put
    /// beneath it.
    CoverUp,
    /// The new panel enters from the right while the old one exits left.
    SlideLeft,
}

/// The cross-task face of a live panel.  The rest of the panel (state,
/// handler table) lives on its task and never escapes.
pub(crate) struct PanelShared {
    id: u32,
    node: NodeId,
    style: PanelStyle,
    parent: Option<Arc<PanelShared>>,
    sender: SyncSender<Event>,
    /// One bit per event kind: a handler is installed.
    installed: AtomicU32,
    /// A RenderScene event is already in the queue.
    has_render: AtomicBool,
}

/// The panel stack, reduced to what other tasks need: the focused panel.
/// The stack itself is implicit in the `parent` chain.
pub(crate) struct Panels {
    active: Mutex<Option<Arc<PanelShared>>>,
    next_id: AtomicU32,
}

impl Panels {
    pub(crate) fn new() -> Panels {
        Panels {
            active: Mutex::new(None),
            next_id: AtomicU32::new(1),
        }
    }

    pub(crate) fn active_id(&self) -> Option<u32> {
        self.active.lock().unwrap().as_ref().map(|p| p.id)
    }

    /// Deliver an event to the focused panel.  True iff a handler is
    /// installed for it there.
    pub(crate) fn emit(&self, event: Event) -> bool {
        let Some(panel) = self.active.lock().unwrap().clone() else {
            return false;
        };

        let kind = event.kind();
        let bit = 1u32 << kind.index();
        if panel.installed.load(Ordering::SeqCst) & bit == 0 {
            return false;
        }

        let is_render = kind == EventKind::RenderScene;
        if is_render && panel.has_render.swap(true, Ordering::SeqCst) {
            // One render is already queued; this one is absorbed.
            return true;
        }

        match panel.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                log::warn!("panel {}: queue full, {:?} dropped", panel.id, event.kind());
                if is_render {
                    panel.has_render.store(false, Ordering::SeqCst);
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                // The panel is tearing down; late events are discarded.
            }
        }
        true
    }
}

/// An installed event handler.  Handlers run on the panel's task and may
/// freely call back into the panel (install handlers, push, pop).
pub type Handler = Box<dyn FnMut(&mut Panel, Event)>;

enum Slot {
    Empty,
    /// Temporarily taken out while the handler runs.
    Busy,
    Installed(Handler),
}

/// A live panel, handed to its init callback and to every handler.
pub struct Panel {
    rt: Arc<Runtime>,
    shared: Arc<PanelShared>,
    handlers: Rc<RefCell<[Slot; EVENT_COUNT]>>,
    done: Sender<i32>,
    popped: Option<i32>,
}

impl Panel {
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// The panel's scene subtree; UI is built under this node.
    pub fn node(&self) -> NodeId {
        self.shared.node
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.rt
    }

    /// Install a handler for `kind`, replacing any previous one.  Returns
    /// true when a handler was already installed.
    pub fn on_event<F>(&mut self, kind: EventKind, handler: F) -> bool
    where
        F: FnMut(&mut Panel, Event) + 'static,
    {
        let mut table = self.handlers.borrow_mut();
        let slot = &mut table[kind.index()];
        let existing = !matches!(slot, Slot::Empty);
        *slot = Slot::Installed(Box::new(handler));
        self.shared
            .installed
            .fetch_or(1 << kind.index(), Ordering::SeqCst);
        existing
    }

    /// Remove the handler for `kind`.  Returns true when one was installed.
    pub fn off_event(&mut self, kind: EventKind) -> bool {
        let mut table = self.handlers.borrow_mut();
        let slot = &mut table[kind.index()];
        if matches!(slot, Slot::Empty) {
            return false;
        }
        *slot = Slot::Empty;
        self.shared
            .installed
            .fetch_and(!(1 << kind.index()), Ordering::SeqCst);
        true
    }

    pub fn has_event(&self, kind: EventKind) -> bool {
        !matches!(self.handlers.borrow()[kind.index()], Slot::Empty)
    }

    /// Fire an event at the focused panel (which may no longer be this
    /// one).
    pub fn emit_event(&self, event: Event) -> bool {
        self.rt.emit_event(event)
    }

    /// Push a child panel; blocks this panel's task until the child pops
    /// and returns the child's status.
    pub fn push<S, I>(&self, style: PanelStyle, init: I) -> i32
    where
        S: Default + 'static,
        I: FnOnce(&mut Panel, Rc<RefCell<S>>) + Send + 'static,
    {
        self.rt.push_panel(style, init)
    }

    /// Reply to a message this panel accepted.
    pub fn send_reply(&self, id: u32, result: &[u8]) -> bool {
        self.rt.send_reply(id, result)
    }

    pub fn send_error_reply(&self, id: u32, code: u32, message: &str) -> bool {
        self.rt.send_error_reply(id, code, message)
    }

    /// Pop this panel with `status`.  Focus returns to the parent
    /// immediately; the exit animation plays out on the IO timeline and the
    /// panel's task ends once the current handler returns.
    pub fn pop(&mut self, status: i32) {
        if self.popped.is_some() {
            return;
        }

        let scene = self.rt.scene.clone();
        let parent = self.shared.parent.clone();
        let node = self.shared.node;

        *self.rt.panels.active.lock().unwrap() = parent.clone();

        match self.shared.style {
            PanelStyle::Instant => {
                if let Some(parent) = &parent {
                    scene.set_position(parent.node, Point::default());
                }
                scene.remove(node);
            }
            style => {
                let exit = match style {
                    PanelStyle::CoverUp => Point::new(0, DISPLAY_HEIGHT),
                    _ => Point::new(DISPLAY_WIDTH, 0),
                };

                // Leave the way we came in; the subtree goes away when the
                // animation lands.
                if scene.position(node) != exit {
                    let cleanup = scene.clone();
                    scene.animate_position(
                        node,
                        exit,
                        TRANSITION_MS,
                        Curve::EaseInQuad,
                        Some(Box::new(move || cleanup.remove(node))),
                    );
                } else {
                    scene.remove(node);
                }

                if let Some(parent) = &parent {
                    if scene.position(parent.node) != Point::default() {
                        scene.animate_position(
                            parent.node,
                            Point::default(),
                            TRANSITION_MS,
                            Curve::EaseInQuad,
                            None,
                        );
                    }
                }
            }
        }

        // Unblock the pusher with our status.
        let _ = self.done.send(status);
        self.popped = Some(status);
    }
}

impl Runtime {
    /// Push a panel whose state is a zero-initialized `S`.  `init` runs on
    /// the new panel's task; the caller blocks until the panel pops and
    /// receives its status.
    pub fn push_panel<S, I>(self: &Arc<Runtime>, style: PanelStyle, init: I) -> i32
    where
        S: Default + 'static,
        I: FnOnce(&mut Panel, Rc<RefCell<S>>) + Send + 'static,
    {
        let id = self.panels.next_id.fetch_add(1, Ordering::SeqCst);
        let (done, result) = std::sync::mpsc::channel();

        let rt = self.clone();
        thread::Builder::new()
            .name(format!("panel-{id}"))
            .spawn(move || panel_main(rt, id, style, init, done))
            .expect("spawn panel task");

        result.recv().expect("panel task ended without popping")
    }

    /// Id of the focused panel, if any.
    pub fn active_panel_id(&self) -> Option<u32> {
        self.panels.active_id()
    }
}

fn panel_main<S, I>(rt: Arc<Runtime>, id: u32, style: PanelStyle, init: I, done: Sender<i32>)
where
    S: Default + 'static,
    I: FnOnce(&mut Panel, Rc<RefCell<S>>) + Send + 'static,
{
    let scene = rt.scene.clone();
    let previous = rt.panels.active.lock().unwrap().clone();

    // The very first panel appears instantly no matter what was asked for.
    let style = if previous.is_none() {
        PanelStyle::Instant
    } else {
        style
    };

    let (enter_from, exit_to) = match style {
        PanelStyle::Instant => (Point::default(), None),
        PanelStyle::CoverUp => (Point::new(0, DISPLAY_HEIGHT), None),
        PanelStyle::Default | PanelStyle::SlideLeft => (
            Point::new(DISPLAY_WIDTH, 0),
            Some(Point::new(-DISPLAY_WIDTH, 0)),
        ),
    };

    let node = scene.create_group();
    scene.set_position(node, enter_from);

    let (sender, receiver) = sync_channel(MAX_EVENT_BACKLOG);
    let shared = Arc::new(PanelShared {
        id,
        node,
        style,
        parent: previous.clone(),
        sender,
        installed: AtomicU32::new(0),
        has_render: AtomicBool::new(false),
    });

    *rt.panels.active.lock().unwrap() = Some(shared.clone());

    let state = Rc::new(RefCell::new(S::default()));
    let mut panel = Panel {
        rt: rt.clone(),
        shared,
        handlers: Rc::new(RefCell::new(std::array::from_fn(|_| Slot::Empty))),
        done,
        popped: None,
    };

    init(&mut panel, state.clone());

    // A panel may pop from inside its own init; it then never appears.
    if panel.popped.is_some() {
        return;
    }

    scene.append_child(rt.canvas, node);

    if let (Some(previous), Some(exit_to)) = (&previous, exit_to) {
        scene.animate_position(previous.node, exit_to, TRANSITION_MS, Curve::EaseOutQuad, None);
    }

    if enter_from != Point::default() {
        let focus = rt.clone();
        scene.animate_position(
            node,
            Point::default(),
            TRANSITION_MS,
            Curve::EaseOutQuad,
            Some(Box::new(move || {
                focus.emit_event(Event::Focus {
                    id,
                    first_focus: true,
                    child_result: 0,
                });
            })),
        );
    } else {
        rt.emit_event(Event::Focus {
            id,
            first_focus: true,
            child_result: 0,
        });
    }

    // The event pump.  The 1 s timeout keeps the task breathing while idle;
    // pop (from init or from a handler) ends it.
    while panel.popped.is_none() {
        match receiver.recv_timeout(Duration::from_secs(1)) {
            Ok(event) => {
                if event.kind() == EventKind::RenderScene {
                    panel.shared.has_render.store(false, Ordering::SeqCst);
                }
                dispatch(&mut panel, event);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    drop(state);
}

/// Run the installed handler for one event.  The slot is parked as Busy for
/// the duration so the handler can install or remove handlers, including
/// its own.
fn dispatch(panel: &mut Panel, event: Event) {
    let idx = event.kind().index();

    let handler = {
        let mut table = panel.handlers.borrow_mut();
        match replace(&mut table[idx], Slot::Busy) {
            Slot::Installed(handler) => Some(handler),
            other => {
                table[idx] = other;
                None
            }
        }
    };
    let Some(mut handler) = handler else { return };

    handler(panel, event);

    let handlers = panel.handlers.clone();
    let mut table = handlers.borrow_mut();
    if matches!(table[idx], Slot::Busy) {
        table[idx] = Slot::Installed(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use crate::testlog;
    use std::sync::mpsc;

    #[test]
    fn push_pop_returns_status() {
        testlog::setup();
        let rt = testutil::runtime();

        // Scenario: A pushes B, B pops 7, A pops the child's status.
        let status = rt.push_panel::<(), _>(PanelStyle::Default, |panel, _state| {
            let child = panel.push::<(), _>(PanelStyle::SlideLeft, |child, _state| {
                child.pop(7);
            });
            panel.pop(child);
        });

        assert_eq!(status, 7);
        assert_eq!(rt.active_panel_id(), None);
    }

    #[test]
    fn first_focus_is_synthesized() {
        testlog::setup();
        let rt = testutil::runtime();

        let status = rt.push_panel::<(), _>(PanelStyle::Instant, |panel, _state| {
            let expected = panel.id();
            panel.on_event(EventKind::Focus, move |panel, event| {
                if let Event::Focus { id, first_focus: true, .. } = event {
                    assert_eq!(id, expected);
                    assert_eq!(panel.runtime().active_panel_id(), Some(expected));
                    panel.pop(42);
                }
            });
        });

        assert_eq!(status, 42);
    }

    #[test]
    fn active_restored_after_nested_pushes() {
        testlog::setup();
        let rt = testutil::runtime();
        assert_eq!(rt.active_panel_id(), None);

        let status = rt.push_panel::<(), _>(PanelStyle::Instant, |panel, _state| {
            let a = panel.id();
            let inner = panel.push::<(), _>(PanelStyle::CoverUp, |child, _state| {
                let b = child.id();
                assert_eq!(child.runtime().active_panel_id(), Some(b));
                let deepest = child.push::<(), _>(PanelStyle::Default, |c, _state| {
                    c.pop(3);
                });
                assert_eq!(child.runtime().active_panel_id(), Some(b));
                child.pop(deepest + 1);
            });
            assert_eq!(panel.runtime().active_panel_id(), Some(a));
            panel.pop(inner + 1);
        });

        assert_eq!(status, 5);
        assert_eq!(rt.active_panel_id(), None);
    }

    /// Holds the panel's event pump inside a handler so queued events stay
    /// queued, then releases it.
    struct Gate {
        enter: mpsc::Receiver<()>,
        release: mpsc::Sender<()>,
    }

    fn gated_panel(
        rt: &Arc<Runtime>,
    ) -> (Gate, mpsc::Receiver<EventKind>, thread::JoinHandle<i32>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (seen_tx, seen_rx) = mpsc::channel();

        let rt2 = rt.clone();
        let pusher = thread::spawn(move || {
            rt2.push_panel::<(), _>(PanelStyle::Instant, move |panel, _state| {
                let seen_render = seen_tx.clone();
                panel.on_event(EventKind::RenderScene, move |_, event| {
                    seen_render.send(event.kind()).unwrap();
                });
                let seen_user2 = seen_tx.clone();
                panel.on_event(EventKind::User2, move |_, event| {
                    seen_user2.send(event.kind()).unwrap();
                });
                panel.on_event(EventKind::User1, move |_, _| {
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                });
                panel.on_event(EventKind::Keys, |panel, _| panel.pop(0));
            })
        });

        while rt.active_panel_id().is_none() {
            thread::sleep(Duration::from_millis(1));
        }
        (
            Gate {
                enter: entered_rx,
                release: release_tx,
            },
            seen_rx,
            pusher,
        )
    }

    fn drain_seen(seen: &mpsc::Receiver<EventKind>) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Ok(kind) = seen.recv_timeout(Duration::from_millis(200)) {
            kinds.push(kind);
        }
        kinds
    }

    #[test]
    fn render_events_coalesce() {
        testlog::setup();
        let rt = testutil::runtime();
        let (gate, seen, pusher) = gated_panel(&rt);

        // Park the pump inside the User1 handler.
        assert!(rt.emit_event(Event::User1));
        gate.enter.recv().unwrap();

        // While parked, only the first render is queued.
        for _ in 0..5 {
            assert!(rt.emit_event(Event::RenderScene { ticks: 0, dt: 16 }));
        }
        gate.release.send(()).unwrap();

        let kinds = drain_seen(&seen);
        assert_eq!(
            kinds.iter().filter(|k| **k == EventKind::RenderScene).count(),
            1
        );

        // Once delivered, the next render flows again.
        assert!(rt.emit_event(Event::RenderScene { ticks: 1, dt: 16 }));
        assert_eq!(drain_seen(&seen).len(), 1);

        rt.emit_event(Event::Keys {
            down: crate::Keys::OK,
            changed: crate::Keys::OK,
            cancelled: false,
        });
        assert_eq!(pusher.join().unwrap(), 0);
    }

    #[test]
    fn full_queue_drops_events() {
        testlog::setup();
        let rt = testutil::runtime();
        let (gate, seen, pusher) = gated_panel(&rt);

        assert!(rt.emit_event(Event::User1));
        gate.enter.recv().unwrap();

        // The queue holds MAX_EVENT_BACKLOG; the rest are dropped (emit
        // still reports the event as handled).
        for _ in 0..MAX_EVENT_BACKLOG + 8 {
            assert!(rt.emit_event(Event::User2));
        }
        gate.release.send(()).unwrap();

        let kinds = drain_seen(&seen);
        assert_eq!(kinds.len(), MAX_EVENT_BACKLOG);

        rt.emit_event(Event::Keys {
            down: crate::Keys::OK,
            changed: crate::Keys::OK,
            cancelled: false,
        });
        assert_eq!(pusher.join().unwrap(), 0);
    }

    #[test]
    fn emit_without_handler_is_unhandled() {
        testlog::setup();
        let rt = testutil::runtime();

        // Nothing pushed at all.
        assert!(!rt.emit_event(Event::User1));

        let rt2 = rt.clone();
        let pusher = thread::spawn(move || {
            rt2.push_panel::<(), _>(PanelStyle::Instant, |panel, _state| {
                panel.on_event(EventKind::Keys, |panel, _| panel.pop(0));
            })
        });
        while rt.active_panel_id().is_none() {
            thread::sleep(Duration::from_millis(1));
        }

        assert!(!rt.emit_event(Event::User1));
        assert!(rt.emit_event(Event::Keys {
            down: crate::Keys::OK,
            changed: crate::Keys::OK,
            cancelled: false,
        }));
        pusher.join().unwrap();
    }

    #[test]
    fn handlers_install_and_remove() {
        testlog::setup();
        let rt = testutil::runtime();

        let status = rt.push_panel::<(), _>(PanelStyle::Instant, |panel, _state| {
            assert!(!panel.has_event(EventKind::User1));
            assert!(!panel.on_event(EventKind::User1, |_, _| {}));
            assert!(panel.has_event(EventKind::User1));
            // Installing over an existing handler reports it.
            assert!(panel.on_event(EventKind::User1, |_, _| {}));
            assert!(panel.off_event(EventKind::User1));
            assert!(!panel.off_event(EventKind::User1));
            panel.pop(1);
        });
        assert_eq!(status, 1);
    }
}
