//! The IO task: display pacing, keypad sampling and the LEDs.
//!
//! One loop drives everything the user sees.  Each iteration renders one
//! screen fragment and samples the keypad; when the last fragment of a
//! frame lands, the keypad is latched by majority vote, key and render
//! events go to the focused panel, the scene is sequenced and the loop
//! sleeps to the next frame deadline.
//!
//! The target rate is 60.03 fps, reached by alternating 16 ms and 17 ms
//! delays according to a fixed 29-bit pattern (a plain 16 ms tick lands at
//! 59.9 because of timer overhead).  When the loop falls behind it drops
//! frames by resetting the deadline instead of bursting to catch up.

use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::leds::LedManager;
use crate::{BackgroundFn, Event, Keys, Runtime};

/// Renders the screen, one fragment at a time.
pub trait Display: Send {
    /// Render the next fragment; true when this completed a full frame.
    fn render_fragment(&mut self) -> bool;
}

/// The raw (unlatched) keypad lines.
pub trait Keypad: Send {
    fn read(&mut self) -> Keys;
}

/// Whole-device operations the runtime cannot perform itself.
pub trait Platform: Send + Sync {
    /// Hardware reset.  On the real target this does not return.
    fn restart(&self);
}

/// Keypad samples folded into one latch per frame.
pub const KEYPAD_SAMPLE_COUNT: usize = 10;

/// How long the Cancel+North chord must be held to force a restart.
pub const RESET_HOLD_MS: u32 = 2000;

/// Per-frame delay pattern: one bit per frame, 16 ms plus the bit.  Found
/// by searching delay mixes for the one that lands closest to 60.03 fps.
pub const FRAME_STAGGER_PATTERN: u32 = 0b1_0101_1011_0110_1101_1011_0110_1101;

/// Majority-vote keypad debouncer.  Raw samples accumulate between frames
/// and are folded into a stable latch once per frame.
#[derive(Default)]
pub struct KeypadSampler {
    samples: [Keys; KEYPAD_SAMPLE_COUNT],
    count: usize,
    latch: Keys,
    previous: Keys,
}

impl KeypadSampler {
    pub fn new() -> KeypadSampler {
        KeypadSampler::default()
    }

    /// Record one raw sample.  Extra samples overwrite the oldest.
    pub fn sample(&mut self, raw: Keys) {
        self.samples[self.count % KEYPAD_SAMPLE_COUNT] = raw;
        self.count += 1;
    }

    /// Fold the collected samples into the frame's latch.  A key counts as
    /// pressed when more than half the samples saw it.  Returns
    /// `(down, changed)`.
    pub fn latch(&mut self) -> (Keys, Keys) {
        let used = self.count.min(KEYPAD_SAMPLE_COUNT);

        let mut latched = Keys::empty();
        for key in [Keys::CANCEL, Keys::OK, Keys::NORTH, Keys::SOUTH] {
            let hits = self.samples[..used].iter().filter(|s| s.contains(key)).count();
            if hits * 2 > used {
                latched |= key;
            }
        }

        self.count = 0;
        self.previous = self.latch;
        self.latch = latched;
        (self.latch, self.previous ^ self.latch)
    }
}

/// Watches for the reset chord being held.
#[derive(Default)]
pub struct ResetWatch {
    held_since: Option<u32>,
}

impl ResetWatch {
    pub fn new() -> ResetWatch {
        ResetWatch::default()
    }

    /// Feed one latched frame; true once the chord has been held for
    /// [`RESET_HOLD_MS`].
    pub fn observe(&mut self, down: Keys, changed: Keys, now: u32) -> bool {
        if !changed.is_empty() {
            self.held_since = (down == Keys::RESET).then_some(now);
        }
        match self.held_since {
            Some(start) if down == Keys::RESET => now.wrapping_sub(start) >= RESET_HOLD_MS,
            _ => false,
        }
    }
}

/// Yields the per-frame delay, cycling through the stagger pattern.
pub struct FrameStagger(u32);

impl FrameStagger {
    pub fn new() -> FrameStagger {
        FrameStagger(0)
    }

    /// Delay before the next frame, in milliseconds (16 or 17).
    pub fn next_delay(&mut self) -> u32 {
        if self.0 == 0 {
            self.0 = FRAME_STAGGER_PATTERN;
        }
        let extra = self.0 & 1;
        self.0 >>= 1;
        16 + extra
    }
}

pub(crate) fn io_main(
    rt: Arc<Runtime>,
    mut display: Box<dyn Display>,
    mut keypad: Box<dyn Keypad>,
    mut leds: LedManager,
    platform: Arc<dyn Platform>,
    background: Option<BackgroundFn>,
    ready: Sender<()>,
) {
    // Stand up the scene around the panel canvas: the backdrop goes in
    // behind everything.
    {
        let background_node = rt.scene.create_group();
        rt.scene.append_child(rt.scene.root(), background_node);
        if let Some(background) = background {
            background(&rt, background_node);
        }
        rt.scene.sequence(rt.ticks());
    }

    // Display is up; unblock the boot task.
    let _ = ready.send(());

    let mut sampler = KeypadSampler::new();
    let mut watch = ResetWatch::new();
    let mut stagger = FrameStagger::new();

    let mut last_frame = rt.ticks();
    let mut deadline = Instant::now();
    let mut frames = 0u32;
    let mut fps_mark = last_frame;

    while rt.running() {
        sampler.sample(keypad.read());

        if !display.render_fragment() {
            continue;
        }

        leds.tick();

        let (down, changed) = sampler.latch();
        let now = rt.ticks();

        if watch.observe(down, changed, now) {
            log::warn!("reset chord held; restarting");
            platform.restart();
        }

        if !changed.is_empty() {
            rt.emit_event(Event::Keys {
                down,
                changed,
                cancelled: false,
            });
        }

        rt.scene.sequence(now);
        rt.emit_event(Event::RenderScene {
            ticks: now,
            dt: now.wrapping_sub(last_frame),
        });
        last_frame = now;

        frames += 1;
        if now.wrapping_sub(fps_mark) >= 1000 {
            log::debug!("fps: {}", frames);
            frames = 0;
            fps_mark = now;
        }

        deadline += Duration::from_millis(stagger.next_delay() as u64);
        let current = Instant::now();
        if deadline > current {
            thread::sleep(deadline - current);
        } else {
            // Behind schedule; drop frames rather than bursting.
            deadline = current;
        }
    }
}
