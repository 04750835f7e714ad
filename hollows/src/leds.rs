//! Control of the indicator pixels.
//!
//! The pixel hardware sits behind [`LedGroup`]; anything that can take a
//! slice of RGB values works, and [`SmartLedsGroup`] adapts any
//! `smart-leds` driver.  The manager plays a step table per pixel, ticked
//! once per frame by the IO task.

use rgb::RGB8;
use smart_leds::SmartLedsWrite;

/// A driver for one or more RGB LED units.
pub trait LedGroup: Send {
    /// How many RGB units this group drives.
    fn len(&self) -> usize;

    /// Set the group.  `values.len()` equals `self.len()`.
    fn update(&mut self, values: &[RGB8]);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Adapter for `smart-leds` strip drivers.
pub struct SmartLedsGroup<L> {
    driver: L,
    count: usize,
}

impl<L> SmartLedsGroup<L> {
    pub fn new(driver: L, count: usize) -> SmartLedsGroup<L> {
        SmartLedsGroup { driver, count }
    }
}

impl<L> LedGroup for SmartLedsGroup<L>
where
    L: SmartLedsWrite<Color = RGB8> + Send,
{
    fn len(&self) -> usize {
        self.count
    }

    fn update(&mut self, values: &[RGB8]) {
        let _ = self.driver.write(values.iter().cloned());
    }
}

/// One color-ramp step: hold `color` for `hold` frames.
#[derive(Clone, Copy)]
pub struct Step {
    pub color: RGB8,
    pub hold: u32,
}

const OFF: RGB8 = RGB8::new(0, 0, 0);

/// The idle shimmer played after boot.  Each pixel runs the same ramp at a
/// phase offset, giving a slow chase.
static IDLE_RAMP: &[Step] = &[
    Step { color: RGB8::new(8, 0, 12), hold: 24 },
    Step { color: RGB8::new(10, 0, 12), hold: 12 },
    Step { color: RGB8::new(8, 0, 12), hold: 12 },
    Step { color: RGB8::new(0, 8, 4), hold: 24 },
    Step { color: OFF, hold: 48 },
];

enum Lane {
    Ramp {
        steps: &'static [Step],
        index: usize,
        hold: u32,
    },
    Fixed(RGB8),
}

impl Lane {
    fn tick(&mut self) -> RGB8 {
        match self {
            Lane::Ramp { steps, index, hold } => {
                if *hold == 0 {
                    *index = (*index + 1) % steps.len();
                    *hold = steps[*index].hold;
                } else {
                    *hold -= 1;
                }
                steps[*index].color
            }
            Lane::Fixed(color) => *color,
        }
    }
}

/// Plays ramps across a pixel group; ticked once per frame.
pub struct LedManager {
    leds: Box<dyn LedGroup>,
    lanes: Vec<Lane>,
    colors: Vec<RGB8>,
}

impl LedManager {
    pub fn new(leds: Box<dyn LedGroup>) -> LedManager {
        let count = leds.len();
        let lanes = (0..count)
            .map(|pixel| Lane::Ramp {
                steps: IDLE_RAMP,
                // Phase-offset each pixel into the ramp.
                index: pixel % IDLE_RAMP.len(),
                hold: IDLE_RAMP[pixel % IDLE_RAMP.len()].hold,
            })
            .collect();
        LedManager {
            leds,
            lanes,
            colors: vec![OFF; count],
        }
    }

    /// Pin one pixel to a fixed color, replacing its ramp.
    pub fn set_pixel(&mut self, pixel: usize, color: RGB8) {
        if let Some(lane) = self.lanes.get_mut(pixel) {
            *lane = Lane::Fixed(color);
        }
    }

    pub fn tick(&mut self) {
        if self.lanes.is_empty() {
            return;
        }
        for (lane, slot) in self.lanes.iter_mut().zip(self.colors.iter_mut()) {
            *slot = lane.tick();
        }
        self.leds.update(&self.colors);
    }
}
