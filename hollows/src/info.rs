//! A builder for list-style panels.
//!
//! Lays out heading/value rows and colored buttons in a vertical list,
//! tracks a highlighted button, scrolls the list so the highlight stays on
//! screen and fires the button's click callback on Ok.  Pure convenience on
//! top of the panel scheduler; panels remain free to build their UI any
//! other way.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use rgb::RGBA8;

use crate::panel::Panel;
use crate::scene::{Curve, NodeId, Point, Scene, Size};
use crate::{Event, EventKind, Keys};

const LIST_X: i32 = 10;
const LIST_TOP: i32 = 20;
const ROW_WIDTH: u32 = 180;
const ROW_HEIGHT: i32 = 25;
const ROW_GAP: i32 = 5;
const VALUE_X: i32 = 90;

/// The list viewport: rows past this edge scroll into view.
const VIEW_BOTTOM: i32 = 200;

const SCROLL_MS: u32 = 300;
const OPACITY_80: u8 = 204;

pub type ClickHandler = Box<dyn FnMut(&mut Panel)>;

struct Button {
    glow: NodeId,
    color: RGBA8,
    y: i32,
    click: Option<ClickHandler>,
}

pub struct InfoPanel {
    scene: Arc<dyn Scene>,
    /// Container of all rows; scrolling moves this node.
    list: NodeId,
    /// Layout cursor, also the list height so far.
    cursor: i32,
    buttons: Vec<Button>,
    highlight: usize,
}

impl InfoPanel {
    pub fn new(panel: &Panel) -> InfoPanel {
        let scene = panel.runtime().scene.clone();
        let list = scene.create_group();
        scene.set_position(list, Point::new(LIST_X, LIST_TOP));
        scene.append_child(panel.node(), list);
        InfoPanel {
            scene,
            list,
            cursor: 0,
            buttons: Vec::new(),
            highlight: 0,
        }
    }

    /// A static heading/value row.
    pub fn add_entry(&mut self, heading: &str, value: &str) {
        let heading = self.scene.create_label(heading);
        self.scene.set_position(heading, Point::new(0, self.cursor));
        self.scene.append_child(self.list, heading);

        let value = self.scene.create_label(value);
        self.scene.set_position(value, Point::new(VALUE_X, self.cursor));
        self.scene.append_child(self.list, value);

        self.cursor += ROW_HEIGHT;
    }

    /// A clickable button row.  The first button starts highlighted.
    pub fn add_button<F>(&mut self, label: &str, color: RGBA8, click: F)
    where
        F: FnMut(&mut Panel) + 'static,
    {
        let glow = self.scene.create_box(
            Size::new(ROW_WIDTH, ROW_HEIGHT as u32),
            with_alpha(color, 0),
        );
        self.scene.set_position(glow, Point::new(0, self.cursor));
        self.scene.append_child(self.list, glow);

        let text = self.scene.create_label(label);
        self.scene.set_position(text, Point::new(10, self.cursor));
        self.scene.append_child(self.list, text);

        if self.buttons.is_empty() {
            self.scene.set_color(glow, with_alpha(color, OPACITY_80));
        }
        self.buttons.push(Button {
            glow,
            color,
            y: self.cursor,
            click: Some(Box::new(click)),
        });
        self.cursor += ROW_HEIGHT + ROW_GAP;
    }

    /// Install the key handling on the panel and hand back a shared handle.
    pub fn install(self, panel: &mut Panel) -> Rc<RefCell<InfoPanel>> {
        let this = Rc::new(RefCell::new(self));

        let list = this.clone();
        panel.on_event(EventKind::Keys, move |panel, event| {
            let Event::Keys { down, changed, .. } = event else {
                return;
            };
            let pressed = down & changed;

            if pressed.contains(Keys::NORTH) {
                list.borrow_mut().move_highlight(-1);
            } else if pressed.contains(Keys::SOUTH) {
                list.borrow_mut().move_highlight(1);
            } else if pressed.contains(Keys::OK) {
                // Take the callback out for the call so it can reach the
                // list itself without re-borrowing.
                let (index, click) = {
                    let mut info = list.borrow_mut();
                    let index = info.highlight;
                    (index, info.buttons.get_mut(index).and_then(|b| b.click.take()))
                };
                if let Some(mut click) = click {
                    click(panel);
                    let mut info = list.borrow_mut();
                    if let Some(button) = info.buttons.get_mut(index) {
                        if button.click.is_none() {
                            button.click = Some(click);
                        }
                    }
                }
            }
        });

        this
    }

    pub fn highlighted(&self) -> usize {
        self.highlight
    }

    fn move_highlight(&mut self, delta: i32) {
        if self.buttons.is_empty() {
            return;
        }
        let last = self.buttons.len() - 1;
        let next = (self.highlight as i32 + delta).clamp(0, last as i32) as usize;
        if next == self.highlight {
            return;
        }

        let old = &self.buttons[self.highlight];
        self.scene.set_color(old.glow, with_alpha(old.color, 0));
        let new = &self.buttons[next];
        self.scene.set_color(new.glow, with_alpha(new.color, OPACITY_80));
        self.highlight = next;

        // Keep the highlight on screen.
        let position = self.scene.position(self.list);
        if let Some(y) = scroll_target(self.cursor, new.y, position.y, next, last) {
            self.scene.animate_position(
                self.list,
                Point::new(position.x, y),
                SCROLL_MS,
                Curve::EaseOutQuad,
                None,
            );
        }
    }
}

fn with_alpha(color: RGBA8, alpha: u8) -> RGBA8 {
    RGBA8::new(color.r, color.g, color.b, alpha)
}

/// Where the list should scroll so the row at `row_y` is visible, or
/// `None` to stay put.  `height` is the full list height, `list_y` its
/// current offset.
fn scroll_target(height: i32, row_y: i32, list_y: i32, index: usize, last: usize) -> Option<i32> {
    // The whole list fits; never scroll.
    if height <= VIEW_BOTTOM {
        return None;
    }
    if index == 0 {
        return Some(LIST_TOP);
    }
    if index == last {
        return Some(-(height + LIST_TOP - 240));
    }
    let top = row_y + list_y;
    let bottom = top + ROW_HEIGHT;
    if bottom > VIEW_BOTTOM {
        return Some(VIEW_BOTTOM - ROW_HEIGHT - row_y);
    }
    if top < LIST_TOP {
        return Some(LIST_TOP - row_y);
    }
    None
}
