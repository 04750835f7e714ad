//! The scene-graph contract.
//!
//! The compositor proper (rasterizing, text, the animation library) is an
//! external collaborator; the runtime only needs the narrow surface below:
//! build small node trees, move them, and run eased position animations with
//! a completion hook.  The panel scheduler drives transitions through it and
//! the IO task sequences it once per frame.
//!
//! [`MemoryScene`] is the in-tree backend: it tracks nodes and animations
//! without rendering anything.  The test suite runs it in instant mode,
//! where animations complete at the call site.

use std::sync::{Arc, Mutex};

use rgb::RGBA8;

/// Handle to a node in the scene graph.  Zero is never a live node.
pub type NodeId = u32;

pub const DISPLAY_WIDTH: i32 = 240;
pub const DISPLAY_HEIGHT: i32 = 240;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Point {
        Point { x, y }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Size {
        Size { width, height }
    }
}

/// Easing curves used by panel transitions and list scrolling.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Curve {
    Linear,
    /// Fast start, gentle stop; used when a panel enters.
    EaseOutQuad,
    /// Gentle start, fast finish; used when a panel leaves.
    EaseInQuad,
}

impl Curve {
    fn apply(self, t: f32) -> f32 {
        match self {
            Curve::Linear => t,
            Curve::EaseOutQuad => 1.0 - (1.0 - t) * (1.0 - t),
            Curve::EaseInQuad => t * t,
        }
    }
}

/// Fired once when a position animation reaches its target.
pub type AnimationDone = Box<dyn FnOnce() + Send>;

/// What the runtime requires of a compositor.  Implementations do their own
/// locking; no method takes `&mut self`.
pub trait Scene: Send + Sync {
    fn root(&self) -> NodeId;

    fn create_group(&self) -> NodeId;
    fn create_box(&self, size: Size, color: RGBA8) -> NodeId;
    fn create_label(&self, text: &str) -> NodeId;

    fn append_child(&self, parent: NodeId, child: NodeId);
    /// Detach a node (and its subtree) from the graph.
    fn remove(&self, node: NodeId);

    fn position(&self, node: NodeId) -> Point;
    fn set_position(&self, node: NodeId, position: Point);
    fn set_color(&self, node: NodeId, color: RGBA8);
    fn set_text(&self, node: NodeId, text: &str);
    fn size(&self, node: NodeId) -> Size;

    /// Animate a node to `to` over `duration` milliseconds.  Replaces any
    /// position animation already running on the node.
    fn animate_position(
        &self,
        node: NodeId,
        to: Point,
        duration: u32,
        curve: Curve,
        done: Option<AnimationDone>,
    );

    fn stop_animations(&self, node: NodeId);

    /// Advance animations to `now` (milliseconds).  Called once per frame
    /// from the IO task.
    fn sequence(&self, now: u32);
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum NodeKind {
    Group,
    Box,
    Label,
}

struct Node {
    kind: NodeKind,
    position: Point,
    size: Size,
    color: RGBA8,
    text: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    live: bool,
}

struct Animation {
    node: NodeId,
    from: Point,
    to: Point,
    start: Option<u32>,
    duration: u32,
    curve: Curve,
    done: Option<AnimationDone>,
}

#[derive(Default)]
struct Graph {
    nodes: Vec<Node>,
    animations: Vec<Animation>,
}

/// A non-rendering scene backend.
pub struct MemoryScene {
    inner: Mutex<Graph>,
    /// When set, animations complete (and fire their hooks) immediately.
    instant: bool,
}

impl MemoryScene {
    pub fn new() -> Arc<MemoryScene> {
        Arc::new(MemoryScene {
            inner: Mutex::new(Graph::default()),
            instant: false,
        })
    }

    /// A scene whose animations finish at the call site; for tests and
    /// headless hosts.
    pub fn instant() -> Arc<MemoryScene> {
        Arc::new(MemoryScene {
            inner: Mutex::new(Graph::default()),
            instant: true,
        })
    }

    fn create(&self, kind: NodeKind, size: Size, color: RGBA8, text: &str) -> NodeId {
        let mut graph = self.inner.lock().unwrap();
        graph.nodes.push(Node {
            kind,
            position: Point::default(),
            size,
            color,
            text: text.into(),
            parent: None,
            children: Vec::new(),
            live: true,
        });
        graph.nodes.len() as NodeId
    }

    /// Number of live nodes; test visibility.
    pub fn live_nodes(&self) -> usize {
        self.inner.lock().unwrap().nodes.iter().filter(|n| n.live).count()
    }
}

fn index(node: NodeId) -> usize {
    node as usize - 1
}

impl Graph {
    fn node(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[index(id)]
    }
}

impl Scene for MemoryScene {
    fn root(&self) -> NodeId {
        let mut graph = self.inner.lock().unwrap();
        if graph.nodes.is_empty() {
            graph.nodes.push(Node {
                kind: NodeKind::Group,
                position: Point::default(),
                size: Size::new(DISPLAY_WIDTH as u32, DISPLAY_HEIGHT as u32),
                color: RGBA8::default(),
                text: String::new(),
                parent: None,
                children: Vec::new(),
                live: true,
            });
        }
        1
    }

    fn create_group(&self) -> NodeId {
        self.root();
        self.create(NodeKind::Group, Size::default(), RGBA8::default(), "")
    }

    fn create_box(&self, size: Size, color: RGBA8) -> NodeId {
        self.root();
        self.create(NodeKind::Box, size, color, "")
    }

    fn create_label(&self, text: &str) -> NodeId {
        self.root();
        self.create(NodeKind::Label, Size::default(), RGBA8::default(), text)
    }

    fn append_child(&self, parent: NodeId, child: NodeId) {
        let mut graph = self.inner.lock().unwrap();
        graph.node(child).parent = Some(parent);
        graph.node(parent).children.push(child);
    }

    fn remove(&self, node: NodeId) {
        let mut graph = self.inner.lock().unwrap();
        if let Some(parent) = graph.node(node).parent.take() {
            graph.node(parent).children.retain(|&c| c != node);
        }
        // Mark the subtree dead; ids stay allocated.
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            let n = graph.node(id);
            n.live = false;
            stack.extend(n.children.iter().copied());
        }
        graph.animations.retain(|a| a.node != node);
    }

    fn position(&self, node: NodeId) -> Point {
        self.inner.lock().unwrap().node(node).position
    }

    fn set_position(&self, node: NodeId, position: Point) {
        self.inner.lock().unwrap().node(node).position = position;
    }

    fn set_color(&self, node: NodeId, color: RGBA8) {
        self.inner.lock().unwrap().node(node).color = color;
    }

    fn set_text(&self, node: NodeId, text: &str) {
        let mut graph = self.inner.lock().unwrap();
        let n = graph.node(node);
        debug_assert_eq!(n.kind, NodeKind::Label);
        n.text = text.into();
    }

    fn size(&self, node: NodeId) -> Size {
        self.inner.lock().unwrap().node(node).size
    }

    fn animate_position(
        &self,
        node: NodeId,
        to: Point,
        duration: u32,
        curve: Curve,
        done: Option<AnimationDone>,
    ) {
        if self.instant || duration == 0 {
            self.set_position(node, to);
            if let Some(done) = done {
                done();
            }
            return;
        }

        let mut graph = self.inner.lock().unwrap();
        let from = graph.node(node).position;
        graph.animations.retain(|a| a.node != node);
        graph.animations.push(Animation {
            node,
            from,
            to,
            start: None,
            duration,
            curve,
            done,
        });
    }

    fn stop_animations(&self, node: NodeId) {
        self.inner.lock().unwrap().animations.retain(|a| a.node != node);
    }

    fn sequence(&self, now: u32) {
        // Completion hooks run after the lock is released; they are free to
        // call back into the scene.
        let mut finished: Vec<AnimationDone> = Vec::new();
        {
            let mut graph = self.inner.lock().unwrap();
            let mut keep = Vec::new();
            let mut updates = Vec::new();
            for mut animation in std::mem::take(&mut graph.animations) {
                let start = *animation.start.get_or_insert(now);
                let elapsed = now.saturating_sub(start);
                if elapsed >= animation.duration {
                    updates.push((animation.node, animation.to));
                    if let Some(done) = animation.done.take() {
                        finished.push(done);
                    }
                } else {
                    let t = animation.curve.apply(elapsed as f32 / animation.duration as f32);
                    let lerp = |a: i32, b: i32| a + ((b - a) as f32 * t) as i32;
                    updates.push((
                        animation.node,
                        Point::new(
                            lerp(animation.from.x, animation.to.x),
                            lerp(animation.from.y, animation.to.y),
                        ),
                    ));
                    keep.push(animation);
                }
            }
            graph.animations = keep;
            for (node, position) in updates {
                graph.node(node).position = position;
            }
        }
        for done in finished {
            done();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn animation_runs_to_completion() {
        let scene = MemoryScene::new();
        let node = scene.create_group();
        scene.append_child(scene.root(), node);
        scene.set_position(node, Point::new(240, 0));

        let fired = Arc::new(AtomicBool::new(false));
        let hook = fired.clone();
        scene.animate_position(
            node,
            Point::default(),
            300,
            Curve::EaseOutQuad,
            Some(Box::new(move || hook.store(true, Ordering::SeqCst))),
        );

        // First sequence arms the start time.
        scene.sequence(0);
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(scene.position(node).x, 240);

        scene.sequence(150);
        let mid = scene.position(node);
        assert!(mid.x > 0 && mid.x < 240);

        scene.sequence(300);
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(scene.position(node), Point::default());
    }

    #[test]
    fn instant_scene_completes_inline() {
        let scene = MemoryScene::instant();
        let node = scene.create_group();
        let fired = Arc::new(AtomicBool::new(false));
        let hook = fired.clone();
        scene.animate_position(
            node,
            Point::new(1, 2),
            300,
            Curve::EaseInQuad,
            Some(Box::new(move || hook.store(true, Ordering::SeqCst))),
        );
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(scene.position(node), Point::new(1, 2));
    }

    #[test]
    fn remove_detaches_subtree() {
        let scene = MemoryScene::new();
        let group = scene.create_group();
        scene.append_child(scene.root(), group);
        let label = scene.create_label("hello");
        scene.append_child(group, label);

        let live = scene.live_nodes();
        scene.remove(group);
        assert_eq!(scene.live_nodes(), live - 2);
    }
}
