//! BSP rectangle packer for atlas pages.
//!
//! A page is a square of side `max_size` subdivided by a binary space
//! partition tree. `alloc` returns a node whose rectangle matches the
//! request exactly and is disjoint from every live allocation; `free`
//! releases a leaf and merges sibling pairs upward while both subtrees
//! are unused. Nodes live in an arena and are addressed by typed ids, so
//! the parent/child links carry no pointer cycles.

use crate::geom::Rect;

const MIN_SIZE: i32 = 1;

/// Type-safe handle to a BSP node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    const fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
struct Node {
    x: i32,
    y: i32,
    width: i32,
    height: i32,
    used: bool,
    parent: Option<NodeId>,
    child0: Option<NodeId>,
    child1: Option<NodeId>,
}

/// One atlas page.
#[derive(Debug, Default)]
pub struct Page {
    nodes: Vec<Option<Node>>,
    free_slots: Vec<u32>,
    root: Option<NodeId>,
    max_size: i32,
}

/// How much a rectangle resembles a square: 1.0 for a square, down to 0
/// for a degenerate rectangle.
fn square(width: i32, height: i32) -> f64 {
    if width == 0 && height == 0 {
        return 0.0;
    }
    if width <= height {
        f64::from(width) / f64::from(height)
    } else {
        f64::from(height) / f64::from(width)
    }
}

impl Page {
    #[must_use]
    pub fn new(max_size: i32) -> Self {
        assert!(max_size > 0, "packing: max_size must be > 0");
        Self {
            nodes: Vec::new(),
            free_slots: Vec::new(),
            root: None,
            max_size,
        }
    }

    #[must_use]
    pub const fn max_size(&self) -> i32 {
        self.max_size
    }

    /// Whether nothing is allocated on this page.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self.root {
            None => true,
            Some(id) => {
                let root = self.node(id);
                !root.used && root.child0.is_none() && root.child1.is_none()
            }
        }
    }

    /// The rectangle covered by a live node.
    #[must_use]
    pub fn region(&self, id: NodeId) -> Rect {
        let n = self.node(id);
        Rect::new(n.x, n.y, n.width, n.height)
    }

    /// Allocate a `width` x `height` rectangle. Returns `None` when no
    /// free region fits. Zero or negative dimensions are contract
    /// violations.
    pub fn alloc(&mut self, width: i32, height: i32) -> Option<NodeId> {
        assert!(width > 0 && height > 0, "packing: width and height must be > 0");
        let width = width.max(MIN_SIZE);
        let height = height.max(MIN_SIZE);
        if self.root.is_none() {
            let root = self.insert(Node {
                x: 0,
                y: 0,
                width: self.max_size,
                height: self.max_size,
                used: false,
                parent: None,
                child0: None,
                child1: None,
            });
            self.root = Some(root);
        }
        let root = self.root.unwrap();
        self.alloc_in(root, width, height)
    }

    /// Release a previously allocated leaf. Merges sibling pairs upward
    /// while both subtrees are free.
    pub fn free(&mut self, id: NodeId) {
        {
            let n = self.node(id);
            assert!(
                n.child0.is_none() && n.child1.is_none(),
                "packing: can't free a node with children"
            );
        }
        self.node_mut(id).used = false;
        let Some(parent) = self.node(id).parent else {
            return;
        };
        let (c0, c1) = {
            let p = self.node(parent);
            (p.child0.unwrap(), p.child1.unwrap())
        };
        if self.can_free(c0) && self.can_free(c1) {
            self.remove_subtree(c0);
            self.remove_subtree(c1);
            let p = self.node_mut(parent);
            p.child0 = None;
            p.child1 = None;
            self.free(parent);
        }
    }

    fn alloc_in(&mut self, id: NodeId, width: i32, height: i32) -> Option<NodeId> {
        let (nw, nh, used, c0, c1) = {
            let n = self.node(id);
            (n.width, n.height, n.used, n.child0, n.child1)
        };
        if nw < width || nh < height || used {
            return None;
        }
        if c0.is_none() && c1.is_none() {
            if nw == width && nh == height {
                self.node_mut(id).used = true;
                return Some(id);
            }
            let (nx, ny) = {
                let n = self.node(id);
                (n.x, n.y)
            };
            // Split along the axis whose larger residual is closer to
            // square; ties favor the vertical split.
            let (first, second) = if square(nw - width, nh) >= square(nw, nh - height) {
                (
                    Node {
                        x: nx,
                        y: ny,
                        width,
                        height: nh,
                        used: false,
                        parent: Some(id),
                        child0: None,
                        child1: None,
                    },
                    Node {
                        x: nx + width,
                        y: ny,
                        width: nw - width,
                        height: nh,
                        used: false,
                        parent: Some(id),
                        child0: None,
                        child1: None,
                    },
                )
            } else {
                (
                    Node {
                        x: nx,
                        y: ny,
                        width: nw,
                        height,
                        used: false,
                        parent: Some(id),
                        child0: None,
                        child1: None,
                    },
                    Node {
                        x: nx,
                        y: ny + height,
                        width: nw,
                        height: nh - height,
                        used: false,
                        parent: Some(id),
                        child0: None,
                        child1: None,
                    },
                )
            };
            let c0 = self.insert(first);
            let c1 = self.insert(second);
            let n = self.node_mut(id);
            n.child0 = Some(c0);
            n.child1 = Some(c1);
            return self.alloc_in(c0, width, height);
        }
        let (c0, c1) = (c0.unwrap(), c1.unwrap());
        if let Some(found) = self.alloc_in(c0, width, height) {
            return Some(found);
        }
        self.alloc_in(c1, width, height)
    }

    fn can_free(&self, id: NodeId) -> bool {
        let n = self.node(id);
        if n.used {
            return false;
        }
        match (n.child0, n.child1) {
            (None, None) => true,
            (Some(c0), Some(c1)) => self.can_free(c0) && self.can_free(c1),
            _ => unreachable!("packing: node with exactly one child"),
        }
    }

    fn remove_subtree(&mut self, id: NodeId) {
        let (c0, c1) = {
            let n = self.node(id);
            (n.child0, n.child1)
        };
        if let Some(c0) = c0 {
            self.remove_subtree(c0);
        }
        if let Some(c1) = c1 {
            self.remove_subtree(c1);
        }
        self.nodes[id.index()] = None;
        self.free_slots.push(id.0);
    }

    fn insert(&mut self, node: Node) -> NodeId {
        if let Some(slot) = self.free_slots.pop() {
            self.nodes[slot as usize] = Some(node);
            return NodeId(slot);
        }
        self.nodes.push(Some(node));
        NodeId((self.nodes.len() - 1) as u32)
    }

    fn node(&self, id: NodeId) -> &Node {
        self.nodes[id.index()].as_ref().expect("packing: dangling node id")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.index()].as_mut().expect("packing: dangling node id")
    }
}
