//! Adaptive octree over oriented samples
//!
//! Nodes live in one flat arena and refer to each other by index: a node
//! knows its parent and the index of the first of its eight children, and a
//! key map finds any node from its `(depth, x, y, z)` cell coordinates,
//! which is how neighbors are reached. Nodes holding more samples than the
//! configured threshold are split until the maximum depth.

use cloudmesh_core::{CancellationToken, Error, Point3d, Result};
use std::collections::HashMap;
use std::mem::size_of;
use tracing::debug;

/// Index of a node in the arena
pub type NodeId = usize;

/// Deepest level a key can address
pub const MAX_OCTREE_DEPTH: u32 = 21;

/// Cell coordinates of a node: at depth `d` the cube is cut into `2^d`
/// cells per axis and `x, y, z` are in `0..2^d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    pub depth: u8,
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl NodeKey {
    pub const ROOT: NodeKey = NodeKey { depth: 0, x: 0, y: 0, z: 0 };

    pub fn parent(&self) -> Option<NodeKey> {
        (self.depth > 0).then(|| NodeKey {
            depth: self.depth - 1,
            x: self.x >> 1,
            y: self.y >> 1,
            z: self.z >> 1,
        })
    }

    /// Child in `octant` (bit 0 = x, bit 1 = y, bit 2 = z)
    pub fn child(&self, octant: usize) -> NodeKey {
        NodeKey {
            depth: self.depth + 1,
            x: (self.x << 1) | (octant & 1) as u32,
            y: (self.y << 1) | ((octant >> 1) & 1) as u32,
            z: (self.z << 1) | ((octant >> 2) & 1) as u32,
        }
    }

    /// Same-depth neighbor at the given cell offset, if inside the cube
    pub fn neighbor(&self, dx: i64, dy: i64, dz: i64) -> Option<NodeKey> {
        let cells = 1i64 << self.depth;
        let shift = |c: u32, d: i64| {
            let v = c as i64 + d;
            (0..cells).contains(&v).then_some(v as u32)
        };
        Some(NodeKey {
            depth: self.depth,
            x: shift(self.x, dx)?,
            y: shift(self.y, dy)?,
            z: shift(self.z, dz)?,
        })
    }
}

/// One cell of the octree
#[derive(Debug, Clone)]
pub struct OctreeNode {
    pub key: NodeKey,
    pub parent: Option<NodeId>,
    /// Children occupy `first_child..first_child + 8`, ordered by octant
    pub first_child: Option<NodeId>,
    /// Range of this node's samples in the octree's sample order
    start: usize,
    end: usize,
}

impl OctreeNode {
    pub fn sample_count(&self) -> usize {
        self.end - self.start
    }

    pub fn is_leaf(&self) -> bool {
        self.first_child.is_none()
    }

}

/// Adaptive octree over a cube `[origin, origin + size]^3`
#[derive(Debug, Clone)]
pub struct Octree {
    nodes: Vec<OctreeNode>,
    lookup: HashMap<NodeKey, NodeId>,
    order: Vec<usize>,
    origin: Point3d,
    size: f64,
    deepest: u32,
}

impl Octree {
    /// Build the tree over `positions`, splitting nodes holding more than
    /// `samples_per_node` samples down to `max_depth`.
    ///
    /// Fails with `ResourceExhausted` as soon as the tree outgrows
    /// `memory_budget` bytes; cancellation is checked once per level.
    pub fn build(
        positions: &[Point3d],
        origin: Point3d,
        size: f64,
        max_depth: u32,
        samples_per_node: f64,
        memory_budget: usize,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        if max_depth > MAX_OCTREE_DEPTH {
            return Err(Error::ResourceExhausted(format!(
                "octree depth {max_depth} exceeds the supported maximum of {MAX_OCTREE_DEPTH}"
            )));
        }
        if !(size > 0.0) || !size.is_finite() {
            return Err(Error::DegenerateGeometry(format!(
                "octree needs a cube of positive size, got {size}"
            )));
        }

        let mut tree = Self {
            nodes: vec![OctreeNode {
                key: NodeKey::ROOT,
                parent: None,
                first_child: None,
                start: 0,
                end: positions.len(),
            }],
            lookup: HashMap::from([(NodeKey::ROOT, 0)]),
            order: (0..positions.len()).collect(),
            origin,
            size,
            deepest: 0,
        };

        let mut level: Vec<NodeId> = vec![0];
        for depth in 0..max_depth {
            cancel.check()?;
            let mut next = Vec::new();
            for &id in &level {
                if (tree.nodes[id].sample_count() as f64) <= samples_per_node {
                    continue;
                }
                next.extend(tree.split(id, positions));
            }
            if next.is_empty() {
                break;
            }
            tree.deepest = depth + 1;
            let bytes = tree.memory_bytes();
            if bytes > memory_budget {
                return Err(Error::ResourceExhausted(format!(
                    "octree needs more than {} bytes at depth {} (budget {})",
                    bytes,
                    depth + 1,
                    memory_budget
                )));
            }
            level = next;
        }

        debug!(
            "Built octree with {} nodes, deepest level {}",
            tree.nodes.len(),
            tree.deepest
        );
        Ok(tree)
    }

    /// Create the eight children of `id` and distribute its samples
    fn split(&mut self, id: NodeId, positions: &[Point3d]) -> std::ops::Range<NodeId> {
        let OctreeNode { key, start, end, .. } = self.nodes[id];
        let child_depth = key.depth as u32 + 1;
        let cells = 1u64 << child_depth;
        let cell = self.size / cells as f64;

        let octant_of = |p: &Point3d| {
            let mut octant = 0usize;
            for (axis, parent_coord) in [key.x, key.y, key.z].into_iter().enumerate() {
                let c = ((p[axis] - self.origin[axis]) / cell).floor();
                let c = c.clamp(0.0, (cells - 1) as f64) as u64;
                let bit = c.saturating_sub(2 * parent_coord as u64).min(1) as usize;
                octant |= bit << axis;
            }
            octant
        };

        // Stable counting sort keeps samples ascending within each child.
        let mut buckets: [Vec<usize>; 8] = Default::default();
        for &s in &self.order[start..end] {
            buckets[octant_of(&positions[s])].push(s);
        }

        let first = self.nodes.len();
        let mut cursor = start;
        for (octant, bucket) in buckets.iter().enumerate() {
            let child_key = key.child(octant);
            self.order[cursor..cursor + bucket.len()].copy_from_slice(bucket);
            self.lookup.insert(child_key, self.nodes.len());
            self.nodes.push(OctreeNode {
                key: child_key,
                parent: Some(id),
                first_child: None,
                start: cursor,
                end: cursor + bucket.len(),
            });
            cursor += bucket.len();
        }
        self.nodes[id].first_child = Some(first);
        first..first + 8
    }

    /// Nodes whose cells are at `depth`
    pub fn nodes_at_depth(&self, depth: u32) -> impl Iterator<Item = &OctreeNode> + '_ {
        self.nodes.iter().filter(move |node| node.key.depth as u32 == depth)
    }

    pub fn find(&self, key: &NodeKey) -> Option<NodeId> {
        self.lookup.get(key).copied()
    }

    /// Deepest level that holds a node
    pub fn depth(&self) -> u32 {
        self.deepest
    }

    /// Side of a cell at `depth`
    pub fn cell_size(&self, depth: u32) -> f64 {
        self.size / (1u64 << depth) as f64
    }

    /// Key of the cell at `depth` containing `p`, clamped to the cube
    pub fn cell_containing(&self, p: &Point3d, depth: u32) -> NodeKey {
        let cell = self.cell_size(depth);
        let last = ((1u64 << depth) - 1) as f64;
        let coord = |axis: usize| ((p[axis] - self.origin[axis]) / cell).floor().clamp(0.0, last) as u32;
        NodeKey {
            depth: depth as u8,
            x: coord(0),
            y: coord(1),
            z: coord(2),
        }
    }

    /// Number of samples in cell `key`. Where the tree stops above that
    /// depth, the count of the deepest existing ancestor is spread evenly
    /// over its sub-cells.
    pub fn sample_count_at(&self, key: &NodeKey) -> f64 {
        let mut current = *key;
        loop {
            if let Some(id) = self.find(&current) {
                let spread = 8f64.powi((key.depth - current.depth) as i32);
                return self.nodes[id].sample_count() as f64 / spread;
            }
            match current.parent() {
                Some(parent) => current = parent,
                None => return 0.0,
            }
        }
    }

    /// Sampling density around `p`: cell counts at `depth` blended with a
    /// trilinear kernel centered on `p`
    pub fn density(&self, p: &Point3d, depth: u32) -> f64 {
        let cell = self.cell_size(depth);
        let cells = (1u64 << depth) as f64;
        let u = (p - self.origin) / cell - nalgebra::Vector3::repeat(0.5);
        let base = u.map(f64::floor);

        let mut density = 0.0;
        for corner in 0..8 {
            let mut weight = 1.0;
            let mut coords = [0u32; 3];
            let mut inside = true;
            for axis in 0..3 {
                let c = base[axis] + ((corner >> axis) & 1) as f64;
                if c < 0.0 || c >= cells {
                    inside = false;
                    break;
                }
                weight *= 1.0 - (u[axis] - c).abs();
                coords[axis] = c as u32;
            }
            if !inside || weight <= 0.0 {
                continue;
            }
            let key = NodeKey {
                depth: depth as u8,
                x: coords[0],
                y: coords[1],
                z: coords[2],
            };
            density += weight * self.sample_count_at(&key);
        }
        density
    }

    /// Approximate heap footprint in bytes
    pub fn memory_bytes(&self) -> usize {
        self.nodes.capacity() * size_of::<OctreeNode>()
            + self.lookup.capacity() * (size_of::<NodeKey>() + size_of::<NodeId>() + 8)
            + self.order.capacity() * size_of::<usize>()
    }
}
