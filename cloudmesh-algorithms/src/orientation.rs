//! Consistent normal orientation
//!
//! PCA normals have an arbitrary sign. Orientation grows a minimum spanning
//! tree over the neighbor graph, where an edge costs `1 - |n_i . n_j|`, so
//! the tree prefers to cross between nearly parallel normals. Walking the
//! tree from a root whose sign is fixed by a heuristic, every point takes
//! the sign that agrees with its tree parent.

use crate::neighbor_graph::NeighborGraph;
use crate::normals::UnorientedNormals;
use cloudmesh_core::{
    CancellationToken, CloudId, Error, Point3d, PointCloud, Result, Vector3d,
};
use priority_queue::PriorityQueue;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, info};

/// Projections smaller than this do not decide a root's sign
const ROOT_SIGN_EPSILON: f64 = 1e-6;

/// How much trust a point's normal sign deserves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrientationFlag {
    /// Agrees with its neighbors through the spanning tree
    Consistent,
    /// Sign chosen by the root heuristic alone (isolated point)
    Arbitrary,
    /// No normal could be estimated; the stored vector is a placeholder
    Undefined,
}

/// Unit normals with a consistent sign, one per point of a cloud.
#[derive(Debug, Clone, PartialEq)]
pub struct OrientedNormalSet {
    cloud_id: CloudId,
    normals: Vec<Vector3d>,
    flags: Vec<OrientationFlag>,
}

impl OrientedNormalSet {
    pub fn new(cloud_id: CloudId, normals: Vec<Vector3d>, flags: Vec<OrientationFlag>) -> Self {
        debug_assert_eq!(normals.len(), flags.len());
        Self {
            cloud_id,
            normals,
            flags,
        }
    }

    /// Take the normals the points already carry, treating them as oriented.
    ///
    /// Missing, zero or non-finite normals become `Undefined`. Fails with
    /// `DegenerateGeometry` when no point has a usable normal.
    pub fn from_cloud(cloud: &PointCloud) -> Result<Self> {
        let (normals, flags): (Vec<_>, Vec<_>) = cloud
            .iter()
            .map(|p| {
                match p
                    .normal
                    .filter(|n| n.iter().all(|c| c.is_finite()))
                    .and_then(|n| n.try_normalize(f64::MIN_POSITIVE))
                {
                    Some(n) => (n, OrientationFlag::Consistent),
                    None => (Vector3d::z(), OrientationFlag::Undefined),
                }
            })
            .unzip();
        let set = Self::new(cloud.id(), normals, flags);
        if set.defined_count() == 0 {
            return Err(Error::DegenerateGeometry(
                "no point carries a usable normal".to_string(),
            ));
        }
        Ok(set)
    }

    pub fn cloud_id(&self) -> CloudId {
        self.cloud_id
    }

    pub fn is_valid_for(&self, cloud: &PointCloud) -> bool {
        self.cloud_id == cloud.id() && self.normals.len() == cloud.len()
    }

    pub fn len(&self) -> usize {
        self.normals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.normals.is_empty()
    }

    pub fn normal(&self, i: usize) -> Vector3d {
        self.normals[i]
    }

    pub fn flag(&self, i: usize) -> OrientationFlag {
        self.flags[i]
    }

    /// Whether point `i` has a real normal
    pub fn is_defined(&self, i: usize) -> bool {
        self.flags[i] != OrientationFlag::Undefined
    }

    /// Whether point `i` was oriented through its neighbors
    pub fn is_confident(&self, i: usize) -> bool {
        self.flags[i] == OrientationFlag::Consistent
    }

    pub fn defined_count(&self) -> usize {
        self.flags
            .iter()
            .filter(|&&f| f != OrientationFlag::Undefined)
            .count()
    }

    pub fn normals(&self) -> &[Vector3d] {
        &self.normals
    }

    pub fn flags(&self) -> &[OrientationFlag] {
        &self.flags
    }
}

/// Priority of attaching `node` to the tree through `parent`
#[derive(Debug, Clone, Copy)]
struct AttachCost {
    weight: f64,
    parent: usize,
}

impl PartialEq for AttachCost {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for AttachCost {}

impl PartialOrd for AttachCost {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AttachCost {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-queue: the cheapest edge has the highest priority.
        other
            .weight
            .total_cmp(&self.weight)
            .then(other.parent.cmp(&self.parent))
    }
}

/// Give every normal a sign consistent with its neighbors.
///
/// Each connected component of the neighbor graph is handled on its own:
/// it is rooted at its highest point, the root normal is pointed away from
/// the component centroid, and the sign is propagated along a minimum
/// spanning tree. Components cannot see each other, so their relative sign
/// is only as good as the root heuristic.
pub fn orient_normals(
    cloud: &PointCloud,
    graph: &NeighborGraph,
    unoriented: &UnorientedNormals,
    cancel: &CancellationToken,
) -> Result<OrientedNormalSet> {
    graph.ensure_valid_for(cloud)?;
    if unoriented.cloud_id() != cloud.id() || unoriented.len() != cloud.len() {
        return Err(Error::InvalidParameters(
            "normals were estimated for a different point cloud".to_string(),
        ));
    }
    if unoriented.valid_count() == 0 {
        return Err(Error::DegenerateGeometry(
            "no defined normal to orient".to_string(),
        ));
    }
    cancel.check()?;

    let start = Instant::now();
    let n = cloud.len();
    let positions = cloud.positions();
    let adjacency = symmetric_adjacency(graph, unoriented);

    let mut normals: Vec<Vector3d> = unoriented
        .as_slice()
        .iter()
        .map(|n| n.unwrap_or_else(Vector3d::z))
        .collect();
    let mut flags: Vec<OrientationFlag> = unoriented
        .as_slice()
        .iter()
        .map(|n| match n {
            Some(_) => OrientationFlag::Consistent,
            None => OrientationFlag::Undefined,
        })
        .collect();

    let mut visited = vec![false; n];
    let mut in_tree = vec![false; n];
    let mut components = 0usize;
    let mut steps = 0usize;

    for seed in 0..n {
        if visited[seed] || !unoriented.is_valid(seed) {
            continue;
        }
        let members = collect_component(seed, &adjacency, &mut visited);
        components += 1;

        let root = highest_point(&members, &positions);
        let centroid = centroid_of(&members, &positions);
        normals[root] = orient_root(normals[root], &positions[root], &centroid);
        if members.len() == 1 {
            flags[root] = OrientationFlag::Arbitrary;
            continue;
        }

        in_tree[root] = true;
        let mut queue: PriorityQueue<usize, AttachCost> = PriorityQueue::new();
        push_neighbors(root, &adjacency, &normals, &in_tree, &mut queue);

        while let Some((node, cost)) = queue.pop() {
            steps += 1;
            if steps % 4096 == 0 {
                cancel.check()?;
            }
            in_tree[node] = true;
            if normals[node].dot(&normals[cost.parent]) < 0.0 {
                normals[node] = -normals[node];
            }
            push_neighbors(node, &adjacency, &normals, &in_tree, &mut queue);
        }
    }
    cancel.check()?;

    debug!("Orientation found {} connected components", components);
    info!(
        "Oriented {} normals in {:?}",
        unoriented.valid_count(),
        start.elapsed()
    );

    Ok(OrientedNormalSet::new(cloud.id(), normals, flags))
}

/// Undirected neighbor lists restricted to points with a defined normal
fn symmetric_adjacency(graph: &NeighborGraph, normals: &UnorientedNormals) -> Vec<Vec<usize>> {
    let mut adjacency = vec![Vec::new(); graph.len()];
    for i in 0..graph.len() {
        if !normals.is_valid(i) {
            continue;
        }
        for neighbor in graph.neighbors(i) {
            let j = neighbor.index;
            if j != i && normals.is_valid(j) {
                adjacency[i].push(j);
                adjacency[j].push(i);
            }
        }
    }
    for list in &mut adjacency {
        list.sort_unstable();
        list.dedup();
    }
    adjacency
}

fn collect_component(seed: usize, adjacency: &[Vec<usize>], visited: &mut [bool]) -> Vec<usize> {
    let mut members = Vec::new();
    let mut queue = VecDeque::from([seed]);
    visited[seed] = true;
    while let Some(i) = queue.pop_front() {
        members.push(i);
        for &j in &adjacency[i] {
            if !visited[j] {
                visited[j] = true;
                queue.push_back(j);
            }
        }
    }
    members
}

/// Highest z, ties to the lowest index
fn highest_point(members: &[usize], positions: &[Point3d]) -> usize {
    members
        .iter()
        .copied()
        .max_by(|&a, &b| positions[a].z.total_cmp(&positions[b].z).then(b.cmp(&a)))
        .unwrap_or(members[0])
}

fn centroid_of(members: &[usize], positions: &[Point3d]) -> Point3d {
    let sum = members
        .iter()
        .fold(Vector3d::zeros(), |acc, &i| acc + positions[i].coords);
    Point3d::from(sum / members.len() as f64)
}

/// Point the root normal away from the centroid, or along +z, +y, +x when
/// the root lies in the plane of its normal through the centroid.
fn orient_root(normal: Vector3d, root: &Point3d, centroid: &Point3d) -> Vector3d {
    let outward = root - centroid;
    let projection = normal.dot(&outward);
    if projection.abs() > ROOT_SIGN_EPSILON * outward.norm() {
        return if projection < 0.0 { -normal } else { normal };
    }
    for axis in [2, 1, 0] {
        if normal[axis].abs() > ROOT_SIGN_EPSILON {
            return if normal[axis] < 0.0 { -normal } else { normal };
        }
    }
    normal
}

fn push_neighbors(
    node: usize,
    adjacency: &[Vec<usize>],
    normals: &[Vector3d],
    in_tree: &[bool],
    queue: &mut PriorityQueue<usize, AttachCost>,
) {
    for &next in &adjacency[node] {
        if in_tree[next] {
            continue;
        }
        let weight = 1.0 - normals[node].dot(&normals[next]).abs();
        queue.push_increase(next, AttachCost { weight, parent: node });
    }
}
