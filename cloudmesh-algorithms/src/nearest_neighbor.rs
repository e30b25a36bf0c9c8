//! Nearest neighbor search implementations
//!
//! [`KdTree`] is the index used by every pipeline stage. It wraps a `kiddo`
//! k-d tree built once over an immutable copy of the positions.
//! [`BruteForceSearch`] answers the same queries by linear scan and serves
//! small inputs and cross-checks.
//!
//! Both return neighbors sorted by distance, ties broken by index, so
//! results never depend on how the tree happened to split.

use cloudmesh_core::{NearestNeighborSearch, Point3d, PointCloud, Vector3d};
use kiddo::SquaredEuclidean;
use nalgebra::Rotation3;
use std::cmp::Ordering;
use tracing::debug;

/// Relative slack on query radii, covering rounding in the rotated frame
const RADIUS_SLACK: f64 = 1e-12;

/// Balanced k-d tree over a fixed set of positions.
///
/// Coincident points share one entry in the underlying tree. Positions are
/// stored rotated off the coordinate axes: the tree cannot split a bucket
/// whose points all share one coordinate, and flat scans and grids share
/// them all the time. Distances are rotation invariant, and every reported
/// distance is recomputed from the original positions.
#[derive(Debug, Clone)]
pub struct KdTree {
    points: Vec<Point3d>,
    tree: kiddo::KdTree<f64, 3>,
    /// Point indices grouped by position, ascending within each group
    members: Vec<usize>,
    /// Group `g` is `members[starts[g]..starts[g + 1]]`
    starts: Vec<usize>,
    frame: Frame,
    /// Largest distance from the frame's center to an indexed point
    reach: f64,
}

/// Rigid frame the tree stores its coordinates in
#[derive(Debug, Clone)]
struct Frame {
    center: Point3d,
    rotation: Rotation3<f64>,
}

impl Frame {
    fn key(&self, p: &Point3d) -> [f64; 3] {
        let v: Vector3d = self.rotation * (p - self.center);
        [v.x, v.y, v.z]
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    dist_sq: f64,
    index: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist_sq
            .total_cmp(&other.dist_sq)
            .then(self.index.cmp(&other.index))
    }
}

fn compare_positions(a: &Point3d, b: &Point3d) -> Ordering {
    a.x.total_cmp(&b.x)
        .then(a.y.total_cmp(&b.y))
        .then(a.z.total_cmp(&b.z))
}

impl KdTree {
    /// Build an index over the positions of `cloud`
    pub fn build(cloud: &PointCloud) -> Self {
        Self::from_positions(cloud.positions())
    }

    /// Build an index over `points`; point `i` keeps index `i`. Points with
    /// non-finite coordinates are never returned.
    pub fn from_positions(points: Vec<Point3d>) -> Self {
        let mut members: Vec<usize> = (0..points.len())
            .filter(|&i| points[i].iter().all(|c| c.is_finite()))
            .collect();
        members.sort_unstable_by(|&a, &b| compare_positions(&points[a], &points[b]).then(a.cmp(&b)));

        let mut starts = Vec::new();
        for (slot, &i) in members.iter().enumerate() {
            if slot == 0 || points[members[slot - 1]] != points[i] {
                starts.push(slot);
            }
        }
        starts.push(members.len());

        let center = match members.first() {
            Some(&first) => {
                let (lo, hi) = members.iter().fold((points[first], points[first]), |(lo, hi), &i| {
                    (lo.inf(&points[i]), hi.sup(&points[i]))
                });
                nalgebra::center(&lo, &hi)
            }
            None => Point3d::origin(),
        };
        let frame = Frame {
            center,
            rotation: Rotation3::from_euler_angles(0.3217, 0.5831, 0.1973),
        };
        let reach = members
            .iter()
            .map(|&i| (points[i] - center).norm())
            .fold(0.0, f64::max);

        let mut tree = kiddo::KdTree::new();
        for (group, &start) in starts[..starts.len() - 1].iter().enumerate() {
            tree.add(&frame.key(&points[members[start]]), group as u64);
        }

        debug!(
            points = points.len(),
            distinct = starts.len() - 1,
            "Built k-d tree"
        );
        Self {
            points,
            tree,
            members,
            starts,
            frame,
            reach,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn group_count(&self) -> usize {
        self.starts.len() - 1
    }

    fn group(&self, group: u64) -> &[usize] {
        let g = group as usize;
        &self.members[self.starts[g]..self.starts[g + 1]]
    }

    /// `radius` widened by the rounding the rotated frame can introduce
    /// around `query`, squared
    fn padded_sq(&self, query: &Point3d, radius: f64) -> f64 {
        let scale = self.reach + (query - self.frame.center).norm();
        let padded = radius + RADIUS_SLACK * scale;
        padded * padded
    }

    fn knn(&self, query: &Point3d, k: usize, exclude: Option<usize>) -> Vec<(usize, f64)> {
        let distinct = self.group_count();
        if k == 0 || distinct == 0 || !query.iter().all(|c| c.is_finite()) {
            return Vec::new();
        }
        let wanted = k + usize::from(exclude.is_some());
        let key = self.frame.key(query);

        // Nearest distinct positions until they hold enough points; the
        // farthest of them bounds the answer.
        let mut take = wanted.min(distinct);
        let bound_sq = loop {
            let nearest = self.tree.nearest_n::<SquaredEuclidean>(&key, take);
            let held: usize = nearest.iter().map(|n| self.group(n.item).len()).sum();
            let farthest = nearest.last().map_or(0.0, |n| n.distance);
            if held >= wanted || take == distinct {
                break farthest;
            }
            take = (take * 2).min(distinct);
        };

        let mut found = self.collect_within(query, &key, bound_sq.max(0.0).sqrt(), None, exclude);
        found.truncate(k);
        found
    }

    fn within(&self, query: &Point3d, radius: f64, exclude: Option<usize>) -> Vec<(usize, f64)> {
        if !(radius >= 0.0) || !radius.is_finite() || self.group_count() == 0 {
            return Vec::new();
        }
        if !query.iter().all(|c| c.is_finite()) {
            return Vec::new();
        }
        let key = self.frame.key(query);
        self.collect_within(query, &key, radius, Some(radius * radius), exclude)
    }

    /// Points near `query` sorted by (distance, index). The tree is asked
    /// for a slightly padded radius; `limit_sq`, when given, is then applied
    /// to distances measured on the original positions.
    fn collect_within(
        &self,
        query: &Point3d,
        key: &[f64; 3],
        radius: f64,
        limit_sq: Option<f64>,
        exclude: Option<usize>,
    ) -> Vec<(usize, f64)> {
        let groups = self
            .tree
            .within_unsorted::<SquaredEuclidean>(key, self.padded_sq(query, radius));
        let mut found: Vec<Candidate> = Vec::new();
        for neighbour in &groups {
            for &index in self.group(neighbour.item) {
                if Some(index) == exclude {
                    continue;
                }
                let dist_sq = (self.points[index] - query).norm_squared();
                if limit_sq.map_or(true, |limit| dist_sq <= limit) {
                    found.push(Candidate { dist_sq, index });
                }
            }
        }
        finish(found)
    }
}

/// Sort ascending by (distance, index) and take square roots
fn finish(mut candidates: Vec<Candidate>) -> Vec<(usize, f64)> {
    candidates.sort_unstable();
    candidates
        .into_iter()
        .map(|c| (c.index, c.dist_sq.sqrt()))
        .collect()
}

impl NearestNeighborSearch for KdTree {
    fn find_k_nearest(&self, query: &Point3d, k: usize) -> Vec<(usize, f64)> {
        self.knn(query, k, None)
    }

    fn find_radius_neighbors(&self, query: &Point3d, radius: f64) -> Vec<(usize, f64)> {
        self.within(query, radius, None)
    }

    fn k_nearest_of(&self, index: usize, k: usize) -> Vec<(usize, f64)> {
        match self.points.get(index) {
            Some(query) => self.knn(query, k, Some(index)),
            None => Vec::new(),
        }
    }

    fn radius_neighbors_of(&self, index: usize, radius: f64) -> Vec<(usize, f64)> {
        match self.points.get(index) {
            Some(query) => self.within(query, radius, Some(index)),
            None => Vec::new(),
        }
    }
}

/// Simple brute force nearest neighbor search for small datasets
pub struct BruteForceSearch {
    points: Vec<Point3d>,
}

impl BruteForceSearch {
    pub fn new(points: &[Point3d]) -> Self {
        Self {
            points: points.to_vec(),
        }
    }

    fn scan(&self, query: &Point3d, exclude: Option<usize>) -> Vec<Candidate> {
        self.points
            .iter()
            .enumerate()
            .filter(|(index, _)| Some(*index) != exclude)
            .map(|(index, p)| Candidate {
                dist_sq: (p - query).norm_squared(),
                index,
            })
            .collect()
    }

    fn k_nearest(&self, query: &Point3d, k: usize, exclude: Option<usize>) -> Vec<(usize, f64)> {
        let mut result = finish(self.scan(query, exclude));
        result.truncate(k);
        result
    }

    fn radius(&self, query: &Point3d, radius: f64, exclude: Option<usize>) -> Vec<(usize, f64)> {
        if !(radius >= 0.0) || !radius.is_finite() {
            return Vec::new();
        }
        let radius_sq = radius * radius;
        let mut candidates = self.scan(query, exclude);
        candidates.retain(|c| c.dist_sq <= radius_sq);
        finish(candidates)
    }
}

impl NearestNeighborSearch for BruteForceSearch {
    fn find_k_nearest(&self, query: &Point3d, k: usize) -> Vec<(usize, f64)> {
        self.k_nearest(query, k, None)
    }

    fn find_radius_neighbors(&self, query: &Point3d, radius: f64) -> Vec<(usize, f64)> {
        self.radius(query, radius, None)
    }

    fn k_nearest_of(&self, index: usize, k: usize) -> Vec<(usize, f64)> {
        match self.points.get(index) {
            Some(query) => self.k_nearest(query, k, Some(index)),
            None => Vec::new(),
        }
    }

    fn radius_neighbors_of(&self, index: usize, radius: f64) -> Vec<(usize, f64)> {
        match self.points.get(index) {
            Some(query) => self.radius(query, radius, Some(index)),
            None => Vec::new(),
        }
    }
}
