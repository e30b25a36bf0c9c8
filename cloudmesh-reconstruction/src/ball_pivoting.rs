//! Ball Pivoting Algorithm
//!
//! A ball of radius ρ is dropped onto three points to form a seed triangle
//! and then rolled over each boundary edge of the growing mesh until it
//! touches a new point, which forms the next triangle. The ball may never
//! contain a point, so the mesh only bridges gaps narrower than the ball.
//! Holes are expected where the sampling is sparser than ρ.
//!
//! Several radii can be run in ascending order: each later pass first
//! re-pivots the edges the smaller balls could not cross, then looks for
//! new seeds.

use cloudmesh_algorithms::{parallel, KdTree, OrientedNormalSet};
use cloudmesh_core::{
    CancellationToken, Error, NearestNeighborSearch, Point3d, PointCloud, Result, TriangleMesh,
    Vector3d,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::f64::consts::TAU;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Relative tolerance of the empty-ball test; points this close to the
/// sphere count as on it
const EMPTY_BALL_TOLERANCE: f64 = 1e-7;

/// Rotation angles above `-PIVOT_ANGLE_EPSILON` count as no rotation
const PIVOT_ANGLE_EPSILON: f64 = 1e-9;

/// Front iterations between cancellation checks
const CANCEL_CHECK_INTERVAL: usize = 256;

/// Multipliers of the mean spacing tried by [`BallRadius::Auto`]. Every
/// prefix is one candidate schedule.
const AUTO_MULTIPLIERS: [f64; 5] = [1.0, 2.0, 4.0, 8.0, 16.0];

/// Ball radius selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum BallRadius {
    /// Derived from the mean nearest-neighbor spacing
    #[default]
    Auto,
    /// One pass with this radius
    Fixed(f64),
    /// One pass per radius, smallest first
    Radii(Vec<f64>),
}

/// Configuration for Ball Pivoting Algorithm
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BallPivotingConfig {
    /// Ball radius for reconstruction
    pub radius: BallRadius,
}

impl BallPivotingConfig {
    pub fn with_radius(radius: f64) -> Self {
        Self {
            radius: BallRadius::Fixed(radius),
        }
    }

    pub fn with_radii(radii: Vec<f64>) -> Self {
        Self {
            radius: BallRadius::Radii(radii),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let check = |r: f64| {
            if r > 0.0 && r.is_finite() {
                Ok(())
            } else {
                Err(Error::InvalidParameters(format!(
                    "ball radius must be positive and finite, got {r}"
                )))
            }
        };
        match &self.radius {
            BallRadius::Auto => Ok(()),
            BallRadius::Fixed(r) => check(*r),
            BallRadius::Radii(radii) if radii.is_empty() => Err(Error::InvalidParameters(
                "ball radius list is empty".to_string(),
            )),
            BallRadius::Radii(radii) => radii.iter().try_for_each(|&r| check(r)),
        }
    }
}

/// Statistics of one radius pass
#[derive(Debug, Clone, PartialEq)]
pub struct PivotPass {
    pub radius: f64,
    pub seeds: usize,
    pub faces_added: usize,
    /// Edges still without a second face after the pass
    pub boundary_edges: usize,
}

/// Output of a ball pivoting run
#[derive(Debug, Clone)]
pub struct BallPivotingResult {
    /// Vertex `i` is input point `i`; points never reached stay unreferenced
    pub mesh: TriangleMesh,
    /// Fraction of points with a defined normal that ended up in a face
    pub coverage: f64,
    pub passes: Vec<PivotPass>,
}

/// Reconstruct a mesh by ball pivoting.
///
/// `index` must be built over `cloud`. Points flagged `Undefined` in
/// `normals` are ignored. Fewer than three usable points, or no seed
/// triangle, give an empty mesh rather than an error.
pub fn ball_pivoting(
    cloud: &PointCloud,
    normals: &OrientedNormalSet,
    index: &KdTree,
    config: &BallPivotingConfig,
    cancel: &CancellationToken,
) -> Result<BallPivotingResult> {
    config.validate()?;
    if !normals.is_valid_for(cloud) {
        return Err(Error::InvalidParameters(
            "normals were computed for a different point cloud".to_string(),
        ));
    }
    if index.len() != cloud.len() {
        return Err(Error::InvalidParameters(format!(
            "spatial index holds {} points, cloud has {}",
            index.len(),
            cloud.len()
        )));
    }

    let start = Instant::now();
    let valid: Vec<bool> = (0..cloud.len())
        .map(|i| normals.is_defined(i) && cloud.points()[i].is_finite())
        .collect();
    let valid_count = valid.iter().filter(|&&v| v).count();
    info!("Starting ball pivoting on {} points", valid_count);

    let result = if valid_count < 3 {
        warn!("Ball pivoting needs at least 3 points with normals, got {}", valid_count);
        empty_result(cloud)
    } else {
        match &config.radius {
            BallRadius::Fixed(r) => run_schedule(cloud, normals, index, &valid, &[*r], cancel)?,
            BallRadius::Radii(radii) => {
                let mut radii = radii.clone();
                radii.sort_by(f64::total_cmp);
                radii.dedup();
                run_schedule(cloud, normals, index, &valid, &radii, cancel)?
            }
            BallRadius::Auto => run_auto(cloud, normals, index, &valid, cancel)?,
        }
    };

    info!(
        "Ball pivoting produced {} faces, coverage {:.1}% in {:?}",
        result.mesh.face_count(),
        result.coverage * 100.0,
        start.elapsed()
    );
    Ok(result)
}

fn empty_result(cloud: &PointCloud) -> BallPivotingResult {
    BallPivotingResult {
        mesh: TriangleMesh::from_vertices_and_faces(cloud.positions(), Vec::new()),
        coverage: 0.0,
        passes: Vec::new(),
    }
}

/// Try each automatic schedule and keep the best manifold result
fn run_auto(
    cloud: &PointCloud,
    normals: &OrientedNormalSet,
    index: &KdTree,
    valid: &[bool],
    cancel: &CancellationToken,
) -> Result<BallPivotingResult> {
    let spacing = mean_spacing(cloud, index, valid, cancel)?;
    debug!("Mean point spacing {:.6}", spacing);

    // Schedules share their leading passes, so one run yields them all.
    let radii: Vec<f64> = AUTO_MULTIPLIERS.iter().map(|m| m * spacing).collect();
    let mut best: Option<BallPivotingResult> = None;
    for candidate in run_passes(cloud, normals, index, valid, &radii, cancel)? {
        let schedule: Vec<f64> = candidate.passes.iter().map(|p| p.radius).collect();
        let non_manifold = candidate.mesh.topology().non_manifold_edges;
        if non_manifold > 0 {
            warn!(
                "Radii {:?} left {} non-manifold edges, skipping",
                schedule, non_manifold
            );
            continue;
        }
        debug!("Radii {:?} cover {:.1}%", schedule, candidate.coverage * 100.0);
        if best.as_ref().map_or(true, |b| candidate.coverage > b.coverage) {
            best = Some(candidate);
        }
    }

    match best {
        Some(best) => Ok(best),
        None => run_schedule(cloud, normals, index, valid, &[spacing], cancel),
    }
}

/// Mean distance from each usable point to its nearest distinct neighbor.
///
/// Fails with `DegenerateGeometry` when every point coincides with its
/// neighbors.
pub fn mean_spacing(
    cloud: &PointCloud,
    index: &KdTree,
    valid: &[bool],
    cancel: &CancellationToken,
) -> Result<f64> {
    let candidates: Vec<usize> = (0..cloud.len()).filter(|&i| valid[i]).collect();
    let spacings = parallel::parallel_map(&candidates, |&i| {
        if cancel.is_cancelled() {
            return None;
        }
        index
            .k_nearest_of(i, 4)
            .into_iter()
            .map(|(_, d)| d)
            .find(|&d| d > 0.0)
    });
    cancel.check()?;

    let (sum, count) = spacings
        .iter()
        .flatten()
        .fold((0.0, 0usize), |(s, c), &d| (s + d, c + 1));
    if count == 0 {
        return Err(Error::DegenerateGeometry(
            "points have no distinct neighbors to derive a ball radius from".to_string(),
        ));
    }
    Ok(sum / count as f64)
}

fn run_schedule(
    cloud: &PointCloud,
    normals: &OrientedNormalSet,
    index: &KdTree,
    valid: &[bool],
    radii: &[f64],
    cancel: &CancellationToken,
) -> Result<BallPivotingResult> {
    let mut results = run_passes(cloud, normals, index, valid, radii, cancel)?;
    Ok(results.pop().unwrap_or_else(|| empty_result(cloud)))
}

/// Run one pass per radius, in order. Entry `i` of the result is the mesh
/// after pass `i`, the same mesh the schedule `radii[..=i]` gives alone.
fn run_passes(
    cloud: &PointCloud,
    normals: &OrientedNormalSet,
    index: &KdTree,
    valid: &[bool],
    radii: &[f64],
    cancel: &CancellationToken,
) -> Result<Vec<BallPivotingResult>> {
    let positions = cloud.positions();
    let valid_count = valid.iter().filter(|&&v| v).count();
    let mut pivoter = Pivoter::new(&positions, normals.normals(), valid, index, cancel);
    let mut passes = Vec::with_capacity(radii.len());
    let mut results = Vec::with_capacity(radii.len());
    for (pass, &radius) in radii.iter().enumerate() {
        let faces_before = pivoter.faces.len();
        if pass > 0 {
            pivoter.reopen_boundary();
        }
        let seeds = pivoter.run_pass(radius)?;
        let stats = PivotPass {
            radius,
            seeds,
            faces_added: pivoter.faces.len() - faces_before,
            boundary_edges: pivoter.open_edge_count(),
        };
        debug!(
            "Pass {} (radius {:.6}): {} seeds, {} faces, {} boundary edges",
            pass, radius, stats.seeds, stats.faces_added, stats.boundary_edges
        );
        passes.push(stats);

        let used = pivoter.used.iter().filter(|&&u| u).count();
        let coverage = if valid_count > 0 {
            used as f64 / valid_count as f64
        } else {
            0.0
        };
        results.push(BallPivotingResult {
            mesh: TriangleMesh::from_vertices_and_faces(positions.clone(), pivoter.faces.clone()),
            coverage,
            passes: passes.clone(),
        });
    }
    Ok(results)
}

/// Directed edge `a -> b` of face `(a, b, opposite)` waiting to be pivoted
#[derive(Debug, Clone, Copy)]
struct FrontEdge {
    a: usize,
    b: usize,
    opposite: usize,
}

#[derive(Debug, Clone, Copy)]
struct EdgeState {
    faces: u8,
    /// Direction of the edge in its first face
    from: usize,
}

struct Pivoter<'a> {
    positions: &'a [Point3d],
    normals: &'a [Vector3d],
    valid: &'a [bool],
    index: &'a KdTree,
    cancel: &'a CancellationToken,
    faces: Vec<[usize; 3]>,
    face_keys: HashSet<[usize; 3]>,
    edges: HashMap<(usize, usize), EdgeState>,
    front: VecDeque<FrontEdge>,
    boundary: Vec<FrontEdge>,
    used: Vec<bool>,
    /// Number of single-face edges touching each point
    open_edges: Vec<u32>,
    iterations: usize,
}

impl<'a> Pivoter<'a> {
    fn new(
        positions: &'a [Point3d],
        normals: &'a [Vector3d],
        valid: &'a [bool],
        index: &'a KdTree,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            positions,
            normals,
            valid,
            index,
            cancel,
            faces: Vec::new(),
            face_keys: HashSet::new(),
            edges: HashMap::new(),
            front: VecDeque::new(),
            boundary: Vec::new(),
            used: vec![false; positions.len()],
            open_edges: vec![0; positions.len()],
            iterations: 0,
        }
    }

    /// Expand the front, then seed and expand again until no seed is left.
    /// Returns the number of seeds found.
    fn run_pass(&mut self, radius: f64) -> Result<usize> {
        self.expand_front(radius)?;
        let mut seeds = 0;
        let mut cursor = 0;
        while let Some(next) = self.find_seed(radius, cursor)? {
            seeds += 1;
            cursor = next;
            self.expand_front(radius)?;
        }
        Ok(seeds)
    }

    /// Move boundary edges back onto the front for a larger ball
    fn reopen_boundary(&mut self) {
        let boundary = std::mem::take(&mut self.boundary);
        self.front.extend(boundary);
    }

    fn open_edge_count(&self) -> usize {
        self.edges.values().filter(|state| state.faces == 1).count()
    }

    fn edge_faces(&self, a: usize, b: usize) -> u8 {
        self.edges
            .get(&(a.min(b), a.max(b)))
            .map_or(0, |state| state.faces)
    }

    fn expand_front(&mut self, radius: f64) -> Result<()> {
        while let Some(edge) = self.front.pop_front() {
            self.iterations += 1;
            if self.iterations % CANCEL_CHECK_INTERVAL == 0 {
                self.cancel.check()?;
            }
            if self.edge_faces(edge.a, edge.b) != 1 {
                continue;
            }
            match self.pivot(&edge, radius) {
                Some(k) if self.can_add(&[edge.b, edge.a, k]) => {
                    self.add_face([edge.b, edge.a, k]);
                }
                _ => self.boundary.push(edge),
            }
        }
        Ok(())
    }

    /// Rotate the ball resting on `edge`'s face around the edge and return
    /// the first point it touches
    fn pivot(&self, edge: &FrontEdge, radius: f64) -> Option<usize> {
        let (a, b, o) = (edge.a, edge.b, edge.opposite);
        let pa = self.positions[a];
        let pb = self.positions[b];
        let center = ball_center(&pa, &pb, &self.positions[o], radius)?;

        let mid = Point3d::from((pa.coords + pb.coords) * 0.5);
        let axis = (pb - pa).try_normalize(f64::MIN_POSITIVE)?;
        let start = perpendicular(&(center - mid), &axis)?;

        let mut candidates: Vec<(f64, usize, Point3d)> = self
            .index
            .find_radius_neighbors(&mid, 2.0 * radius)
            .into_iter()
            .filter(|&(k, _)| k != a && k != b && k != o && self.valid[k])
            .filter_map(|(k, _)| {
                let face = [b, a, k];
                if !self.agrees_with_normals(&face) {
                    return None;
                }
                let c = ball_center(&pb, &pa, &self.positions[k], radius)?;
                let end = perpendicular(&(c - mid), &axis)?;
                let mut angle = axis.dot(&start.cross(&end)).atan2(start.dot(&end));
                if angle < -PIVOT_ANGLE_EPSILON {
                    angle += TAU;
                } else if angle < 0.0 {
                    angle = 0.0;
                }
                Some((angle, k, c))
            })
            .collect();
        candidates.sort_by(|x, y| x.0.total_cmp(&y.0).then(x.1.cmp(&y.1)));

        candidates
            .into_iter()
            .find(|(_, k, c)| self.ball_is_empty(c, radius, &[a, b, *k]))
            .map(|(_, k, _)| k)
    }

    /// Scan unused points from `cursor` for a seed triangle and add it.
    /// Returns where the next scan should resume.
    fn find_seed(&mut self, radius: f64, cursor: usize) -> Result<Option<usize>> {
        for i in cursor..self.positions.len() {
            self.cancel.check()?;
            if !self.valid[i] || self.used[i] {
                continue;
            }
            let neighbors: Vec<usize> = self
                .index
                .radius_neighbors_of(i, 2.0 * radius)
                .into_iter()
                .map(|(j, _)| j)
                .filter(|&j| self.valid[j] && !self.used[j])
                .collect();

            for (&j, &k) in neighbors.iter().tuple_combinations() {
                if (self.positions[j] - self.positions[k]).norm() > 2.0 * radius {
                    continue;
                }
                let face = if self.agrees_with_normals(&[i, j, k]) {
                    [i, j, k]
                } else if self.agrees_with_normals(&[i, k, j]) {
                    [i, k, j]
                } else {
                    continue;
                };
                let [p0, p1, p2] = face.map(|v| self.positions[v]);
                let Some(center) = ball_center(&p0, &p1, &p2, radius) else {
                    continue;
                };
                if self.ball_is_empty(&center, radius, &face) && self.can_add(&face) {
                    self.add_face(face);
                    return Ok(Some(i + 1));
                }
            }
        }
        Ok(None)
    }

    /// Every vertex normal lies on the positive side of the face
    fn agrees_with_normals(&self, face: &[usize; 3]) -> bool {
        let [p0, p1, p2] = face.map(|v| self.positions[v]);
        let n = (p1 - p0).cross(&(p2 - p0));
        face.iter().all(|&v| n.dot(&self.normals[v]) > 0.0)
    }

    fn ball_is_empty(&self, center: &Point3d, radius: f64, touching: &[usize]) -> bool {
        let inner = radius * (1.0 - EMPTY_BALL_TOLERANCE);
        self.index
            .find_radius_neighbors(center, inner)
            .into_iter()
            .all(|(p, _)| !self.valid[p] || touching.contains(&p))
    }

    /// Whether `face` keeps the mesh edge-manifold
    fn can_add(&self, face: &[usize; 3]) -> bool {
        let mut key = *face;
        key.sort_unstable();
        if self.face_keys.contains(&key) {
            return false;
        }
        let k = face[2];
        if self.used[k] && self.open_edges[k] == 0 {
            return false;
        }
        (0..3).all(|e| {
            let (u, v) = (face[e], face[(e + 1) % 3]);
            match self.edges.get(&(u.min(v), u.max(v))) {
                None => true,
                // The neighbor face must run the shared edge the other way.
                Some(state) => state.faces == 1 && state.from == v,
            }
        })
    }

    fn add_face(&mut self, face: [usize; 3]) {
        let mut key = face;
        key.sort_unstable();
        self.face_keys.insert(key);
        self.faces.push(face);

        for e in 0..3 {
            let (u, v, w) = (face[e], face[(e + 1) % 3], face[(e + 2) % 3]);
            self.used[u] = true;
            let state = self
                .edges
                .entry((u.min(v), u.max(v)))
                .or_insert(EdgeState { faces: 0, from: u });
            state.faces += 1;
            if state.faces == 1 {
                self.open_edges[u] += 1;
                self.open_edges[v] += 1;
                self.front.push_back(FrontEdge { a: u, b: v, opposite: w });
            } else {
                self.open_edges[u] = self.open_edges[u].saturating_sub(1);
                self.open_edges[v] = self.open_edges[v].saturating_sub(1);
            }
        }
    }
}

/// Component of `v` perpendicular to the unit `axis`, normalized
fn perpendicular(v: &Vector3d, axis: &Vector3d) -> Option<Vector3d> {
    (v - axis * axis.dot(v)).try_normalize(f64::MIN_POSITIVE)
}

/// Center of the ball of `radius` touching `p0`, `p1` and `p2`, on the side
/// the counter-clockwise face normal points to. `None` when the points are
/// collinear or farther apart than the ball allows.
pub fn ball_center(p0: &Point3d, p1: &Point3d, p2: &Point3d, radius: f64) -> Option<Point3d> {
    let a = p1 - p0;
    let b = p2 - p0;
    let normal = a.cross(&b);
    let normal_sq = normal.norm_squared();
    if normal_sq <= 1e-24 * a.norm_squared() * b.norm_squared() || normal_sq == 0.0 {
        return None;
    }

    let offset = (b * a.norm_squared() - a * b.norm_squared()).cross(&normal) / (2.0 * normal_sq);
    let circumcenter = p0 + offset;
    let height_sq = radius * radius - offset.norm_squared();
    if height_sq < 0.0 {
        return None;
    }
    Some(circumcenter + normal / normal_sq.sqrt() * height_sq.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use cloudmesh_core::Point;

    fn grid_cloud(n: usize, spacing: f64) -> PointCloud {
        PointCloud::from_points(
            (0..n)
                .flat_map(|y| {
                    (0..n).map(move |x| {
                        Point::new(x as f64 * spacing, y as f64 * spacing, 0.0)
                            .with_normal(Vector3d::z())
                    })
                })
                .collect(),
        )
    }

    fn run(cloud: &PointCloud, config: &BallPivotingConfig) -> BallPivotingResult {
        let normals = OrientedNormalSet::from_cloud(cloud).unwrap();
        let index = KdTree::build(cloud);
        ball_pivoting(cloud, &normals, &index, config, &CancellationToken::new()).unwrap()
    }

    #[test]
    fn test_ball_pivoting_config_default() {
        let config = BallPivotingConfig::default();
        assert_eq!(config.radius, BallRadius::Auto);
        assert!(config.validate().is_ok());
        assert!(BallPivotingConfig::with_radius(0.0).validate().is_err());
        assert!(BallPivotingConfig::with_radii(vec![]).validate().is_err());
        assert!(BallPivotingConfig::with_radii(vec![1.0, f64::NAN]).validate().is_err());
    }

    #[test]
    fn test_ball_center() {
        let p0 = Point3d::new(0.0, 0.0, 0.0);
        let p1 = Point3d::new(1.0, 0.0, 0.0);
        let p2 = Point3d::new(0.0, 1.0, 0.0);
        let c = ball_center(&p0, &p1, &p2, 1.0).unwrap();
        assert_relative_eq!(c, Point3d::new(0.5, 0.5, 0.5f64.sqrt()), epsilon = 1e-12);
        for p in [p0, p1, p2] {
            assert_relative_eq!((c - p).norm(), 1.0, epsilon = 1e-12);
        }
        // Reversed winding puts the ball below.
        assert!(ball_center(&p0, &p2, &p1, 1.0).unwrap().z < 0.0);
        assert!(ball_center(&p0, &p1, &p2, 0.5).is_none());
        assert!(ball_center(&p0, &p1, &Point3d::new(2.0, 0.0, 0.0), 5.0).is_none());
    }

    #[test]
    fn test_flat_grid_is_fully_covered() {
        let cloud = grid_cloud(12, 1.0);
        let result = run(&cloud, &BallPivotingConfig::with_radius(1.5));

        assert_relative_eq!(result.coverage, 1.0);
        assert_eq!(result.mesh.face_count(), 2 * 11 * 11);
        assert!(result.mesh.validate().is_ok());
        let topo = result.mesh.topology();
        assert_eq!(topo.non_manifold_edges, 0);
        assert_eq!(topo.boundary_edges, 4 * 11);
        for face in &result.mesh.faces {
            assert_relative_eq!(result.mesh.triangle_area(face), 0.5, epsilon = 1e-9);
        }
        for n in result.mesh.calculate_face_normals() {
            assert!(n.z > 0.99);
        }
    }

    #[test]
    fn test_small_ball_leaves_gaps() {
        let cloud = grid_cloud(6, 1.0);
        let result = run(&cloud, &BallPivotingConfig::with_radius(0.6));
        assert!(result.mesh.faces.is_empty());
        assert_eq!(result.coverage, 0.0);
    }

    #[test]
    fn test_multi_pass_fills_what_small_ball_missed() {
        // Two patches with different spacing.
        let mut points: Vec<Point> = grid_cloud(6, 1.0).iter().copied().collect();
        points.extend((0..6).flat_map(|y| {
            (0..6).map(move |x| {
                Point::new(30.0 + x as f64 * 2.0, y as f64 * 2.0, 0.0).with_normal(Vector3d::z())
            })
        }));
        let cloud = PointCloud::from_points(points);

        let single = run(&cloud, &BallPivotingConfig::with_radius(1.2));
        let multi = run(&cloud, &BallPivotingConfig::with_radii(vec![3.0, 1.2]));
        assert!(single.coverage < 0.6);
        assert_relative_eq!(multi.coverage, 1.0);
        assert_eq!(multi.passes.len(), 2);
        assert_eq!(multi.passes[0].radius, 1.2);
        assert_eq!(multi.mesh.topology().non_manifold_edges, 0);
    }

    #[test]
    fn test_auto_radius_covers_grid() {
        let cloud = grid_cloud(10, 0.5);
        let result = run(&cloud, &BallPivotingConfig::default());
        assert_relative_eq!(result.coverage, 1.0);
        assert!(result.mesh.validate().is_ok());
    }

    #[test]
    fn test_auto_radius_reaches_sixteen_times_spacing() {
        // The dense patch sets the mean spacing; the sparse one needs a
        // ball about sixteen times larger.
        let mut points: Vec<Point> = grid_cloud(20, 1.0).iter().copied().collect();
        points.extend((0..4).flat_map(|y| {
            (0..4).map(move |x| {
                Point::new(200.0 + x as f64 * 20.0, y as f64 * 20.0, 0.0).with_normal(Vector3d::z())
            })
        }));
        let cloud = PointCloud::from_points(points);
        let result = run(&cloud, &BallPivotingConfig::default());

        let spacing = (400.0 + 16.0 * 20.0) / 416.0;
        assert_relative_eq!(result.coverage, 1.0);
        assert_eq!(result.passes.len(), 5);
        assert_relative_eq!(result.passes[4].radius, 16.0 * spacing, epsilon = 1e-9);
        assert_eq!(result.mesh.topology().non_manifold_edges, 0);
    }

    #[test]
    fn test_auto_keeps_the_shortest_schedule_on_ties() {
        let cloud = grid_cloud(10, 0.5);
        let result = run(&cloud, &BallPivotingConfig::default());
        assert_eq!(result.passes.len(), 1);
        assert_relative_eq!(result.passes[0].radius, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_mean_spacing_skips_duplicates() {
        let mut points: Vec<Point> = grid_cloud(5, 2.0).iter().copied().collect();
        points.push(points[0]);
        let cloud = PointCloud::from_points(points);
        let index = KdTree::build(&cloud);
        let valid = vec![true; cloud.len()];
        let spacing = mean_spacing(&cloud, &index, &valid, &CancellationToken::new()).unwrap();
        assert_relative_eq!(spacing, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_coincident_points_are_degenerate() {
        let cloud = PointCloud::from_points(vec![
            Point::new(1.0, 1.0, 1.0).with_normal(Vector3d::z());
            10
        ]);
        let normals = OrientedNormalSet::from_cloud(&cloud).unwrap();
        let index = KdTree::build(&cloud);
        let result = ball_pivoting(
            &cloud,
            &normals,
            &index,
            &BallPivotingConfig::default(),
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(Error::DegenerateGeometry(_))));
    }

    #[test]
    fn test_too_few_points_gives_empty_mesh() {
        let cloud = grid_cloud(1, 1.0);
        let result = run(&cloud, &BallPivotingConfig::with_radius(1.0));
        assert!(result.mesh.faces.is_empty());
    }

    #[test]
    fn test_deterministic() {
        let cloud = grid_cloud(8, 1.0);
        let a = run(&cloud, &BallPivotingConfig::with_radius(1.5));
        let b = run(&cloud, &BallPivotingConfig::with_radius(1.5));
        assert_eq!(a.mesh, b.mesh);
    }

    #[test]
    fn test_cancelled() {
        let cloud = grid_cloud(8, 1.0);
        let normals = OrientedNormalSet::from_cloud(&cloud).unwrap();
        let index = KdTree::build(&cloud);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = ball_pivoting(&cloud, &normals, &index, &BallPivotingConfig::with_radius(1.5), &cancel);
        assert_eq!(result.unwrap_err(), Error::Cancelled);
    }
}
