//! Normal estimation algorithms
//!
//! Normals come from principal component analysis of each point's
//! neighborhood: the eigenvector of the smallest eigenvalue of the local
//! covariance matrix is perpendicular to the best-fit tangent plane. The
//! sign of the result is arbitrary; see [`crate::orientation`] for making
//! it consistent.

use crate::nearest_neighbor::KdTree;
use crate::neighbor_graph::{NeighborGraph, NeighborQuery};
use crate::parallel::parallel_map_indexed;
use cloudmesh_core::{
    CancellationToken, CloudId, Error, Matrix3, Point3d, PointCloud, Result, Vector3d,
};
use nalgebra::SymmetricEigen;
use std::time::Instant;
use tracing::{info, warn};

/// Minimum number of distinct positions for a defined normal
pub const MIN_DISTINCT_NEIGHBORS: usize = 3;

/// Relative size below which the middle eigenvalue counts as zero, i.e.
/// the neighborhood is a line rather than a patch.
const COLLINEAR_EPSILON: f64 = 1e-10;

/// Parameters for normal estimation
#[derive(Debug, Clone, PartialEq)]
pub struct NormalEstimationConfig {
    /// Number of nearest neighbors per point
    pub k_neighbors: usize,
    /// Optional search radius; with it the query becomes hybrid
    pub radius: Option<f64>,
}

impl Default for NormalEstimationConfig {
    fn default() -> Self {
        Self {
            k_neighbors: 30,
            radius: None,
        }
    }
}

impl NormalEstimationConfig {
    pub fn with_k_neighbors(mut self, k: usize) -> Self {
        self.k_neighbors = k;
        self
    }

    pub fn with_radius(mut self, radius: f64) -> Self {
        self.radius = Some(radius);
        self
    }

    /// Neighbor query this configuration asks for
    pub fn query(&self) -> NeighborQuery {
        match self.radius {
            Some(radius) => NeighborQuery::Hybrid {
                k: self.k_neighbors,
                radius,
            },
            None => NeighborQuery::KNearest(self.k_neighbors),
        }
    }
}

/// Per-point normal directions with arbitrary sign.
///
/// `None` marks a point whose neighborhood did not define a plane.
#[derive(Debug, Clone, PartialEq)]
pub struct UnorientedNormals {
    cloud_id: CloudId,
    normals: Vec<Option<Vector3d>>,
}

impl UnorientedNormals {
    pub fn new(cloud_id: CloudId, normals: Vec<Option<Vector3d>>) -> Self {
        Self { cloud_id, normals }
    }

    pub fn cloud_id(&self) -> CloudId {
        self.cloud_id
    }

    pub fn len(&self) -> usize {
        self.normals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.normals.is_empty()
    }

    /// Normal of point `i`, if defined
    pub fn normal(&self, i: usize) -> Option<Vector3d> {
        self.normals[i]
    }

    pub fn is_valid(&self, i: usize) -> bool {
        self.normals[i].is_some()
    }

    /// Number of points with a defined normal
    pub fn valid_count(&self) -> usize {
        self.normals.iter().filter(|n| n.is_some()).count()
    }

    pub fn as_slice(&self) -> &[Option<Vector3d>] {
        &self.normals
    }
}

/// Estimate a normal for every point of `cloud` from the rows of `graph`.
///
/// Points whose neighborhood has fewer than three distinct positions, or
/// whose neighborhood is collinear, get no normal. The run only fails when
/// the cloud is too small or when no point at all gets a normal.
pub fn estimate_normals(
    cloud: &PointCloud,
    graph: &NeighborGraph,
    cancel: &CancellationToken,
) -> Result<UnorientedNormals> {
    if cloud.len() < MIN_DISTINCT_NEIGHBORS {
        return Err(Error::InsufficientData(format!(
            "normal estimation needs at least {} points, got {}",
            MIN_DISTINCT_NEIGHBORS,
            cloud.len()
        )));
    }
    graph.ensure_valid_for(cloud)?;
    cancel.check()?;

    let start = Instant::now();
    info!("Estimating normals for {} points", cloud.len());

    let points = cloud.points();
    let normals = parallel_map_indexed(points, |i, point| {
        if cancel.is_cancelled() {
            return None;
        }
        let neighborhood = std::iter::once(point.position)
            .chain(graph.neighbors(i).iter().map(|n| points[n.index].position));
        plane_normal(neighborhood)
    });
    cancel.check()?;

    let result = UnorientedNormals::new(cloud.id(), normals);
    let valid = result.valid_count();
    if valid == 0 {
        return Err(Error::DegenerateGeometry(
            "no point has a neighborhood that defines a plane".to_string(),
        ));
    }
    if valid < cloud.len() {
        warn!(
            "{} of {} points have an undefined normal and are flagged invalid",
            cloud.len() - valid,
            cloud.len()
        );
    }
    info!("Estimated {} normals in {:?}", valid, start.elapsed());

    Ok(result)
}

/// Convenience wrapper: build the index and graph, then estimate normals
pub fn estimate_normals_with_config(
    cloud: &PointCloud,
    config: &NormalEstimationConfig,
    cancel: &CancellationToken,
) -> Result<UnorientedNormals> {
    let index = KdTree::build(cloud);
    let graph = NeighborGraph::build(cloud, &index, config.query(), cancel)?;
    estimate_normals(cloud, &graph, cancel)
}

/// Smallest-eigenvalue eigenvector of the covariance of `positions`.
///
/// Returns `None` for fewer than three distinct positions or a collinear set.
pub fn plane_normal<I>(positions: I) -> Option<Vector3d>
where
    I: IntoIterator<Item = Point3d>,
{
    let positions: Vec<Point3d> = positions.into_iter().collect();
    if count_distinct(&positions) < MIN_DISTINCT_NEIGHBORS {
        return None;
    }

    let n = positions.len() as f64;
    let centroid = positions
        .iter()
        .fold(Vector3d::zeros(), |acc, p| acc + p.coords)
        / n;

    let mut covariance = Matrix3::zeros();
    for p in &positions {
        let d = p.coords - centroid;
        covariance += d * d.transpose();
    }
    covariance /= n;

    let eigen = SymmetricEigen::new(covariance);
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));
    let middle = eigen.eigenvalues[order[1]];
    let largest = eigen.eigenvalues[order[2]];
    if !(largest > 0.0) || middle <= COLLINEAR_EPSILON * largest {
        return None;
    }

    let normal: Vector3d = eigen.eigenvectors.column(order[0]).into_owned();
    normal.try_normalize(f64::MIN_POSITIVE)
}

fn count_distinct(positions: &[Point3d]) -> usize {
    let mut distinct: Vec<&Point3d> = Vec::with_capacity(MIN_DISTINCT_NEIGHBORS);
    for p in positions {
        if !distinct.iter().any(|q| *q == p) {
            distinct.push(p);
            if distinct.len() >= MIN_DISTINCT_NEIGHBORS {
                break;
            }
        }
    }
    distinct.len()
}
