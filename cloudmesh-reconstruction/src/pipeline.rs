//! Reconstruction pipeline
//!
//! Runs the stages in order: spatial index, normal estimation, normal
//! orientation, surface reconstruction and post-processing. The first three
//! depend only on the cloud and the neighborhood parameters, so
//! [`PreparedCloud`] keeps their results for running several methods on the
//! same normals.

use crate::ball_pivoting::{ball_pivoting, BallPivotingConfig, BallRadius};
use crate::poisson::{poisson_reconstruction, PoissonConfig};
use crate::postprocess::{post_process, PostProcessConfig};
use cloudmesh_algorithms::{
    estimate_normals, orient_normals, KdTree, NeighborGraph, NeighborQuery, NormalEstimationConfig,
    OrientedNormalSet,
};
use cloudmesh_core::{
    CancellationToken, Error, PointCloud, Progress, ProgressCallback, Result, Stage, TriangleMesh,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Fewest points a reconstruction accepts
pub const MIN_RECONSTRUCTION_POINTS: usize = 4;

/// Surface reconstruction methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconstructionMethod {
    /// Implicit indicator function, watertight output
    Poisson,
    /// Ball pivoting, interpolates the input points and keeps holes
    BallPivoting,
}

impl fmt::Display for ReconstructionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconstructionMethod::Poisson => f.write_str("poisson"),
            ReconstructionMethod::BallPivoting => f.write_str("ball-pivoting"),
        }
    }
}

impl FromStr for ReconstructionMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "poisson" => Ok(ReconstructionMethod::Poisson),
            "ball-pivoting" | "ball_pivoting" | "bpa" => Ok(ReconstructionMethod::BallPivoting),
            other => Err(Error::InvalidParameters(format!(
                "unknown reconstruction method '{other}'"
            ))),
        }
    }
}

/// Parameters of a reconstruction run
#[derive(Debug, Clone)]
pub struct ReconstructionParams {
    /// Neighbors per point for normal estimation (default: 30)
    pub neighbor_count: usize,
    /// Optional radius bounding the neighborhoods
    pub neighbor_radius: Option<f64>,
    /// Maximum octree depth for Poisson (default: 8)
    pub poisson_depth: u32,
    /// Density quantile below which Poisson faces are trimmed (default: 0.0)
    pub poisson_density_threshold: f64,
    /// Ball radius for ball pivoting (default: automatic)
    pub ball_radius: BallRadius,
    /// Token checked between and inside stages
    pub cancellation_token: CancellationToken,
    /// Use normals already carried by every input point (default: true)
    pub reuse_input_normals: bool,
    pub poisson_scale: f64,
    pub poisson_samples_per_node: f64,
    pub solver_max_iterations: usize,
    pub solver_tolerance: f64,
    pub memory_budget_bytes: usize,
    pub degenerate_area_epsilon: f64,
    /// Copy colors or intensities onto the mesh (default: true)
    pub transfer_colors: bool,
}

impl Default for ReconstructionParams {
    fn default() -> Self {
        let poisson = PoissonConfig::default();
        let post = PostProcessConfig::default();
        Self {
            neighbor_count: NormalEstimationConfig::default().k_neighbors,
            neighbor_radius: None,
            poisson_depth: poisson.depth,
            poisson_density_threshold: post.density_threshold,
            ball_radius: BallRadius::Auto,
            cancellation_token: CancellationToken::new(),
            reuse_input_normals: true,
            poisson_scale: poisson.scale,
            poisson_samples_per_node: poisson.samples_per_node,
            solver_max_iterations: poisson.max_iterations,
            solver_tolerance: poisson.tolerance,
            memory_budget_bytes: poisson.memory_budget_bytes,
            degenerate_area_epsilon: post.degenerate_area_epsilon,
            transfer_colors: post.transfer_colors,
        }
    }
}

impl ReconstructionParams {
    pub fn with_neighbor_count(mut self, k: usize) -> Self {
        self.neighbor_count = k;
        self
    }

    pub fn with_neighbor_radius(mut self, radius: f64) -> Self {
        self.neighbor_radius = Some(radius);
        self
    }

    pub fn with_poisson_depth(mut self, depth: u32) -> Self {
        self.poisson_depth = depth;
        self
    }

    pub fn with_density_threshold(mut self, threshold: f64) -> Self {
        self.poisson_density_threshold = threshold;
        self
    }

    pub fn with_ball_radius(mut self, radius: BallRadius) -> Self {
        self.ball_radius = radius;
        self
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    pub fn with_reuse_input_normals(mut self, reuse: bool) -> Self {
        self.reuse_input_normals = reuse;
        self
    }

    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget_bytes = bytes;
        self
    }

    pub fn neighbor_query(&self) -> NeighborQuery {
        NormalEstimationConfig {
            k_neighbors: self.neighbor_count,
            radius: self.neighbor_radius,
        }
        .query()
    }

    pub fn poisson_config(&self) -> PoissonConfig {
        PoissonConfig {
            depth: self.poisson_depth,
            scale: self.poisson_scale,
            samples_per_node: self.poisson_samples_per_node,
            max_iterations: self.solver_max_iterations,
            tolerance: self.solver_tolerance,
            memory_budget_bytes: self.memory_budget_bytes,
            ..Default::default()
        }
    }

    pub fn ball_pivoting_config(&self) -> BallPivotingConfig {
        BallPivotingConfig {
            radius: self.ball_radius.clone(),
        }
    }

    pub fn post_process_config(&self) -> PostProcessConfig {
        PostProcessConfig {
            density_threshold: self.poisson_density_threshold,
            degenerate_area_epsilon: self.degenerate_area_epsilon,
            transfer_colors: self.transfer_colors,
            compute_vertex_normals: true,
        }
    }

    /// Check every parameter group, failing with `InvalidParameters` (or
    /// `ResourceExhausted` for an unreachable depth)
    pub fn validate(&self) -> Result<()> {
        self.neighbor_query().validate()?;
        self.poisson_config().validate()?;
        self.ball_pivoting_config().validate()?;
        self.post_process_config().validate()
    }
}

/// Reports stages to an optional callback and turns a `false` answer into
/// a cancellation
struct StageReporter<'a> {
    callback: Option<ProgressCallback<'a>>,
    cancel: &'a CancellationToken,
    start: Instant,
}

impl<'a> StageReporter<'a> {
    fn new(callback: Option<ProgressCallback<'a>>, cancel: &'a CancellationToken) -> Self {
        Self {
            callback,
            cancel,
            start: Instant::now(),
        }
    }

    fn enter(&self, stage: Stage) -> Result<()> {
        self.cancel.check()?;
        debug!("{}% {}", stage.percent(), stage);
        if let Some(callback) = self.callback {
            let progress = Progress::new(stage, stage.to_string(), self.start.elapsed());
            if !callback(&progress) {
                info!("Reconstruction cancelled from progress callback at {}", stage);
                self.cancel.cancel();
            }
        }
        self.cancel.check()
    }
}

/// A cloud with its spatial index and oriented normals
#[derive(Debug, Clone)]
pub struct PreparedCloud {
    cloud: PointCloud,
    index: KdTree,
    graph: Option<NeighborGraph>,
    normals: OrientedNormalSet,
}

impl PreparedCloud {
    /// Build the index and orient normals for `cloud`.
    ///
    /// Fails with `InsufficientData` for fewer than four points,
    /// `DegenerateGeometry` when the points span no volume or area at all,
    /// and `InvalidParameters` for bad parameters or non-finite input.
    pub fn prepare(cloud: &PointCloud, params: &ReconstructionParams) -> Result<Self> {
        let reporter = StageReporter::new(None, &params.cancellation_token);
        Self::prepare_with(cloud, params, &reporter)
    }

    fn prepare_with(
        cloud: &PointCloud,
        params: &ReconstructionParams,
        reporter: &StageReporter<'_>,
    ) -> Result<Self> {
        params.validate()?;
        check_cloud(cloud)?;
        let cancel = &params.cancellation_token;

        reporter.enter(Stage::SpatialIndex)?;
        let index = KdTree::build(cloud);

        let (graph, normals) = if params.reuse_input_normals && cloud.has_normals() {
            info!("Reusing the normals carried by {} input points", cloud.len());
            reporter.enter(Stage::NormalEstimation)?;
            reporter.enter(Stage::Orientation)?;
            (None, OrientedNormalSet::from_cloud(cloud)?)
        } else {
            reporter.enter(Stage::NormalEstimation)?;
            let graph = NeighborGraph::build(cloud, &index, params.neighbor_query(), cancel)?;
            let unoriented = estimate_normals(cloud, &graph, cancel)?;
            reporter.enter(Stage::Orientation)?;
            let normals = orient_normals(cloud, &graph, &unoriented, cancel)?;
            (Some(graph), normals)
        };

        Ok(Self {
            cloud: cloud.clone(),
            index,
            graph,
            normals,
        })
    }

    pub fn cloud(&self) -> &PointCloud {
        &self.cloud
    }

    pub fn index(&self) -> &KdTree {
        &self.index
    }

    /// Neighbor graph, absent when the input normals were reused
    pub fn graph(&self) -> Option<&NeighborGraph> {
        self.graph.as_ref()
    }

    pub fn normals(&self) -> &OrientedNormalSet {
        &self.normals
    }

    /// Run `method` on the prepared normals and post-process the result
    pub fn reconstruct(
        &self,
        method: ReconstructionMethod,
        params: &ReconstructionParams,
    ) -> Result<TriangleMesh> {
        let reporter = StageReporter::new(None, &params.cancellation_token);
        self.reconstruct_with(method, params, &reporter)
    }

    fn reconstruct_with(
        &self,
        method: ReconstructionMethod,
        params: &ReconstructionParams,
        reporter: &StageReporter<'_>,
    ) -> Result<TriangleMesh> {
        params.validate()?;
        let cancel = &params.cancellation_token;

        reporter.enter(Stage::Reconstruction)?;
        let mesh = match method {
            ReconstructionMethod::Poisson => {
                poisson_reconstruction(&self.cloud, &self.normals, &params.poisson_config(), cancel)?
                    .mesh
            }
            ReconstructionMethod::BallPivoting => {
                ball_pivoting(
                    &self.cloud,
                    &self.normals,
                    &self.index,
                    &params.ball_pivoting_config(),
                    cancel,
                )?
                .mesh
            }
        };

        reporter.enter(Stage::PostProcessing)?;
        let (mesh, _) = post_process(mesh, &self.cloud, &self.index, &params.post_process_config())?;
        mesh.validate()?;

        reporter.enter(Stage::Done)?;
        Ok(mesh)
    }
}

fn check_cloud(cloud: &PointCloud) -> Result<()> {
    if cloud.len() < MIN_RECONSTRUCTION_POINTS {
        return Err(Error::InsufficientData(format!(
            "reconstruction needs at least {} points, got {}",
            MIN_RECONSTRUCTION_POINTS,
            cloud.len()
        )));
    }
    if !cloud.is_finite() {
        return Err(Error::InvalidParameters(
            "point cloud contains non-finite coordinates".to_string(),
        ));
    }
    match cloud.bounding_box() {
        Some(bounds) if bounds.max_extent() > 0.0 => Ok(()),
        _ => Err(Error::DegenerateGeometry(
            "all points share one position".to_string(),
        )),
    }
}

/// Reconstruct a surface mesh from `cloud` with `method`
pub fn reconstruct(
    cloud: &PointCloud,
    method: ReconstructionMethod,
    params: &ReconstructionParams,
) -> Result<TriangleMesh> {
    let start = Instant::now();
    let reporter = StageReporter::new(None, &params.cancellation_token);
    let prepared = PreparedCloud::prepare_with(cloud, params, &reporter)?;
    let mesh = prepared.reconstruct_with(method, params, &reporter)?;
    info!(
        "{} reconstruction finished with {} vertices and {} faces in {:?}",
        method,
        mesh.vertex_count(),
        mesh.face_count(),
        start.elapsed()
    );
    Ok(mesh)
}

/// [`reconstruct`] with a stage callback. The callback returning `false`
/// cancels the run.
pub fn reconstruct_with_progress(
    cloud: &PointCloud,
    method: ReconstructionMethod,
    params: &ReconstructionParams,
    progress: ProgressCallback<'_>,
) -> Result<TriangleMesh> {
    let reporter = StageReporter::new(Some(progress), &params.cancellation_token);
    let prepared = PreparedCloud::prepare_with(cloud, params, &reporter)?;
    prepared.reconstruct_with(method, params, &reporter)
}

/// Meshes of both methods built from the same normals
#[derive(Debug, Clone)]
pub struct MethodComparison {
    pub poisson: TriangleMesh,
    pub ball_pivoting: TriangleMesh,
    pub poisson_time: Duration,
    pub ball_pivoting_time: Duration,
}

impl MethodComparison {
    pub fn mesh(&self, method: ReconstructionMethod) -> &TriangleMesh {
        match method {
            ReconstructionMethod::Poisson => &self.poisson,
            ReconstructionMethod::BallPivoting => &self.ball_pivoting,
        }
    }
}

/// Run both methods on one prepared cloud
pub fn reconstruct_all(cloud: &PointCloud, params: &ReconstructionParams) -> Result<MethodComparison> {
    let prepared = PreparedCloud::prepare(cloud, params)?;

    let start = Instant::now();
    let poisson = prepared.reconstruct(ReconstructionMethod::Poisson, params)?;
    let poisson_time = start.elapsed();

    let start = Instant::now();
    let ball_pivoting = prepared.reconstruct(ReconstructionMethod::BallPivoting, params)?;
    let ball_pivoting_time = start.elapsed();

    info!(
        "Poisson: {} faces in {:?}; ball pivoting: {} faces in {:?}",
        poisson.face_count(),
        poisson_time,
        ball_pivoting.face_count(),
        ball_pivoting_time
    );
    Ok(MethodComparison {
        poisson,
        ball_pivoting,
        poisson_time,
        ball_pivoting_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudmesh_core::{Point, Point3d, Vector3d};
    use std::sync::Mutex;

    fn plane_cloud(n: usize) -> PointCloud {
        PointCloud::from_positions(
            (0..n).flat_map(|y| (0..n).map(move |x| Point3d::new(x as f64, y as f64, 0.0))),
        )
    }

    #[test]
    fn test_reconstruction_params_default() {
        let params = ReconstructionParams::default();
        assert_eq!(params.neighbor_count, 30);
        assert_eq!(params.poisson_depth, 8);
        assert_eq!(params.poisson_density_threshold, 0.0);
        assert_eq!(params.ball_radius, BallRadius::Auto);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_invalid_params() {
        let params = ReconstructionParams::default().with_poisson_depth(0);
        assert!(matches!(params.validate(), Err(Error::InvalidParameters(_))));
        let params = ReconstructionParams::default().with_neighbor_count(0);
        assert!(matches!(params.validate(), Err(Error::InvalidParameters(_))));
        let params = ReconstructionParams::default().with_density_threshold(-0.1);
        assert!(matches!(params.validate(), Err(Error::InvalidParameters(_))));
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("poisson".parse::<ReconstructionMethod>().unwrap(), ReconstructionMethod::Poisson);
        assert_eq!("BPA".parse::<ReconstructionMethod>().unwrap(), ReconstructionMethod::BallPivoting);
        assert!("delaunay".parse::<ReconstructionMethod>().is_err());
        assert_eq!(ReconstructionMethod::BallPivoting.to_string(), "ball-pivoting");
    }

    #[test]
    fn test_too_few_points() {
        let cloud = PointCloud::from_positions(vec![Point3d::origin(), Point3d::new(1.0, 0.0, 0.0)]);
        let result = reconstruct(&cloud, ReconstructionMethod::Poisson, &ReconstructionParams::default());
        assert!(matches!(result, Err(Error::InsufficientData(_))));
    }

    #[test]
    fn test_non_finite_input() {
        let mut points: Vec<Point> = plane_cloud(3).iter().copied().collect();
        points.push(Point::new(f64::NAN, 0.0, 0.0));
        let cloud = PointCloud::from_points(points);
        let result = reconstruct(&cloud, ReconstructionMethod::BallPivoting, &ReconstructionParams::default());
        assert!(matches!(result, Err(Error::InvalidParameters(_))));
    }

    #[test]
    fn test_prepare_estimates_or_reuses_normals() {
        let cloud = plane_cloud(8);
        let params = ReconstructionParams::default().with_neighbor_count(8);
        let prepared = PreparedCloud::prepare(&cloud, &params).unwrap();
        assert!(prepared.graph().is_some());
        assert_eq!(prepared.normals().defined_count(), cloud.len());

        let with_normals = PointCloud::from_points(
            cloud.iter().map(|p| p.with_normal(Vector3d::z())).collect(),
        );
        let prepared = PreparedCloud::prepare(&with_normals, &params).unwrap();
        assert!(prepared.graph().is_none());
        assert_eq!(prepared.normals().normal(0), Vector3d::z());
    }

    #[test]
    fn test_progress_reports_every_stage() {
        let cloud = plane_cloud(8);
        let params = ReconstructionParams::default()
            .with_neighbor_count(8)
            .with_ball_radius(BallRadius::Fixed(1.5));
        let seen = Mutex::new(Vec::new());
        let callback = |p: &Progress| {
            seen.lock().unwrap().push(p.percent());
            true
        };
        reconstruct_with_progress(&cloud, ReconstructionMethod::BallPivoting, &params, &callback).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![10, 20, 30, 50, 80, 100]);
    }

    #[test]
    fn test_progress_callback_can_cancel() {
        let cloud = plane_cloud(8);
        let params = ReconstructionParams::default().with_neighbor_count(8);
        let callback = |p: &Progress| p.stage != Stage::Orientation;
        let result = reconstruct_with_progress(&cloud, ReconstructionMethod::Poisson, &params, &callback);
        assert_eq!(result.unwrap_err(), Error::Cancelled);
        assert!(params.cancellation_token.is_cancelled());
    }
}
