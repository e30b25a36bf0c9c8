//! Poisson surface reconstruction
//!
//! Oriented samples are splatted into a vector field, the divergence of
//! that field becomes the right-hand side of a Poisson equation, and the
//! solution is an implicit function that is low inside the surface and high
//! outside. The surface is the level set through the samples.
//!
//! Steps:
//! 1. an adaptive octree over the samples splits cells only where samples
//!    are dense, and gives the local sampling density;
//! 2. samples are weighted by inverse density so dense regions do not
//!    dominate the field;
//! 3. a coarse dense lattice is solved first; every finer level then solves
//!    only on the cells under split octree nodes and their neighbors, with
//!    the coarser solution fixing its boundary. Memory follows the surface,
//!    not the volume of the cube;
//! 4. the iso value is the density-weighted median of the implicit
//!    function at the samples, and marching tetrahedra tracks that level
//!    set from the cells holding samples;
//! 5. every output vertex gets the sampling density around it, scaled to
//!    `[0, 1]`, so sparse hallucinated regions can be trimmed later.

use crate::grid::ScalarGrid;
use crate::marching_tetrahedra::{LatticeField, MarchingTetrahedra, MarchingTetrahedraConfig};
use crate::octree::{Octree, MAX_OCTREE_DEPTH};
use cloudmesh_algorithms::parallel;
use cloudmesh_algorithms::OrientedNormalSet;
use cloudmesh_core::{
    BoundingBox, CancellationToken, Error, Point3d, PointCloud, Result, TriangleMesh, Vector3d,
};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::{debug, info};

/// Fewest oriented samples the solver accepts
pub const MIN_POISSON_SAMPLES: usize = 4;

/// Estimated bytes per active cell while a level is assembled
const BYTES_PER_CELL: usize = 32;

/// Estimated bytes per lattice node while a level is solved: key map entry,
/// value, unknown slot, neighbor table and the solver's working vectors
const BYTES_PER_NODE: usize = 192;

/// Bytes a solved level keeps per node for evaluating the implicit function
const RETAINED_BYTES_PER_NODE: usize = 40;

/// Iterations between cancellation checks inside the solver
const CANCEL_CHECK_INTERVAL: usize = 32;

/// Rows of the operator handed to one parallel task
const ROWS_PER_TASK: usize = 4096;

/// Node values closer to the iso value than this fraction of the field's
/// spread are snapped off it before extraction
const SNAP_FRACTION: f64 = 1e-3;

/// Face-adjacent lattice steps as (axis, offset)
const FACE_STEPS: [(usize, i32); 6] = [(0, -1), (0, 1), (1, -1), (1, 1), (2, -1), (2, 1)];

/// Cell coordinates at one depth
type Cell = [u32; 3];

/// Lattice node coordinates at one depth
type Node = [u32; 3];

/// Configuration parameters for Poisson reconstruction
#[derive(Debug, Clone, PartialEq)]
pub struct PoissonConfig {
    /// The maximum depth of the octree (default: 8)
    pub depth: u32,
    /// Ratio between the reconstruction cube and the bounding box of the samples (default: 1.1)
    pub scale: f64,
    /// Samples a node may hold before it is split (default: 1.5)
    pub samples_per_node: f64,
    /// Depth of the dense lattice that starts the solver cascade (default: 3)
    pub coarse_depth: u32,
    /// Conjugate gradient iterations per cascade level (default: 400)
    pub max_iterations: usize,
    /// Relative residual at which a level counts as solved (default: 1e-6)
    pub tolerance: f64,
    /// Bytes the octree and solver levels may use together (default: 2 GiB)
    pub memory_budget_bytes: usize,
}

impl Default for PoissonConfig {
    fn default() -> Self {
        Self {
            depth: 8,
            scale: 1.1,
            samples_per_node: 1.5,
            coarse_depth: 3,
            max_iterations: 400,
            tolerance: 1e-6,
            memory_budget_bytes: 2 << 30,
        }
    }
}

impl PoissonConfig {
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget_bytes = bytes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.depth < 1 {
            return Err(Error::InvalidParameters(format!(
                "Poisson depth must be at least 1, got {}",
                self.depth
            )));
        }
        if self.depth > MAX_OCTREE_DEPTH {
            return Err(Error::ResourceExhausted(format!(
                "Poisson depth {} exceeds the supported maximum of {}",
                self.depth, MAX_OCTREE_DEPTH
            )));
        }
        if !(self.scale >= 1.0) || !self.scale.is_finite() {
            return Err(Error::InvalidParameters(format!(
                "Poisson scale must be finite and at least 1, got {}",
                self.scale
            )));
        }
        if !(self.samples_per_node > 0.0) || !self.samples_per_node.is_finite() {
            return Err(Error::InvalidParameters(format!(
                "samples per node must be positive, got {}",
                self.samples_per_node
            )));
        }
        if self.max_iterations == 0 || !(self.tolerance > 0.0) {
            return Err(Error::InvalidParameters(
                "solver needs a positive iteration count and tolerance".to_string(),
            ));
        }
        Ok(())
    }
}

/// Output of a Poisson run
#[derive(Debug, Clone)]
pub struct PoissonResult {
    /// Extracted surface, with per-vertex densities in `[0, 1]`
    pub mesh: TriangleMesh,
    /// Level of the implicit function the surface was extracted at
    pub iso_value: f64,
    /// Finest depth the system was solved at; the octree's deepest level
    pub solve_depth: u32,
    /// Conjugate gradient iterations over all cascade levels
    pub iterations: usize,
    /// Unknowns of the finest level's system
    pub finest_unknowns: usize,
}

/// Poisson surface reconstruction from a cloud and its oriented normals.
///
/// Points flagged `Undefined` in `normals` are skipped.
pub fn poisson_reconstruction(
    cloud: &PointCloud,
    normals: &OrientedNormalSet,
    config: &PoissonConfig,
    cancel: &CancellationToken,
) -> Result<PoissonResult> {
    config.validate()?;
    if !normals.is_valid_for(cloud) {
        return Err(Error::InvalidParameters(
            "normals were computed for a different point cloud".to_string(),
        ));
    }

    let samples: Vec<usize> = (0..cloud.len())
        .filter(|&i| normals.is_defined(i) && cloud.points()[i].is_finite())
        .collect();
    if samples.len() < MIN_POISSON_SAMPLES {
        return Err(Error::InsufficientData(format!(
            "Poisson reconstruction needs at least {} oriented samples, got {}",
            MIN_POISSON_SAMPLES,
            samples.len()
        )));
    }
    let positions: Vec<Point3d> = samples.iter().map(|&i| cloud.position(i)).collect();
    let sample_normals: Vec<Vector3d> = samples.iter().map(|&i| normals.normal(i)).collect();

    let bounds = BoundingBox::from_points(positions.iter()).ok_or_else(|| {
        Error::InsufficientData("no finite sample positions".to_string())
    })?;
    if !(bounds.max_extent() > 0.0) {
        return Err(Error::DegenerateGeometry(
            "all samples are coincident".to_string(),
        ));
    }

    let start = Instant::now();
    info!(
        "Starting Poisson reconstruction of {} samples (depth {})",
        samples.len(),
        config.depth
    );

    let (origin, size) = bounds.bounding_cube(config.scale);
    let octree = Octree::build(
        &positions,
        origin,
        size,
        config.depth,
        config.samples_per_node,
        config.memory_budget_bytes,
        cancel,
    )?;
    let solve_depth = octree.depth().max(1);

    // Densities one level above the solve depth smooth over single empty cells.
    let density_depth = solve_depth.saturating_sub(1).max(1);
    let densities = parallel::parallel_map(&positions, |p| octree.density(p, density_depth));
    cancel.check()?;
    let mean_density = densities.iter().sum::<f64>() / densities.len() as f64;
    let sample_area = octree.cell_size(solve_depth).powi(2);
    let areas: Vec<f64> = densities
        .iter()
        .map(|&d| {
            if d > 0.0 {
                sample_area * mean_density / d
            } else {
                sample_area
            }
        })
        .collect();

    let splat = Splat {
        positions: &positions,
        normals: &sample_normals,
        areas: &areas,
        origin,
        size,
    };

    let coarse_depth = config.coarse_depth.clamp(1, solve_depth);
    let mut retained = octree.memory_bytes();
    check_budget(
        coarse_depth,
        1usize.checked_shl(3 * coarse_depth).unwrap_or(usize::MAX),
        retained,
        config,
    )?;
    let coarse = solve_level(coarse_depth, dense_cells(coarse_depth), None, &splat, config, cancel)?;
    let mut iterations = coarse.iterations;
    let mut finest_unknowns = coarse.unknowns;
    let mut function = ImplicitFunction {
        coarse: coarse.level.into_grid(origin, size)?,
        levels: Vec::new(),
        origin,
        size,
        depth: coarse_depth,
    };

    for depth in coarse_depth + 1..=solve_depth {
        cancel.check()?;
        let cells = active_cells(&octree, depth);
        check_budget(depth, cells.len(), retained, config)?;
        let solved = solve_level(depth, cells, Some(&function), &splat, config, cancel)?;
        iterations += solved.iterations;
        finest_unknowns = solved.unknowns;
        retained += solved.level.memory_bytes();
        function.levels.push(solved.level);
        function.depth = depth;
    }

    let values = parallel::parallel_map(&positions, |p| function.value_at(p));
    cancel.check()?;
    let iso_value = weighted_median(&values, &densities);
    let spread = function
        .coarse
        .values()
        .iter()
        .map(|v| (v - iso_value).abs())
        .fold(0.0, f64::max);
    debug!("Iso value {:.6}, field spread {:.6}", iso_value, spread);

    let mut seeds: Vec<Cell> = positions
        .iter()
        .map(|p| {
            let key = octree.cell_containing(p, solve_depth);
            [key.x, key.y, key.z]
        })
        .collect();
    seeds.sort_unstable();
    seeds.dedup();

    let extractor = MarchingTetrahedra::new(MarchingTetrahedraConfig {
        iso_level: iso_value,
        snap_band: spread * SNAP_FRACTION,
    });
    let mut mesh = extractor.extract_isosurface(&function, seeds, cancel)?;

    let vertex_density = parallel::parallel_map(&mesh.vertices, |v| {
        octree.density(v, density_depth)
    });
    cancel.check()?;
    let peak = vertex_density.iter().copied().fold(0.0f64, f64::max);
    let vertex_density: Vec<f64> = if peak > 0.0 {
        vertex_density.into_iter().map(|d| d / peak).collect()
    } else {
        vec![0.0; mesh.vertex_count()]
    };
    mesh.set_densities(vertex_density);

    info!(
        "Poisson reconstruction produced {} vertices and {} faces in {:?}",
        mesh.vertex_count(),
        mesh.face_count(),
        start.elapsed()
    );

    Ok(PoissonResult {
        mesh,
        iso_value,
        solve_depth,
        iterations,
        finest_unknowns,
    })
}

fn check_budget(depth: u32, cells: usize, retained: usize, config: &PoissonConfig) -> Result<()> {
    let needed = cells
        .saturating_mul(BYTES_PER_CELL + BYTES_PER_NODE)
        .saturating_add(retained);
    if needed > config.memory_budget_bytes {
        return Err(Error::ResourceExhausted(format!(
            "solving depth {} over {} cells needs about {} bytes, budget is {}",
            depth, cells, needed, config.memory_budget_bytes
        )));
    }
    Ok(())
}

/// Every cell of the lattice at `depth`, in sorted order
fn dense_cells(depth: u32) -> Vec<Cell> {
    let n = 1u32 << depth;
    (0..n)
        .flat_map(|x| (0..n).flat_map(move |y| (0..n).map(move |z| [x, y, z])))
        .collect()
}

/// Cells solved for at `depth`: the children of every split node one level
/// up and of that node's 26 neighbors. Regions where the octree stopped
/// splitting have no cells and keep the coarser solution.
fn active_cells(octree: &Octree, depth: u32) -> Vec<Cell> {
    let mut cells: HashSet<Cell> = HashSet::new();
    for node in octree.nodes_at_depth(depth - 1).filter(|n| !n.is_leaf()) {
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    if let Some(key) = node.key.neighbor(dx, dy, dz) {
                        for octant in 0..8 {
                            let child = key.child(octant);
                            cells.insert([child.x, child.y, child.z]);
                        }
                    }
                }
            }
        }
    }
    let mut cells: Vec<Cell> = cells.into_iter().collect();
    cells.sort_unstable();
    cells
}

fn corner_node(cell: Cell, corner: usize) -> Node {
    [
        cell[0] + (corner & 1) as u32,
        cell[1] + ((corner >> 1) & 1) as u32,
        cell[2] + ((corner >> 2) & 1) as u32,
    ]
}

fn lattice_point(origin: Point3d, size: f64, depth: u32, node: Node) -> Point3d {
    let h = size / (1u64 << depth) as f64;
    origin + Vector3d::new(node[0] as f64, node[1] as f64, node[2] as f64) * h
}

/// Solution of one cascade level on its active cells
struct Level {
    depth: u32,
    cells: HashSet<Cell>,
    index: HashMap<Node, usize>,
    values: Vec<f64>,
}

impl Level {
    fn node_value(&self, node: &Node) -> Option<f64> {
        self.index.get(node).map(|&i| self.values[i])
    }

    /// Trilinear value at lattice coordinates `u`, if the cell there is
    /// active at this level
    fn interpolate(&self, u: [f64; 3]) -> Option<f64> {
        let last = ((1u64 << self.depth) - 1) as f64;
        let mut cell = [0u32; 3];
        let mut frac = [0.0f64; 3];
        for axis in 0..3 {
            let b = u[axis].floor().clamp(0.0, last);
            cell[axis] = b as u32;
            frac[axis] = (u[axis] - b).clamp(0.0, 1.0);
        }
        if !self.cells.contains(&cell) {
            return None;
        }

        let mut value = 0.0;
        for corner in 0..8 {
            let mut weight = 1.0;
            for (axis, f) in frac.iter().enumerate() {
                weight *= if (corner >> axis) & 1 == 1 { *f } else { 1.0 - f };
            }
            value += weight * self.node_value(&corner_node(cell, corner))?;
        }
        Some(value)
    }

    fn memory_bytes(&self) -> usize {
        self.cells.len() * BYTES_PER_CELL + self.values.len() * RETAINED_BYTES_PER_NODE
    }

    /// Dense row-major grid of a level whose cells cover the whole cube
    fn into_grid(self, origin: Point3d, size: f64) -> Result<ScalarGrid> {
        let n = (1u32 << self.depth) + 1;
        let mut values = Vec::with_capacity((n as usize).pow(3));
        for x in 0..n {
            for y in 0..n {
                for z in 0..n {
                    values.push(self.node_value(&[x, y, z]).unwrap_or(0.0));
                }
            }
        }
        ScalarGrid::from_values([n as usize; 3], size / (n - 1) as f64, origin, values)
    }
}

/// The implicit function: the finest level whose cells hold a point
/// decides its value, and the dense coarse grid covers everything else
struct ImplicitFunction {
    coarse: ScalarGrid,
    /// Finer levels, shallowest first
    levels: Vec<Level>,
    origin: Point3d,
    size: f64,
    depth: u32,
}

impl ImplicitFunction {
    fn value_at(&self, p: &Point3d) -> f64 {
        let offset = p - self.origin;
        for level in self.levels.iter().rev() {
            let u = offset / (self.size / (1u64 << level.depth) as f64);
            if let Some(value) = level.interpolate([u.x, u.y, u.z]) {
                return value;
            }
        }
        self.coarse.sample(p)
    }
}

impl LatticeField for ImplicitFunction {
    fn nodes_per_axis(&self) -> u32 {
        (1u32 << self.depth) + 1
    }

    fn node_position(&self, node: [u32; 3]) -> Point3d {
        lattice_point(self.origin, self.size, self.depth, node)
    }

    fn node_value(&self, node: [u32; 3]) -> f64 {
        let stored = self
            .levels
            .last()
            .filter(|level| level.depth == self.depth)
            .and_then(|level| level.node_value(&node));
        match stored {
            Some(value) => value,
            None => self.value_at(&self.node_position(node)),
        }
    }
}

struct SolvedLevel {
    level: Level,
    iterations: usize,
    unknowns: usize,
}

/// Assemble and solve the system on `cells` at `depth`.
///
/// Nodes whose eight incident cells are all active are unknowns; every
/// other corner is fixed to the `coarser` function, or to zero on the
/// first level.
fn solve_level(
    depth: u32,
    cells: Vec<Cell>,
    coarser: Option<&ImplicitFunction>,
    splat: &Splat,
    config: &PoissonConfig,
    cancel: &CancellationToken,
) -> Result<SolvedLevel> {
    let lattice_cells = 1u32 << depth;
    let mut index: HashMap<Node, usize> = HashMap::with_capacity(cells.len() * 2);
    let mut nodes: Vec<Node> = Vec::with_capacity(cells.len() * 2);
    for &cell in &cells {
        for corner in 0..8 {
            let node = corner_node(cell, corner);
            index.entry(node).or_insert_with(|| {
                nodes.push(node);
                nodes.len() - 1
            });
        }
    }
    let cells: HashSet<Cell> = cells.into_iter().collect();
    cancel.check()?;

    let mut values = match coarser {
        Some(function) => parallel::parallel_map(&nodes, |&node| {
            function.value_at(&lattice_point(splat.origin, splat.size, depth, node))
        }),
        None => vec![0.0; nodes.len()],
    };

    let interior = parallel::parallel_map(&nodes, |node| {
        node.iter().all(|&c| c > 0 && c < lattice_cells)
            && (0..8).all(|corner| {
                let cell = [
                    node[0] - (corner & 1) as u32,
                    node[1] - ((corner >> 1) & 1) as u32,
                    node[2] - ((corner >> 2) & 1) as u32,
                ];
                cells.contains(&cell)
            })
    });
    let mut unknown_of: Vec<Option<usize>> = vec![None; nodes.len()];
    let mut unknowns: Vec<usize> = Vec::new();
    for (i, &inside) in interior.iter().enumerate() {
        if inside {
            unknown_of[i] = Some(unknowns.len());
            unknowns.push(i);
        }
    }

    // Fixed neighbors move to the right-hand side.
    let mut rhs = vec![0.0; unknowns.len()];
    let mut neighbors: Vec<[Option<usize>; 6]> = Vec::with_capacity(unknowns.len());
    for (row, &i) in unknowns.iter().enumerate() {
        let node = nodes[i];
        let mut adjacent = [None; 6];
        for (slot, &(axis, step)) in FACE_STEPS.iter().enumerate() {
            let mut next = node;
            next[axis] = match node[axis].checked_add_signed(step) {
                Some(c) => c,
                None => continue,
            };
            if let Some(&j) = index.get(&next) {
                match unknown_of[j] {
                    Some(k) => adjacent[slot] = Some(k),
                    None => rhs[row] += values[j],
                }
            }
        }
        neighbors.push(adjacent);
    }
    splat.accumulate(
        depth,
        |node| index.get(&node).and_then(|&i| unknown_of[i]),
        &mut rhs,
    );
    cancel.check()?;

    let operator = SparseLaplacian { neighbors };
    let mut x: Vec<f64> = unknowns.iter().map(|&i| values[i]).collect();
    let (iterations, residual) = conjugate_gradient(&operator, &rhs, &mut x, config, cancel)?;
    for (&i, v) in unknowns.iter().zip(x) {
        values[i] = v;
    }
    debug!(
        "Level {}: {} cells, {} unknowns, {} iterations, relative residual {:.3e}",
        depth,
        cells.len(),
        unknowns.len(),
        iterations,
        residual
    );

    Ok(SolvedLevel {
        level: Level {
            depth,
            cells,
            index,
            values,
        },
        iterations,
        unknowns: unknowns.len(),
    })
}

/// Oriented samples splatted onto lattice nodes
struct Splat<'a> {
    positions: &'a [Point3d],
    normals: &'a [Vector3d],
    areas: &'a [f64],
    origin: Point3d,
    size: f64,
}

impl Splat<'_> {
    /// Add the divergence of the sample field at `depth`, tested against
    /// each node's trilinear hat function, to the row `row_of` gives for the
    /// node. Nodes without a row are skipped.
    fn accumulate<F>(&self, depth: u32, row_of: F, rhs: &mut [f64])
    where
        F: Fn(Node) -> Option<usize>,
    {
        let cells = 1u32 << depth;
        let h = self.size / cells as f64;

        for ((p, normal), &area) in self.positions.iter().zip(self.normals).zip(self.areas) {
            let u = (p - self.origin) / h;
            let mut base = [0u32; 3];
            let mut frac = [0.0f64; 3];
            for axis in 0..3 {
                let b = u[axis].floor().clamp(0.0, (cells - 1) as f64);
                base[axis] = b as u32;
                frac[axis] = (u[axis] - b).clamp(0.0, 1.0);
            }

            for corner in 0..8 {
                let mut weight = [0.0f64; 3];
                let mut slope = [0.0f64; 3];
                for axis in 0..3 {
                    if (corner >> axis) & 1 == 1 {
                        weight[axis] = frac[axis];
                        slope[axis] = 1.0;
                    } else {
                        weight[axis] = 1.0 - frac[axis];
                        slope[axis] = -1.0;
                    }
                }
                if let Some(row) = row_of(corner_node(base, corner)) {
                    let gradient = Vector3d::new(
                        slope[0] * weight[1] * weight[2],
                        weight[0] * slope[1] * weight[2],
                        weight[0] * weight[1] * slope[2],
                    );
                    rhs[row] += area * gradient.dot(normal) / (h * h);
                }
            }
        }
    }
}

/// 7-point negative Laplacian over a level's unknowns. A missing neighbor
/// is a fixed node whose value already sits in the right-hand side.
struct SparseLaplacian {
    neighbors: Vec<[Option<usize>; 6]>,
}

impl SparseLaplacian {
    /// `out = A x`
    fn apply(&self, x: &[f64], out: &mut [f64]) {
        parallel::parallel_chunks_mut(out, ROWS_PER_TASK, |chunk, rows| {
            let first = chunk * ROWS_PER_TASK;
            for (offset, row) in rows.iter_mut().enumerate() {
                let i = first + offset;
                let coupled: f64 = self.neighbors[i].iter().flatten().map(|&j| x[j]).sum();
                *row = 6.0 * x[i] - coupled;
            }
        });
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Solve `A x = b` in place, starting from the given `x`. Returns the
/// iterations used and the final relative residual.
fn conjugate_gradient(
    operator: &SparseLaplacian,
    b: &[f64],
    x: &mut [f64],
    config: &PoissonConfig,
    cancel: &CancellationToken,
) -> Result<(usize, f64)> {
    let b_norm = dot(b, b).sqrt();
    if b_norm == 0.0 {
        x.iter_mut().for_each(|v| *v = 0.0);
        return Ok((0, 0.0));
    }

    let mut ap = vec![0.0; x.len()];
    operator.apply(x, &mut ap);
    let mut r: Vec<f64> = b.iter().zip(&ap).map(|(bi, ai)| bi - ai).collect();
    let mut p = r.clone();
    let mut rs = dot(&r, &r);

    let mut iterations = 0;
    while iterations < config.max_iterations {
        if rs.sqrt() <= config.tolerance * b_norm {
            break;
        }
        if iterations % CANCEL_CHECK_INTERVAL == 0 {
            cancel.check()?;
        }

        operator.apply(&p, &mut ap);
        let pap = dot(&p, &ap);
        if !(pap > 0.0) {
            break;
        }
        let alpha = rs / pap;
        for ((xi, ri), (pi, api)) in x.iter_mut().zip(r.iter_mut()).zip(p.iter().zip(&ap)) {
            *xi += alpha * pi;
            *ri -= alpha * api;
        }
        let rs_next = dot(&r, &r);
        let beta = rs_next / rs;
        for (pi, ri) in p.iter_mut().zip(&r) {
            *pi = ri + beta * *pi;
        }
        rs = rs_next;
        iterations += 1;
    }
    cancel.check()?;

    Ok((iterations, rs.sqrt() / b_norm))
}

/// Value at which the cumulative weight reaches half the total
fn weighted_median(values: &[f64], weights: &[f64]) -> f64 {
    let mut pairs: Vec<(f64, f64)> = values
        .iter()
        .copied()
        .zip(weights.iter().map(|w| w.max(0.0)))
        .collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    let total: f64 = pairs.iter().map(|&(_, w)| w).sum();
    if !(total > 0.0) {
        return pairs.get(pairs.len() / 2).map_or(0.0, |&(v, _)| v);
    }
    let half = total * 0.5;
    let mut running = 0.0;
    for &(value, weight) in &pairs {
        running += weight;
        if running >= half {
            return value;
        }
    }
    pairs.last().map_or(0.0, |&(v, _)| v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use cloudmesh_core::Point;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn fibonacci_sphere(n: usize, radius: f64) -> PointCloud {
        let golden = std::f64::consts::PI * (3.0 - 5.0f64.sqrt());
        PointCloud::from_points(
            (0..n)
                .map(|i| {
                    let y = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
                    let r = (1.0 - y * y).sqrt();
                    let theta = golden * i as f64;
                    let dir = Vector3d::new(r * theta.cos(), y, r * theta.sin());
                    Point::from_position(Point3d::from(dir * radius)).with_normal(dir)
                })
                .collect(),
        )
    }

    fn run(cloud: &PointCloud, config: &PoissonConfig) -> Result<PoissonResult> {
        let normals = OrientedNormalSet::from_cloud(cloud)?;
        poisson_reconstruction(cloud, &normals, config, &CancellationToken::new())
    }

    #[test]
    fn test_poisson_config_default() {
        let config = PoissonConfig::default();
        assert_eq!(config.depth, 8);
        assert_eq!(config.scale, 1.1);
        assert_eq!(config.samples_per_node, 1.5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_depth() {
        let config = PoissonConfig::default().with_depth(0);
        assert!(matches!(config.validate(), Err(Error::InvalidParameters(_))));
    }

    #[test]
    fn test_sphere_is_closed_with_euler_characteristic_two() {
        let cloud = fibonacci_sphere(2000, 1.0);
        let result = run(&cloud, &PoissonConfig::default().with_depth(6)).unwrap();
        let mesh = &result.mesh;

        assert!(mesh.validate().is_ok());
        let topo = mesh.topology();
        assert!(topo.is_watertight());
        assert_eq!(topo.euler_characteristic(), 2);

        for v in &mesh.vertices {
            assert!((v.coords.norm() - 1.0).abs() < 0.15, "vertex off the sphere: {}", v);
        }
    }

    #[test]
    fn test_sphere_faces_point_outward() {
        let cloud = fibonacci_sphere(1500, 2.0);
        let mesh = run(&cloud, &PoissonConfig::default().with_depth(5)).unwrap().mesh;
        let normals = mesh.calculate_face_normals();
        let outward = mesh
            .faces
            .iter()
            .zip(&normals)
            .filter(|(f, n)| n.dot(&mesh.vertices[f[0]].coords) > 0.0)
            .count();
        assert!(outward as f64 > 0.99 * mesh.face_count() as f64);
    }

    #[test]
    fn test_densities_are_normalized() {
        let cloud = fibonacci_sphere(1000, 1.0);
        let mesh = run(&cloud, &PoissonConfig::default().with_depth(5)).unwrap().mesh;
        let densities = mesh.densities.as_ref().unwrap();
        assert_eq!(densities.len(), mesh.vertex_count());
        assert!(densities.iter().all(|&d| (0.0..=1.0).contains(&d)));
        assert_relative_eq!(densities.iter().copied().fold(0.0, f64::max), 1.0);
    }

    #[test]
    fn test_solve_depth_is_capped() {
        let cloud = fibonacci_sphere(3000, 1.0);
        let result = run(&cloud, &PoissonConfig::default().with_depth(4)).unwrap();
        assert_eq!(result.solve_depth, 4);
        assert!(result.iterations > 0);
    }

    #[test]
    fn test_deterministic() {
        let cloud = fibonacci_sphere(800, 1.0);
        let config = PoissonConfig::default().with_depth(5);
        let a = run(&cloud, &config).unwrap();
        let b = run(&cloud, &config).unwrap();
        assert_eq!(a.mesh, b.mesh);
        assert_eq!(a.iso_value, b.iso_value);
    }

    #[test]
    fn test_memory_budget_exceeded() {
        let cloud = fibonacci_sphere(2000, 1.0);
        let config = PoissonConfig::default().with_depth(7).with_memory_budget(64 * 1024);
        assert!(matches!(run(&cloud, &config), Err(Error::ResourceExhausted(_))));
    }

    #[test]
    fn test_too_few_samples() {
        let cloud = fibonacci_sphere(3, 1.0);
        assert!(matches!(
            run(&cloud, &PoissonConfig::default()),
            Err(Error::InsufficientData(_))
        ));
    }

    #[test]
    fn test_coincident_samples_are_degenerate() {
        let cloud = PointCloud::from_points(vec![
            Point::new(1.0, 1.0, 1.0).with_normal(Vector3d::z());
            500
        ]);
        assert!(matches!(
            run(&cloud, &PoissonConfig::default()),
            Err(Error::DegenerateGeometry(_))
        ));
    }

    #[test]
    fn test_cancelled() {
        let cloud = fibonacci_sphere(500, 1.0);
        let normals = OrientedNormalSet::from_cloud(&cloud).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = poisson_reconstruction(&cloud, &normals, &PoissonConfig::default(), &cancel);
        assert_eq!(result.unwrap_err(), Error::Cancelled);
    }

    #[test]
    fn test_weighted_median() {
        assert_eq!(weighted_median(&[3.0, 1.0, 2.0], &[1.0, 1.0, 1.0]), 2.0);
        assert_eq!(weighted_median(&[1.0, 2.0, 3.0], &[0.1, 0.1, 5.0]), 3.0);
    }

    #[test]
    fn test_conjugate_gradient_solves_small_system() {
        // Interior of a 5^3 lattice: 3^3 unknowns, fixed boundary at zero.
        let n = 3usize;
        let id = |x: usize, y: usize, z: usize| (x * n + y) * n + z;
        let mut neighbors = Vec::new();
        for x in 0..n {
            for y in 0..n {
                for z in 0..n {
                    let mut adjacent = [None; 6];
                    for (slot, &(axis, step)) in FACE_STEPS.iter().enumerate() {
                        let mut c = [x as i32, y as i32, z as i32];
                        c[axis] += step;
                        if c.iter().all(|&v| (0..n as i32).contains(&v)) {
                            adjacent[slot] = Some(id(c[0] as usize, c[1] as usize, c[2] as usize));
                        }
                    }
                    neighbors.push(adjacent);
                }
            }
        }
        let operator = SparseLaplacian { neighbors };
        let mut b = vec![0.0; n * n * n];
        b[id(1, 1, 1)] = 1.0;
        let mut x = vec![0.0; b.len()];
        let config = PoissonConfig::default();
        let (_, residual) =
            conjugate_gradient(&operator, &b, &mut x, &config, &CancellationToken::new()).unwrap();
        assert!(residual <= config.tolerance);

        let mut ax = vec![0.0; x.len()];
        operator.apply(&x, &mut ax);
        for (a, b) in ax.iter().zip(&b) {
            assert_relative_eq!(a, b, epsilon = 1e-6);
        }
        // Symmetric source, symmetric solution
        assert_relative_eq!(x[id(0, 1, 1)], x[id(2, 1, 1)], epsilon = 1e-9);
        assert_relative_eq!(x[id(1, 0, 1)], x[id(1, 1, 2)], epsilon = 1e-9);
    }

    #[test]
    fn test_finest_level_is_sparse() {
        // A dense lattice at the configured depth would need more than this budget.
        let cloud = fibonacci_sphere(4000, 1.0);
        let config = PoissonConfig::default().with_depth(7).with_memory_budget(96 << 20);
        let result = run(&cloud, &config).unwrap();

        let dense_nodes = ((1usize << result.solve_depth) + 1).pow(3);
        assert!(result.finest_unknowns > 0);
        assert!(
            result.finest_unknowns * 2 < dense_nodes,
            "{} unknowns at depth {}",
            result.finest_unknowns,
            result.solve_depth
        );
        assert!(result.mesh.topology().is_watertight());
    }

    #[test]
    fn test_active_cells_follow_sample_density() {
        let mut rng = StdRng::seed_from_u64(3);
        // Dense patch on z = 0.5 near one corner, an 8 x 8 sparse grid on z = 0.25.
        let mut points: Vec<Point3d> = (0..2000)
            .map(|_| Point3d::new(rng.gen_range(0.1..0.2), rng.gen_range(0.1..0.2), 0.5))
            .collect();
        points.extend((0..8).flat_map(|i| {
            (0..8).map(move |j| Point3d::new(0.05 + i as f64 / 8.0, 0.05 + j as f64 / 8.0, 0.25))
        }));
        let octree =
            Octree::build(&points, Point3d::origin(), 1.0, 8, 1.5, 1 << 30, &CancellationToken::new()).unwrap();
        assert_eq!(octree.depth(), 8);

        let h = octree.cell_size(7);
        let cells = active_cells(&octree, 7);
        assert!(!cells.is_empty());
        for cell in &cells {
            let center = cell.map(|c| (c as f64 + 0.5) * h);
            assert!(center[0] < 0.3 && center[1] < 0.3, "cell {:?} away from the dense patch", cell);
            assert!((center[2] - 0.5).abs() < 0.05);
        }
        // The sparse grid never splits past depth 3.
        assert!(active_cells(&octree, 4).iter().all(|c| (c[2] as f64 + 0.5) / 16.0 > 0.3));
    }

    #[test]
    fn test_coarse_cells_cover_the_cube() {
        let cells = dense_cells(2);
        assert_eq!(cells.len(), 64);
        assert!(cells.windows(2).all(|w| w[0] < w[1]));
    }
}
