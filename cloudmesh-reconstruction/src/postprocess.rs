//! Mesh post-processing
//!
//! Cleans a reconstructed mesh and carries attributes of the source cloud
//! over to it. Steps run in a fixed order: invalid faces, degenerate
//! faces, low-density faces, unreferenced vertices, vertex normals, colors.

use cloudmesh_algorithms::{parallel, KdTree};
use cloudmesh_core::{
    Color, Error, NearestNeighborSearch, PointCloud, Result, TriangleMesh,
};
use std::fmt;
use tracing::{debug, info};

/// Configuration parameters for post-processing
#[derive(Debug, Clone, PartialEq)]
pub struct PostProcessConfig {
    /// Quantile of vertex density below which faces are trimmed, in `[0, 1]`.
    /// Only applies to meshes carrying densities. Default: `0.0` (off)
    pub density_threshold: f64,
    /// Faces with area at most this times the squared mean edge length are
    /// dropped. Default: `1e-10`
    pub degenerate_area_epsilon: f64,
    /// Copy colors (or grayscale intensity) from the nearest input point.
    /// Default: `true`
    pub transfer_colors: bool,
    /// Recompute area-weighted vertex normals. Default: `true`
    pub compute_vertex_normals: bool,
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            density_threshold: 0.0,
            degenerate_area_epsilon: 1e-10,
            transfer_colors: true,
            compute_vertex_normals: true,
        }
    }
}

impl PostProcessConfig {
    pub fn with_density_threshold(mut self, threshold: f64) -> Self {
        self.density_threshold = threshold;
        self
    }

    pub fn with_transfer_colors(mut self, transfer: bool) -> Self {
        self.transfer_colors = transfer;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.density_threshold) {
            return Err(Error::InvalidParameters(format!(
                "density threshold must be in [0, 1], got {}",
                self.density_threshold
            )));
        }
        if !(self.degenerate_area_epsilon >= 0.0) || !self.degenerate_area_epsilon.is_finite() {
            return Err(Error::InvalidParameters(format!(
                "degenerate area epsilon must be finite and non-negative, got {}",
                self.degenerate_area_epsilon
            )));
        }
        Ok(())
    }
}

/// What post-processing removed or added
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostProcessReport {
    pub removed_invalid: usize,
    pub removed_degenerate: usize,
    pub removed_low_density: usize,
    pub removed_unreferenced: usize,
    pub colors_transferred: bool,
}

impl PostProcessReport {
    pub fn had_changes(&self) -> bool {
        self.removed_invalid > 0
            || self.removed_degenerate > 0
            || self.removed_low_density > 0
            || self.removed_unreferenced > 0
    }
}

impl fmt::Display for PostProcessReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "removed {} invalid, {} degenerate and {} low-density faces, {} unreferenced vertices",
            self.removed_invalid,
            self.removed_degenerate,
            self.removed_low_density,
            self.removed_unreferenced
        )
    }
}

/// Clean `mesh` and transfer attributes from `source`, which `index` must
/// be built over.
pub fn post_process(
    mut mesh: TriangleMesh,
    source: &PointCloud,
    index: &KdTree,
    config: &PostProcessConfig,
) -> Result<(TriangleMesh, PostProcessReport)> {
    config.validate()?;
    let mut report = PostProcessReport {
        removed_invalid: remove_invalid_faces(&mut mesh),
        removed_degenerate: remove_degenerate_faces(&mut mesh, config.degenerate_area_epsilon),
        ..Default::default()
    };
    if config.density_threshold > 0.0 {
        report.removed_low_density = remove_low_density_faces(&mut mesh, config.density_threshold);
    }
    report.removed_unreferenced = remove_unreferenced_vertices(&mut mesh);

    if config.compute_vertex_normals {
        mesh.compute_vertex_normals();
    }
    if config.transfer_colors {
        report.colors_transferred = transfer_colors(&mut mesh, source, index);
    }

    if report.had_changes() {
        debug!("Post-processing {}", report);
    }
    info!(
        "Post-processed mesh has {} vertices and {} faces",
        mesh.vertex_count(),
        mesh.face_count()
    );
    Ok((mesh, report))
}

/// Remove faces with an out-of-range or repeated vertex index.
///
/// Returns the number of faces removed.
pub fn remove_invalid_faces(mesh: &mut TriangleMesh) -> usize {
    let n = mesh.vertices.len();
    let before = mesh.faces.len();
    mesh.faces.retain(|f| {
        f.iter().all(|&i| i < n) && f[0] != f[1] && f[1] != f[2] && f[0] != f[2]
    });
    before - mesh.faces.len()
}

/// Remove faces whose area is at most `epsilon` times the squared mean
/// edge length of the mesh.
///
/// Returns the number of faces removed.
pub fn remove_degenerate_faces(mesh: &mut TriangleMesh, epsilon: f64) -> usize {
    if mesh.faces.is_empty() {
        return 0;
    }
    let edge_sum: f64 = mesh
        .faces
        .iter()
        .flat_map(|f| (0..3).map(move |k| (f[k], f[(k + 1) % 3])))
        .map(|(a, b)| (mesh.vertices[a] - mesh.vertices[b]).norm())
        .sum();
    let mean_edge = edge_sum / (3 * mesh.faces.len()) as f64;
    let threshold = epsilon * mean_edge * mean_edge;

    let areas: Vec<f64> = mesh.faces.iter().map(|f| mesh.triangle_area(f)).collect();
    let before = mesh.faces.len();
    let mut areas = areas.into_iter();
    mesh.faces.retain(|_| areas.next().is_some_and(|a| a > threshold));
    before - mesh.faces.len()
}

/// Remove faces touching a vertex whose density lies below the
/// `quantile` of the referenced vertices' densities. Meshes without
/// densities are left alone.
///
/// Returns the number of faces removed.
pub fn remove_low_density_faces(mesh: &mut TriangleMesh, quantile: f64) -> usize {
    let Some(densities) = mesh.densities.as_ref() else {
        return 0;
    };
    let referenced = mesh.referenced_vertices();
    let mut values: Vec<f64> = densities
        .iter()
        .zip(&referenced)
        .filter(|(_, &r)| r)
        .map(|(&d, _)| d)
        .collect();
    if values.is_empty() {
        return 0;
    }
    values.sort_by(f64::total_cmp);
    let rank = ((values.len() - 1) as f64 * quantile).round() as usize;
    let cutoff = values[rank.min(values.len() - 1)];
    debug!("Density cutoff {:.6} at quantile {}", cutoff, quantile);

    let before = mesh.faces.len();
    let keep: Vec<bool> = mesh
        .faces
        .iter()
        .map(|f| f.iter().all(|&i| densities[i] >= cutoff))
        .collect();
    let mut keep = keep.into_iter();
    mesh.faces.retain(|_| keep.next().unwrap_or(false));
    before - mesh.faces.len()
}

/// Drop vertices no face references and re-index the faces. Vertex
/// attributes follow their vertices.
///
/// Returns the number of vertices removed.
pub fn remove_unreferenced_vertices(mesh: &mut TriangleMesh) -> usize {
    let referenced = mesh.referenced_vertices();
    let before = mesh.vertices.len();
    if referenced.iter().all(|&r| r) {
        return 0;
    }

    let mut remap = vec![usize::MAX; before];
    let mut next = 0;
    for (old, &keep) in referenced.iter().enumerate() {
        if keep {
            remap[old] = next;
            next += 1;
        }
    }

    fn compact<T: Copy>(values: &[T], referenced: &[bool]) -> Vec<T> {
        values
            .iter()
            .zip(referenced)
            .filter(|(_, &keep)| keep)
            .map(|(&v, _)| v)
            .collect()
    }
    mesh.vertices = compact(&mesh.vertices, &referenced);
    mesh.normals = mesh.normals.as_deref().map(|n| compact(n, &referenced));
    mesh.colors = mesh.colors.as_deref().map(|c| compact(c, &referenced));
    mesh.densities = mesh.densities.as_deref().map(|d| compact(d, &referenced));
    for face in &mut mesh.faces {
        *face = face.map(|i| remap[i]);
    }

    before - mesh.vertices.len()
}

/// Color each vertex like its nearest source point. Without colors,
/// intensities become gray levels. Returns whether anything was written.
pub fn transfer_colors(mesh: &mut TriangleMesh, source: &PointCloud, index: &KdTree) -> bool {
    if mesh.vertices.is_empty() || source.is_empty() || index.len() != source.len() {
        return false;
    }
    let palette: Vec<Color> = if source.has_colors() {
        source.iter().map(|p| p.color.unwrap_or([0, 0, 0])).collect()
    } else if source.has_intensities() {
        grayscale(source)
    } else {
        return false;
    };

    let colors = parallel::parallel_map(&mesh.vertices, |v| {
        index
            .find_k_nearest(v, 1)
            .first()
            .map_or([0, 0, 0], |&(nearest, _)| palette[nearest])
    });
    mesh.set_colors(colors);
    true
}

/// Intensities stretched over the full gray range
fn grayscale(source: &PointCloud) -> Vec<Color> {
    let intensities: Vec<f64> = source
        .iter()
        .map(|p| p.intensity.map_or(0.0, f64::from))
        .collect();
    let (lo, hi) = intensities
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    intensities
        .into_iter()
        .map(|v| {
            let t = if hi > lo { (v - lo) / (hi - lo) } else { v.clamp(0.0, 1.0) };
            let g = (t * 255.0).round() as u8;
            [g, g, g]
        })
        .collect()
}
