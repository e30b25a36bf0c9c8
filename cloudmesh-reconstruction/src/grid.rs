//! Regular scalar grids
//!
//! A [`ScalarGrid`] stores one value per lattice node of an axis-aligned
//! cubic lattice. The Poisson solver keeps its coarsest, dense level on one;
//! finer levels fall back to it wherever they have no cells.

use cloudmesh_core::{Error, Point3d, Result};
use ndarray::Array3;

/// Scalar values on the nodes of a regular lattice
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarGrid {
    /// Values indexed `[x, y, z]`, standard (row-major) layout
    values: Array3<f64>,
    /// Distance between neighboring nodes along every axis
    spacing: f64,
    /// World position of node `(0, 0, 0)`
    origin: Point3d,
}

impl ScalarGrid {
    /// Wrap row-major `values` (z fastest)
    pub fn from_values(
        dimensions: [usize; 3],
        spacing: f64,
        origin: Point3d,
        values: Vec<f64>,
    ) -> Result<Self> {
        let values = Array3::from_shape_vec((dimensions[0], dimensions[1], dimensions[2]), values)
            .map_err(|e| {
                Error::InvalidParameters(format!("grid values do not match {:?}: {}", dimensions, e))
            })?;
        Ok(Self {
            values,
            spacing,
            origin,
        })
    }

    pub fn dimensions(&self) -> [usize; 3] {
        let (x, y, z) = self.values.dim();
        [x, y, z]
    }

    pub fn values(&self) -> &Array3<f64> {
        &self.values
    }

    /// Continuous lattice coordinates of a world position
    pub fn world_to_grid(&self, p: &Point3d) -> [f64; 3] {
        let u = (p - self.origin) / self.spacing;
        [u.x, u.y, u.z]
    }

    /// Trilinear interpolation at a world position, clamped to the grid
    pub fn sample(&self, p: &Point3d) -> f64 {
        self.sample_grid(self.world_to_grid(p))
    }

    /// Trilinear interpolation at continuous lattice coordinates, clamped
    pub fn sample_grid(&self, u: [f64; 3]) -> f64 {
        let dims = self.dimensions();
        let mut base = [0usize; 3];
        let mut frac = [0.0f64; 3];
        for axis in 0..3 {
            if dims[axis] < 2 {
                continue;
            }
            let max_base = (dims[axis] - 2) as f64;
            let b = u[axis].floor().clamp(0.0, max_base);
            base[axis] = b as usize;
            frac[axis] = (u[axis] - b).clamp(0.0, 1.0);
        }

        let mut value = 0.0;
        for corner in 0..8 {
            let mut weight = 1.0;
            let mut idx = [0usize; 3];
            for axis in 0..3 {
                let bit = (corner >> axis) & 1;
                let step = if dims[axis] < 2 { 0 } else { bit };
                idx[axis] = base[axis] + step;
                weight *= if bit == 1 { frac[axis] } else { 1.0 - frac[axis] };
            }
            if weight != 0.0 {
                value += weight * self.values[idx];
            }
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn from_fn<F: Fn(Point3d) -> f64>(n: usize, spacing: f64, origin: Point3d, f: F) -> ScalarGrid {
        let values = (0..n)
            .flat_map(|x| (0..n).flat_map(move |y| (0..n).map(move |z| [x, y, z])))
            .map(|[x, y, z]| f(origin + nalgebra::Vector3::new(x as f64, y as f64, z as f64) * spacing))
            .collect();
        ScalarGrid::from_values([n; 3], spacing, origin, values).unwrap()
    }

    #[test]
    fn test_world_to_grid_conversion() {
        let grid = from_fn(5, 2.0, Point3d::new(1.0, 1.0, 1.0), |_| 0.0);
        assert_eq!(grid.world_to_grid(&Point3d::new(4.0, 1.0, 2.0)), [1.5, 0.0, 0.5]);
        assert_eq!(grid.dimensions(), [5, 5, 5]);
    }

    #[test]
    fn test_trilinear_sampling_reproduces_linear_field() {
        let f = |p: Point3d| 2.0 * p.x - p.y + 0.5 * p.z + 1.0;
        let grid = from_fn(6, 0.25, Point3d::new(-0.5, -0.5, -0.5), f);
        let p = Point3d::new(0.13, 0.31, -0.27);
        assert_relative_eq!(grid.sample(&p), f(p), epsilon = 1e-12);
    }

    #[test]
    fn test_sampling_hits_node_values_and_clamps() {
        let grid = from_fn(9, 0.5, Point3d::new(-2.0, -2.0, -2.0), |p| p.coords.norm() - 1.0);
        assert_relative_eq!(grid.sample_grid([4.0, 4.0, 4.0]), -1.0, epsilon = 1e-12);
        assert_relative_eq!(grid.values()[[2, 3, 4]], grid.sample_grid([2.0, 3.0, 4.0]), epsilon = 1e-12);
        assert_relative_eq!(grid.sample_grid([-5.0, 0.0, 0.0]), grid.values()[[0, 0, 0]], epsilon = 1e-12);
    }

    #[test]
    fn test_from_values_checks_shape() {
        assert!(ScalarGrid::from_values([2, 2, 2], 1.0, Point3d::origin(), vec![0.0; 8]).is_ok());
        assert!(ScalarGrid::from_values([2, 2, 2], 1.0, Point3d::origin(), vec![0.0; 7]).is_err());
    }
}
