//! Axis-aligned bounding boxes

use crate::point::*;
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: Point3d,
    pub max: Point3d,
}

impl BoundingBox {
    pub fn new(min: Point3d, max: Point3d) -> Self {
        Self { min, max }
    }

    /// Tightest box around `points`, `None` when the iterator is empty
    pub fn from_points<'a, I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Point3d>,
    {
        let mut iter = points.into_iter();
        let first = *iter.next()?;
        let mut bbox = Self::new(first, first);
        for p in iter {
            bbox.expand(p);
        }
        Some(bbox)
    }

    /// Grow the box so it contains `p`
    pub fn expand(&mut self, p: &Point3d) {
        self.min = self.min.inf(p);
        self.max = self.max.sup(p);
    }

    pub fn center(&self) -> Point3d {
        nalgebra::center(&self.min, &self.max)
    }

    pub fn extent(&self) -> Vector3d {
        self.max - self.min
    }

    /// Length of the longest side
    pub fn max_extent(&self) -> f64 {
        self.extent().max()
    }

    /// Length of the diagonal
    pub fn diagonal(&self) -> f64 {
        self.extent().norm()
    }

    pub fn contains(&self, p: &Point3d) -> bool {
        (0..3).all(|i| p[i] >= self.min[i] && p[i] <= self.max[i])
    }

    /// The smallest cube sharing this box's center that contains it,
    /// with its side multiplied by `scale`. Returns `(origin, side)`.
    pub fn bounding_cube(&self, scale: f64) -> (Point3d, f64) {
        let side = self.max_extent() * scale;
        let origin = self.center() - Vector3d::repeat(side * 0.5);
        (origin, side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_from_points_and_measures() {
        let pts = [Point3d::new(0.0, 0.0, 0.0), Point3d::new(2.0, 1.0, 0.0)];
        let bbox = BoundingBox::from_points(pts.iter()).unwrap();
        assert_relative_eq!(bbox.max_extent(), 2.0);
        assert_relative_eq!(bbox.diagonal(), 5.0_f64.sqrt());
        assert_eq!(bbox.center(), Point3d::new(1.0, 0.5, 0.0));
        assert!(bbox.contains(&Point3d::new(1.0, 1.0, 0.0)));
        assert!(!bbox.contains(&Point3d::new(1.0, 1.0, 0.1)));
    }

    #[test]
    fn test_bounding_cube() {
        let bbox = BoundingBox::new(Point3d::new(0.0, 0.0, 0.0), Point3d::new(2.0, 1.0, 0.0));
        let (origin, side) = bbox.bounding_cube(1.5);
        assert_relative_eq!(side, 3.0);
        assert_relative_eq!(origin.x, -0.5);
        assert_relative_eq!(origin.y, -1.0);
        assert_relative_eq!(origin.z, -1.5);
    }
}
