//! Immutable point cloud snapshots

use crate::bounds::BoundingBox;
use crate::point::*;
use std::ops::Index;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_CLOUD_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one loaded point cloud.
///
/// Every cloud built from a fresh set of points gets a new id; clones share
/// the id of the snapshot they were cloned from. Derived structures record
/// the id so they can refuse to be used against a different cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CloudId(u64);

impl CloudId {
    fn next() -> Self {
        Self(NEXT_CLOUD_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value, mostly useful for logging
    pub fn value(self) -> u64 {
        self.0
    }
}

/// An ordered, read-only sequence of points.
///
/// The storage is shared, so cloning a cloud is cheap and every pipeline
/// stage can hold its own handle. There is no way to mutate a point once
/// the cloud exists; loading new data means building a new cloud.
#[derive(Debug, Clone)]
pub struct PointCloud {
    points: Arc<[Point]>,
    id: CloudId,
}

impl PointCloud {
    /// Create an empty point cloud
    pub fn new() -> Self {
        Self::from_points(Vec::new())
    }

    /// Create a point cloud from a vector of points
    pub fn from_points(points: Vec<Point>) -> Self {
        Self {
            points: points.into(),
            id: CloudId::next(),
        }
    }

    /// Create a point cloud carrying positions only
    pub fn from_positions<I>(positions: I) -> Self
    where
        I: IntoIterator<Item = Point3d>,
    {
        positions.into_iter().map(Point::from_position).collect()
    }

    /// Identity of this snapshot
    pub fn id(&self) -> CloudId {
        self.id
    }

    /// Get the number of points in the cloud
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Check if the point cloud is empty
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// All points as a slice
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Get an iterator over the points
    pub fn iter(&self) -> std::slice::Iter<'_, Point> {
        self.points.iter()
    }

    /// Position of the point at `index`
    pub fn position(&self, index: usize) -> Point3d {
        self.points[index].position
    }

    /// Copy of all positions in index order
    pub fn positions(&self) -> Vec<Point3d> {
        self.points.iter().map(|p| p.position).collect()
    }

    /// True when every point carries a color
    pub fn has_colors(&self) -> bool {
        !self.is_empty() && self.points.iter().all(|p| p.color.is_some())
    }

    /// True when every point carries an intensity
    pub fn has_intensities(&self) -> bool {
        !self.is_empty() && self.points.iter().all(|p| p.intensity.is_some())
    }

    /// True when every point carries a normal
    pub fn has_normals(&self) -> bool {
        !self.is_empty() && self.points.iter().all(|p| p.normal.is_some())
    }

    /// True when every coordinate of every point is finite
    pub fn is_finite(&self) -> bool {
        self.points.iter().all(Point::is_finite)
    }

    /// Axis-aligned bounds of all positions, `None` for an empty cloud
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        BoundingBox::from_points(self.points.iter().map(|p| &p.position))
    }
}

impl Default for PointCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<usize> for PointCloud {
    type Output = Point;

    fn index(&self, index: usize) -> &Self::Output {
        &self.points[index]
    }
}

impl<'a> IntoIterator for &'a PointCloud {
    type Item = &'a Point;
    type IntoIter = std::slice::Iter<'a, Point>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.iter()
    }
}

impl FromIterator<Point> for PointCloud {
    fn from_iter<I: IntoIterator<Item = Point>>(iter: I) -> Self {
        Self::from_points(Vec::from_iter(iter))
    }
}

impl From<Vec<Point>> for PointCloud {
    fn from(points: Vec<Point>) -> Self {
        Self::from_points(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_shares_identity() {
        let cloud = PointCloud::from_positions(vec![Point3d::origin(), Point3d::new(1.0, 0.0, 0.0)]);
        let clone = cloud.clone();
        assert_eq!(cloud.id(), clone.id());
        assert_eq!(clone.len(), 2);
    }

    #[test]
    fn test_rebuilt_cloud_gets_new_identity() {
        let a = PointCloud::from_positions(vec![Point3d::origin()]);
        let b = PointCloud::from_positions(vec![Point3d::origin()]);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_attribute_queries() {
        let cloud: PointCloud = vec![
            Point::new(0.0, 0.0, 0.0).with_color([1, 2, 3]),
            Point::new(1.0, 0.0, 0.0).with_color([4, 5, 6]).with_intensity(0.2),
        ]
        .into();
        assert!(cloud.has_colors());
        assert!(!cloud.has_intensities());
        assert!(!cloud.has_normals());
        assert!(!PointCloud::new().has_colors());
    }

    #[test]
    fn test_bounding_box() {
        let cloud = PointCloud::from_positions(vec![
            Point3d::new(-1.0, 2.0, 0.5),
            Point3d::new(3.0, -2.0, 1.5),
        ]);
        let bbox = cloud.bounding_box().unwrap();
        assert_eq!(bbox.min, Point3d::new(-1.0, -2.0, 0.5));
        assert_eq!(bbox.max, Point3d::new(3.0, 2.0, 1.5));
        assert!(PointCloud::new().bounding_box().is_none());
    }
}
