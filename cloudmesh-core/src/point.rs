//! Point types and related functionality

use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

/// A 3D point with double precision coordinates
pub type Point3d = Point3<f64>;

/// A 3D vector with double precision components
pub type Vector3d = Vector3<f64>;

/// An 8-bit RGB color
pub type Color = [u8; 3];

/// A single sample of a point cloud.
///
/// Only the position is mandatory. Color, intensity and normal are carried
/// through from whatever loader produced the cloud.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub position: Point3d,
    pub color: Option<Color>,
    pub intensity: Option<f32>,
    pub normal: Option<Vector3d>,
}

impl Point {
    /// Create a bare point from coordinates
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self::from_position(Point3d::new(x, y, z))
    }

    /// Create a bare point from a position
    pub fn from_position(position: Point3d) -> Self {
        Self {
            position,
            color: None,
            intensity: None,
            normal: None,
        }
    }

    /// Attach an RGB color
    pub fn with_color(mut self, color: Color) -> Self {
        self.color = Some(color);
        self
    }

    /// Attach a scalar intensity
    pub fn with_intensity(mut self, intensity: f32) -> Self {
        self.intensity = Some(intensity);
        self
    }

    /// Attach a normal vector. The vector is stored as given.
    pub fn with_normal(mut self, normal: Vector3d) -> Self {
        self.normal = Some(normal);
        self
    }

    /// Whether the coordinates are all finite
    pub fn is_finite(&self) -> bool {
        self.position.coords.iter().all(|c| c.is_finite())
    }
}

impl Default for Point {
    fn default() -> Self {
        Self::from_position(Point3d::origin())
    }
}

impl From<Point3d> for Point {
    fn from(position: Point3d) -> Self {
        Self::from_position(position)
    }
}
