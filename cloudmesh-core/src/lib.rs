//! Core data structures and traits for cloudmesh
//!
//! This crate provides the types shared by every reconstruction stage:
//! points, immutable point cloud snapshots, triangle meshes, the error type,
//! cooperative cancellation and progress reporting.

pub mod point;
pub mod point_cloud;
pub mod mesh;
pub mod bounds;
pub mod traits;
pub mod error;
pub mod cancel;
pub mod progress;

pub use point::*;
pub use point_cloud::*;
pub use mesh::*;
pub use bounds::*;
pub use traits::*;
pub use error::*;
pub use cancel::*;
pub use progress::*;

/// Re-export commonly used types from nalgebra
pub use nalgebra::{Matrix3, Point3, Vector3};

// Type aliases for easier imports
pub type Mesh = TriangleMesh;
