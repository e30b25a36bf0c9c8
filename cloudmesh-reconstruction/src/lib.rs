//! # cloudmesh Reconstruction
//!
//! Surface reconstruction from oriented point clouds.
//!
//! This crate provides Poisson reconstruction on an adaptive octree, the
//! ball pivoting algorithm, mesh post-processing, and the pipeline that
//! runs them from raw points to a cleaned mesh.

pub mod ball_pivoting;
pub mod grid;
pub mod marching_tetrahedra;
pub mod octree;
pub mod pipeline;
pub mod poisson;
pub mod postprocess;

// Re-export commonly used items
pub use ball_pivoting::{ball_pivoting, BallPivotingConfig, BallPivotingResult, BallRadius, PivotPass};
pub use grid::ScalarGrid;
pub use marching_tetrahedra::{LatticeField, MarchingTetrahedra, MarchingTetrahedraConfig};
pub use octree::{NodeKey, Octree, OctreeNode};
pub use pipeline::*;
pub use poisson::{poisson_reconstruction, PoissonConfig, PoissonResult};
pub use postprocess::{post_process, PostProcessConfig, PostProcessReport};
