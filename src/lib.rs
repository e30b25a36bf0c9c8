//! # cloudmesh
//!
//! Surface reconstruction from unorganized point clouds.
//!
//! This is the umbrella crate that re-exports the individual cloudmesh crates.
//! Use the sub-crates directly for finer control over dependencies.
//!
//! ## Features
//!
//! - **Core**: points, immutable point cloud snapshots, triangle meshes, errors
//! - **Algorithms**: k-d tree, neighbor graphs, normal estimation and orientation
//! - **Reconstruction**: Poisson and ball-pivoting reconstruction, mesh post-processing
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cloudmesh::prelude::*;
//!
//! let cloud: PointCloud = (0..1000)
//!     .map(|i| {
//!         let t = i as f64 * 0.1;
//!         Point::new(t.cos(), t.sin(), i as f64 * 0.001)
//!     })
//!     .collect();
//!
//! let mesh = reconstruct(&cloud, ReconstructionMethod::BallPivoting, &ReconstructionParams::default());
//! ```
//!
//! ## Feature Flags
//!
//! - `default`: enables `algorithms` and `reconstruction`
//! - `algorithms`: spatial index and normal processing
//! - `reconstruction`: surface reconstruction (implies `algorithms`)

// Re-export core functionality
pub use cloudmesh_core::*;

#[cfg(feature = "algorithms")]
pub use cloudmesh_algorithms as algorithms;

#[cfg(feature = "reconstruction")]
pub use cloudmesh_reconstruction as reconstruction;

/// Convenient imports for common use cases
pub mod prelude {
    pub use cloudmesh_core::*;

    #[cfg(feature = "algorithms")]
    pub use cloudmesh_algorithms::*;

    #[cfg(feature = "reconstruction")]
    pub use cloudmesh_reconstruction::*;
}
