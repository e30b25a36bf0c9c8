//! # cloudmesh Algorithms
//!
//! Point-wise algorithms that feed surface reconstruction.
//!
//! This crate provides the spatial index, per-point neighbor graphs, PCA
//! normal estimation and consistent normal orientation, plus the parallel
//! helpers the other crates share.

pub mod nearest_neighbor;
pub mod neighbor_graph;
pub mod normals;
pub mod orientation;
pub mod parallel;

// Re-export commonly used items
pub use nearest_neighbor::*;
pub use neighbor_graph::*;
pub use normals::*;
pub use orientation::*;
pub use parallel::{init_thread_pool, ThreadPoolConfig};
