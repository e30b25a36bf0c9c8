//! Core traits for cloudmesh

use crate::point::*;

/// Trait for nearest neighbor search functionality.
///
/// Every query returns `(index, distance)` pairs sorted by ascending
/// distance, ties broken by ascending index. Asking for more neighbors than
/// exist returns everything available instead of failing.
pub trait NearestNeighborSearch {
    /// Find the k nearest indexed points to an arbitrary position
    fn find_k_nearest(&self, query: &Point3d, k: usize) -> Vec<(usize, f64)>;

    /// Find all indexed points within `radius` of an arbitrary position
    fn find_radius_neighbors(&self, query: &Point3d, radius: f64) -> Vec<(usize, f64)>;

    /// The k nearest neighbors of the indexed point `index`, excluding itself
    fn k_nearest_of(&self, index: usize, k: usize) -> Vec<(usize, f64)>;

    /// All neighbors of the indexed point `index` within `radius`, excluding itself
    fn radius_neighbors_of(&self, index: usize, radius: f64) -> Vec<(usize, f64)>;
}
