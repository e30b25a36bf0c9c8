//! Per-point neighborhoods shared by normal estimation and orientation

use crate::nearest_neighbor::KdTree;
use crate::parallel::parallel_map_indexed;
use cloudmesh_core::{
    CancellationToken, CloudId, Error, NearestNeighborSearch, PointCloud, Result,
};
use std::time::Instant;
use tracing::info;

/// How a neighborhood is selected
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NeighborQuery {
    /// The k nearest points
    KNearest(usize),
    /// Every point within the radius
    Radius(f64),
    /// At most k nearest points, all within the radius
    Hybrid { k: usize, radius: f64 },
}

impl NeighborQuery {
    pub fn validate(&self) -> Result<()> {
        let (k, radius) = match *self {
            NeighborQuery::KNearest(k) => (Some(k), None),
            NeighborQuery::Radius(r) => (None, Some(r)),
            NeighborQuery::Hybrid { k, radius } => (Some(k), Some(radius)),
        };
        if k == Some(0) {
            return Err(Error::InvalidParameters(
                "neighbor count must be at least 1".to_string(),
            ));
        }
        if let Some(r) = radius {
            if !(r > 0.0) || !r.is_finite() {
                return Err(Error::InvalidParameters(format!(
                    "neighbor radius must be positive and finite, got {r}"
                )));
            }
        }
        Ok(())
    }
}

/// One entry of a neighborhood
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub distance: f64,
}

/// Neighborhoods of every point of one cloud, in compressed row form.
///
/// Each row is sorted by ascending distance and never contains the point
/// itself. The graph is tied to the cloud it was built for and is rebuilt,
/// never patched, when the cloud changes.
#[derive(Debug, Clone)]
pub struct NeighborGraph {
    cloud_id: CloudId,
    query: NeighborQuery,
    offsets: Vec<usize>,
    neighbors: Vec<Neighbor>,
}

impl NeighborGraph {
    /// Query `index` for every point of `cloud`.
    ///
    /// `index` must have been built over the same cloud.
    pub fn build(
        cloud: &PointCloud,
        index: &KdTree,
        query: NeighborQuery,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        query.validate()?;
        if index.len() != cloud.len() {
            return Err(Error::InvalidParameters(format!(
                "spatial index holds {} points but the cloud has {}",
                index.len(),
                cloud.len()
            )));
        }
        cancel.check()?;

        let start = Instant::now();
        let rows: Vec<Vec<Neighbor>> = parallel_map_indexed(cloud.points(), |i, _| {
            if cancel.is_cancelled() {
                return Vec::new();
            }
            let found = match query {
                NeighborQuery::KNearest(k) => index.k_nearest_of(i, k),
                NeighborQuery::Radius(r) => index.radius_neighbors_of(i, r),
                NeighborQuery::Hybrid { k, radius } => {
                    let mut found = index.k_nearest_of(i, k);
                    found.retain(|&(_, d)| d <= radius);
                    found
                }
            };
            found
                .into_iter()
                .map(|(index, distance)| Neighbor { index, distance })
                .collect()
        });
        cancel.check()?;

        let mut offsets = Vec::with_capacity(rows.len() + 1);
        offsets.push(0);
        let mut neighbors = Vec::with_capacity(rows.iter().map(Vec::len).sum());
        for row in rows {
            neighbors.extend(row);
            offsets.push(neighbors.len());
        }

        info!(
            "Built neighbor graph ({:?}) for {} points with {} edges in {:?}",
            query,
            cloud.len(),
            neighbors.len(),
            start.elapsed()
        );

        Ok(Self {
            cloud_id: cloud.id(),
            query,
            offsets,
            neighbors,
        })
    }

    /// Neighbors of point `i`, nearest first
    pub fn neighbors(&self, i: usize) -> &[Neighbor] {
        &self.neighbors[self.offsets[i]..self.offsets[i + 1]]
    }

    /// Number of points (rows)
    pub fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of directed neighbor entries
    pub fn edge_count(&self) -> usize {
        self.neighbors.len()
    }

    pub fn query(&self) -> NeighborQuery {
        self.query
    }

    pub fn cloud_id(&self) -> CloudId {
        self.cloud_id
    }

    /// Whether this graph describes `cloud`
    pub fn is_valid_for(&self, cloud: &PointCloud) -> bool {
        self.cloud_id == cloud.id() && self.len() == cloud.len()
    }

    /// `InvalidParameters` unless this graph describes `cloud`
    pub fn ensure_valid_for(&self, cloud: &PointCloud) -> Result<()> {
        if self.is_valid_for(cloud) {
            Ok(())
        } else {
            Err(Error::InvalidParameters(
                "neighbor graph was built for a different point cloud".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudmesh_core::Point3d;

    fn line_cloud(n: usize) -> PointCloud {
        PointCloud::from_positions((0..n).map(|i| Point3d::new(i as f64, 0.0, 0.0)))
    }

    #[test]
    fn test_knn_rows() {
        let cloud = line_cloud(10);
        let index = KdTree::build(&cloud);
        let graph =
            NeighborGraph::build(&cloud, &index, NeighborQuery::KNearest(2), &CancellationToken::new())
                .unwrap();

        assert_eq!(graph.len(), 10);
        let row: Vec<usize> = graph.neighbors(5).iter().map(|n| n.index).collect();
        assert_eq!(row, vec![4, 6]);
        assert_eq!(graph.neighbors(0)[0].index, 1);
        assert_eq!(graph.edge_count(), 20);
    }

    #[test]
    fn test_hybrid_respects_radius() {
        let cloud = line_cloud(10);
        let index = KdTree::build(&cloud);
        let query = NeighborQuery::Hybrid { k: 5, radius: 1.5 };
        let graph = NeighborGraph::build(&cloud, &index, query, &CancellationToken::new()).unwrap();
        assert_eq!(graph.neighbors(5).len(), 2);
        assert_eq!(graph.neighbors(0).len(), 1);
    }

    #[test]
    fn test_radius_rows() {
        let cloud = line_cloud(10);
        let index = KdTree::build(&cloud);
        let graph =
            NeighborGraph::build(&cloud, &index, NeighborQuery::Radius(2.0), &CancellationToken::new())
                .unwrap();
        let row: Vec<usize> = graph.neighbors(5).iter().map(|n| n.index).collect();
        assert_eq!(row, vec![4, 6, 3, 7]);
    }

    #[test]
    fn test_graph_is_tied_to_its_cloud() {
        let cloud = line_cloud(10);
        let other = line_cloud(10);
        let index = KdTree::build(&cloud);
        let graph =
            NeighborGraph::build(&cloud, &index, NeighborQuery::KNearest(3), &CancellationToken::new())
                .unwrap();
        assert!(graph.is_valid_for(&cloud));
        assert!(graph.is_valid_for(&cloud.clone()));
        assert!(!graph.is_valid_for(&other));
        assert!(matches!(
            graph.ensure_valid_for(&other),
            Err(Error::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_invalid_queries() {
        let cloud = line_cloud(4);
        let index = KdTree::build(&cloud);
        let cancel = CancellationToken::new();
        for query in [
            NeighborQuery::KNearest(0),
            NeighborQuery::Radius(-1.0),
            NeighborQuery::Hybrid { k: 3, radius: f64::NAN },
        ] {
            assert!(matches!(
                NeighborGraph::build(&cloud, &index, query, &cancel),
                Err(Error::InvalidParameters(_))
            ));
        }
    }

    #[test]
    fn test_cancelled_build() {
        let cloud = line_cloud(100);
        let index = KdTree::build(&cloud);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            NeighborGraph::build(&cloud, &index, NeighborQuery::KNearest(4), &cancel).unwrap_err(),
            Error::Cancelled
        );
    }
}
