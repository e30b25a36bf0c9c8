//! Normal Estimation Demo
//!
//! Estimates and orients normals on a noisy sphere with a few neighbor
//! queries and reports how many end up pointing outward.

use anyhow::Result;
use cloudmesh_algorithms::{
    estimate_normals, orient_normals, KdTree, NeighborGraph, NeighborQuery, OrientationFlag,
};
use cloudmesh_core::{CancellationToken, Point3d, PointCloud, Vector3d};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Instant;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cloud = noisy_sphere(4000, 0.005, 7);
    println!("Sampled {} points on a unit sphere", cloud.len());

    let cancel = CancellationToken::new();
    let index = KdTree::build(&cloud);

    let queries = [
        NeighborQuery::KNearest(10),
        NeighborQuery::KNearest(30),
        NeighborQuery::Radius(0.15),
        NeighborQuery::Hybrid { k: 20, radius: 0.1 },
    ];

    for query in queries {
        let start = Instant::now();
        let graph = NeighborGraph::build(&cloud, &index, query, &cancel)?;
        let unoriented = estimate_normals(&cloud, &graph, &cancel)?;
        let oriented = orient_normals(&cloud, &graph, &unoriented, &cancel)?;
        let elapsed = start.elapsed();

        let within_10_degrees = (0..cloud.len())
            .filter(|&i| {
                let outward = cloud.position(i).coords.normalize();
                oriented.normal(i).dot(&outward) >= 10f64.to_radians().cos()
            })
            .count();
        let arbitrary = oriented
            .flags()
            .iter()
            .filter(|&&f| f == OrientationFlag::Arbitrary)
            .count();

        println!("\n{:?} ({:?})", query, elapsed);
        println!("  defined normals:   {}", unoriented.valid_count());
        println!(
            "  within 10 degrees: {:.1}%",
            100.0 * within_10_degrees as f64 / cloud.len() as f64
        );
        println!("  arbitrary signs:   {}", arbitrary);
    }

    Ok(())
}

fn noisy_sphere(n: usize, noise: f64, seed: u64) -> PointCloud {
    let mut rng = StdRng::seed_from_u64(seed);
    PointCloud::from_positions((0..n).map(|_| {
        let dir = loop {
            let v = Vector3d::new(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            );
            let len = v.norm();
            if len > 1e-3 && len <= 1.0 {
                break v / len;
            }
        };
        let r = 1.0 + rng.gen_range(-noise..noise);
        Point3d::from(dir * r)
    }))
}
