//! Integration tests for cloudmesh-reconstruction
//!
//! These tests run the full pipeline, from raw points to a post-processed
//! mesh, and check the properties every reconstruction must keep.

use cloudmesh_core::{CancellationToken, Error, Point, Point3d, PointCloud, TriangleMesh, Vector3d};
use cloudmesh_reconstruction::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::thread;
use std::time::{Duration, Instant};

/// Evenly spread points on a sphere around the origin, normals pointing out
fn create_sphere_with_normals(radius: f64, num_points: usize) -> PointCloud {
    let golden_angle = std::f64::consts::PI * (3.0 - 5.0f64.sqrt());
    let points = (0..num_points)
        .map(|i| {
            let y = 1.0 - 2.0 * (i as f64 + 0.5) / num_points as f64;
            let r = (1.0 - y * y).sqrt();
            let theta = golden_angle * i as f64;
            let dir = Vector3d::new(r * theta.cos(), y, r * theta.sin());
            Point::from_position(Point3d::from(dir * radius)).with_normal(dir)
        })
        .collect();
    PointCloud::from_points(points)
}

/// Same sphere without normals, positions jittered along the surface
fn create_sphere_point_cloud(radius: f64, num_points: usize, seed: u64) -> PointCloud {
    let mut rng = StdRng::seed_from_u64(seed);
    let positions: Vec<Point3d> = create_sphere_with_normals(1.0, num_points)
        .iter()
        .map(|p| {
            let jitter = Vector3d::new(
                rng.gen_range(-0.01..0.01),
                rng.gen_range(-0.01..0.01),
                rng.gen_range(-0.01..0.01),
            );
            Point3d::from((p.position.coords + jitter).normalize() * radius)
        })
        .collect();
    PointCloud::from_positions(positions)
}

/// Square grid in the z = 0 plane
fn create_grid(n: usize, spacing: f64) -> PointCloud {
    PointCloud::from_positions(
        (0..n).flat_map(|y| (0..n).map(move |x| Point3d::new(x as f64 * spacing, y as f64 * spacing, 0.0))),
    )
}

fn assert_clean(mesh: &TriangleMesh) {
    assert!(mesh.validate().is_ok());
    assert!(mesh.faces.iter().flatten().all(|&i| i < mesh.vertex_count()));
    assert!(mesh.referenced_vertices().iter().all(|&r| r), "mesh has unreferenced vertices");
}

fn angle_degrees(a: &Vector3d, b: &Vector3d) -> f64 {
    a.normalize().dot(&b.normalize()).clamp(-1.0, 1.0).acos().to_degrees()
}

#[test]
fn test_both_methods_produce_clean_meshes() {
    let cloud = create_sphere_point_cloud(1.0, 1500, 7);
    let params = ReconstructionParams::default().with_neighbor_count(16).with_poisson_depth(5);

    for method in [ReconstructionMethod::Poisson, ReconstructionMethod::BallPivoting] {
        let mesh = reconstruct(&cloud, method, &params).unwrap();
        assert!(!mesh.is_empty(), "{} produced no faces", method);
        assert_clean(&mesh);
        assert_eq!(mesh.normals.as_ref().map(Vec::len), Some(mesh.vertex_count()));
    }
}

#[test]
fn test_sphere_orientation_points_outward() {
    let cloud = create_sphere_point_cloud(2.0, 2000, 11);
    let params = ReconstructionParams::default().with_neighbor_count(15);
    let prepared = PreparedCloud::prepare(&cloud, &params).unwrap();
    let normals = prepared.normals();

    let outward = (0..cloud.len())
        .filter(|&i| angle_degrees(&normals.normal(i), &cloud.position(i).coords) <= 10.0)
        .count();
    assert!(
        outward as f64 >= 0.95 * cloud.len() as f64,
        "only {} of {} normals point outward",
        outward,
        cloud.len()
    );
}

#[test]
fn test_ball_pivoting_covers_flat_grid() {
    let spacing = 0.5;
    let cloud = create_grid(15, spacing);
    let params = ReconstructionParams::default()
        .with_neighbor_count(8)
        .with_ball_radius(BallRadius::Fixed(spacing * 2.0f64.sqrt() * 1.05));

    let mesh = reconstruct(&cloud, ReconstructionMethod::BallPivoting, &params).unwrap();
    assert_clean(&mesh);
    assert_eq!(mesh.vertex_count(), cloud.len());
    assert!(mesh.faces.iter().all(|f| mesh.triangle_area(f) > 1e-9));
    assert_eq!(mesh.topology().non_manifold_edges, 0);
}

#[test]
fn test_poisson_sphere_is_genus_zero() {
    let cloud = create_sphere_with_normals(1.0, 3000);
    let params = ReconstructionParams::default().with_poisson_depth(6);

    let mesh = reconstruct(&cloud, ReconstructionMethod::Poisson, &params).unwrap();
    assert_clean(&mesh);
    let topology = mesh.topology();
    assert!(topology.is_watertight());
    assert_eq!(topology.euler_characteristic(), 2);
}

#[test]
fn test_poisson_with_estimated_normals_is_closed() {
    let cloud = create_sphere_point_cloud(1.0, 3000, 3);
    let params = ReconstructionParams::default().with_neighbor_count(20).with_poisson_depth(6);

    let mesh = reconstruct(&cloud, ReconstructionMethod::Poisson, &params).unwrap();
    assert_clean(&mesh);
    assert!(mesh.topology().is_watertight());
}

#[test]
fn test_density_threshold_trims_faces() {
    let cloud = create_sphere_with_normals(1.0, 2000);
    let base = ReconstructionParams::default().with_poisson_depth(5);

    let full = reconstruct(&cloud, ReconstructionMethod::Poisson, &base).unwrap();
    let trimmed = reconstruct(
        &cloud,
        ReconstructionMethod::Poisson,
        &base.clone().with_density_threshold(0.3),
    )
    .unwrap();
    assert_clean(&trimmed);
    assert!(trimmed.face_count() < full.face_count());
    assert!(trimmed.densities.is_some());
}

#[test]
fn test_reconstruction_is_deterministic() {
    let cloud = create_sphere_point_cloud(1.0, 1200, 5);
    let params = ReconstructionParams::default().with_neighbor_count(12).with_poisson_depth(5);

    for method in [ReconstructionMethod::Poisson, ReconstructionMethod::BallPivoting] {
        let first = reconstruct(&cloud, method, &params).unwrap();
        let second = reconstruct(&cloud, method, &params).unwrap();
        assert_eq!(first.vertices, second.vertices, "{} vertices differ", method);
        assert_eq!(first.faces, second.faces, "{} faces differ", method);
    }
}

#[test]
fn test_cancellation_mid_run() {
    let cloud = create_sphere_point_cloud(1.0, 100_000, 1);
    let token = CancellationToken::new();
    let params = ReconstructionParams::default().with_cancellation_token(token.clone());

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        Instant::now()
    });
    let result = reconstruct(&cloud, ReconstructionMethod::Poisson, &params);
    let finished = Instant::now();
    let cancelled_at = canceller.join().unwrap();

    assert_eq!(result.unwrap_err(), Error::Cancelled);
    assert!(finished.saturating_duration_since(cancelled_at) < Duration::from_secs(10));
}

#[test]
fn test_ball_pivoting_cancellation_mid_run() {
    // Input normals skip estimation; the pivoting passes run far longer than the delay.
    let cloud = create_sphere_with_normals(1.0, 200_000);
    let token = CancellationToken::new();
    let params = ReconstructionParams::default().with_cancellation_token(token.clone());

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        token.cancel();
        Instant::now()
    });
    let result = reconstruct(&cloud, ReconstructionMethod::BallPivoting, &params);
    let finished = Instant::now();
    let cancelled_at = canceller.join().unwrap();

    assert_eq!(result.unwrap_err(), Error::Cancelled);
    assert!(finished.saturating_duration_since(cancelled_at) < Duration::from_secs(10));
}

#[test]
fn test_poisson_depth_nine_stays_sparse() {
    // A dense lattice at the requested depth would need several gigabytes.
    let cloud = create_sphere_with_normals(1.0, 15_000);
    let params = ReconstructionParams::default()
        .with_poisson_depth(9)
        .with_memory_budget(512 << 20);

    let mesh = reconstruct(&cloud, ReconstructionMethod::Poisson, &params).unwrap();
    assert_clean(&mesh);
    assert!(mesh.topology().is_watertight());
}

#[test]
fn test_cancelled_before_start() {
    let cloud = create_sphere_with_normals(1.0, 500);
    let params = ReconstructionParams::default();
    params.cancellation_token.cancel();
    for method in [ReconstructionMethod::Poisson, ReconstructionMethod::BallPivoting] {
        assert_eq!(reconstruct(&cloud, method, &params).unwrap_err(), Error::Cancelled);
    }
}

#[test]
fn test_empty_and_coincident_clouds_are_rejected() {
    let params = ReconstructionParams::default();
    let empty = PointCloud::new();
    let coincident = PointCloud::from_positions(vec![Point3d::new(0.5, -1.0, 2.0); 500]);

    for cloud in [&empty, &coincident] {
        for method in [ReconstructionMethod::Poisson, ReconstructionMethod::BallPivoting] {
            let err = reconstruct(cloud, method, &params).unwrap_err();
            assert!(
                matches!(err, Error::InsufficientData(_) | Error::DegenerateGeometry(_)),
                "unexpected error {:?}",
                err
            );
        }
    }
}

#[test]
fn test_excessive_depth_exhausts_budget() {
    let cloud = create_sphere_with_normals(1.0, 5000);
    let params = ReconstructionParams::default()
        .with_poisson_depth(9)
        .with_memory_budget(1024 * 1024);
    let err = reconstruct(&cloud, ReconstructionMethod::Poisson, &params).unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted(_)));
}

#[test]
fn test_colors_follow_the_points() {
    let points: Vec<Point> = create_sphere_with_normals(1.0, 1500)
        .iter()
        .map(|p| {
            let color = if p.position.z > 0.0 { [255, 0, 0] } else { [0, 0, 255] };
            p.with_color(color)
        })
        .collect();
    let cloud = PointCloud::from_points(points);
    let params = ReconstructionParams::default().with_poisson_depth(5);

    let mesh = reconstruct(&cloud, ReconstructionMethod::Poisson, &params).unwrap();
    let colors = mesh.colors.as_ref().unwrap();
    for (v, color) in mesh.vertices.iter().zip(colors) {
        if v.z > 0.2 {
            assert_eq!(*color, [255, 0, 0]);
        } else if v.z < -0.2 {
            assert_eq!(*color, [0, 0, 255]);
        }
    }
}

#[test]
fn test_reconstruct_all_shares_normals() {
    let cloud = create_sphere_point_cloud(1.0, 1200, 9);
    let params = ReconstructionParams::default().with_neighbor_count(12).with_poisson_depth(5);

    let comparison = reconstruct_all(&cloud, &params).unwrap();
    assert_clean(comparison.mesh(ReconstructionMethod::Poisson));
    assert_clean(comparison.mesh(ReconstructionMethod::BallPivoting));
    assert!(comparison.poisson.topology().is_watertight());
    assert!(comparison.ball_pivoting.vertex_count() <= cloud.len());
}

#[test]
fn test_prepared_cloud_runs_both_methods() {
    let cloud = create_sphere_with_normals(1.0, 1000);
    let params = ReconstructionParams::default().with_poisson_depth(5);
    let prepared = PreparedCloud::prepare(&cloud, &params).unwrap();

    let bpa = prepared.reconstruct(ReconstructionMethod::BallPivoting, &params).unwrap();
    let direct = reconstruct(&cloud, ReconstructionMethod::BallPivoting, &params).unwrap();
    assert_eq!(bpa, direct);
}
