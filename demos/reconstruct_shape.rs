//! Reconstruct Shape Demo
//!
//! Samples a synthetic shape, reconstructs it with the chosen method and
//! prints the resulting mesh topology.
//!
//! ```text
//! cargo run -p cloudmesh-demos --bin reconstruct_shape -- --shape torus --method poisson -v
//! ```

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use cloudmesh_core::{Point, PointCloud, Progress, TriangleMesh, Vector3d};
use cloudmesh_reconstruction::{
    reconstruct_all, reconstruct_with_progress, BallRadius, ReconstructionMethod,
    ReconstructionParams,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::TAU;
use std::time::Instant;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Reconstruct a triangle mesh from a sampled synthetic shape
#[derive(Parser)]
#[command(name = "reconstruct_shape")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Shape to sample
    #[arg(long, default_value = "sphere")]
    shape: Shape,

    /// Reconstruction method
    #[arg(long, default_value = "poisson")]
    method: MethodArg,

    /// Number of sampled points
    #[arg(long, short = 'n', default_value_t = 5000)]
    points: usize,

    /// Positional noise as a fraction of the shape size
    #[arg(long, default_value_t = 0.0)]
    noise: f64,

    /// Seed for sampling and noise
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Neighbors used for normal estimation
    #[arg(long, short = 'k', default_value_t = 30)]
    neighbors: usize,

    /// Octree depth for Poisson reconstruction
    #[arg(long, default_value_t = 7)]
    depth: u32,

    /// Drop Poisson faces whose density falls below this quantile
    #[arg(long, default_value_t = 0.0)]
    density_threshold: f64,

    /// Ball radii for ball pivoting; estimated from point spacing when omitted
    #[arg(long, value_delimiter = ',')]
    radii: Vec<f64>,

    /// Use the analytic normals of the shape instead of estimating them
    #[arg(long)]
    exact_normals: bool,

    /// Increase output verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, ValueEnum)]
enum Shape {
    Sphere,
    Plane,
    Torus,
}

#[derive(Clone, Copy, ValueEnum)]
enum MethodArg {
    Poisson,
    BallPivoting,
    /// Run both methods on the same normals
    Both,
}

fn init_tracing(verbose: u8) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match verbose {
            0 => "warn",
            1 => "cloudmesh_reconstruction=info,cloudmesh_algorithms=info",
            2 => "cloudmesh_reconstruction=debug,cloudmesh_algorithms=debug",
            _ => "trace",
        };
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(filter)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cloud = sample_shape(cli.shape, cli.points, cli.noise, cli.seed, cli.exact_normals);
    println!("Sampled {} points", cloud.len());

    let mut params = ReconstructionParams::default()
        .with_neighbor_count(cli.neighbors)
        .with_poisson_depth(cli.depth)
        .with_density_threshold(cli.density_threshold)
        .with_reuse_input_normals(cli.exact_normals);
    if !cli.radii.is_empty() {
        params = params.with_ball_radius(BallRadius::Radii(cli.radii.clone()));
    }

    let method = match cli.method {
        MethodArg::Poisson => ReconstructionMethod::Poisson,
        MethodArg::BallPivoting => ReconstructionMethod::BallPivoting,
        MethodArg::Both => {
            let comparison = reconstruct_all(&cloud, &params).context("reconstruction failed")?;
            print_mesh("poisson", &comparison.poisson, comparison.poisson_time);
            print_mesh(
                "ball-pivoting",
                &comparison.ball_pivoting,
                comparison.ball_pivoting_time,
            );
            return Ok(());
        }
    };

    let report = |progress: &Progress| {
        println!("[{:>3}%] {} ({:?})", progress.percent(), progress.stage, progress.elapsed);
        true
    };
    let start = Instant::now();
    let mesh = reconstruct_with_progress(&cloud, method, &params, &report)
        .with_context(|| format!("{} reconstruction failed", method))?;
    print_mesh(&method.to_string(), &mesh, start.elapsed());
    Ok(())
}

fn print_mesh(label: &str, mesh: &TriangleMesh, elapsed: std::time::Duration) {
    let topology = mesh.topology();
    println!("\n{} ({:?})", label, elapsed);
    println!("  vertices:            {}", topology.vertices);
    println!("  faces:               {}", topology.faces);
    println!("  edges:               {}", topology.edges);
    println!("  boundary edges:      {}", topology.boundary_edges);
    println!("  non-manifold edges:  {}", topology.non_manifold_edges);
    println!("  euler characteristic {}", topology.euler_characteristic());
    println!("  watertight:          {}", topology.is_watertight());
    println!("  surface area:        {:.4}", mesh.surface_area());
}

fn sample_shape(shape: Shape, n: usize, noise: f64, seed: u64, with_normals: bool) -> PointCloud {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut points = Vec::with_capacity(n);

    for i in 0..n {
        let (position, normal) = match shape {
            Shape::Sphere => {
                let golden_angle = std::f64::consts::PI * (3.0 - 5.0f64.sqrt());
                let y = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
                let r = (1.0 - y * y).sqrt();
                let theta = golden_angle * i as f64;
                let dir = Vector3d::new(r * theta.cos(), y, r * theta.sin());
                (dir, dir)
            }
            Shape::Plane => {
                let side = (n as f64).sqrt().ceil() as usize;
                let x = (i % side) as f64 / side as f64 * 2.0 - 1.0;
                let y = (i / side) as f64 / side as f64 * 2.0 - 1.0;
                (Vector3d::new(x, y, 0.0), Vector3d::z())
            }
            Shape::Torus => {
                let (major, minor) = (1.0, 0.35);
                let u = rng.gen_range(0.0..TAU);
                let v = rng.gen_range(0.0..TAU);
                let ring = Vector3d::new(u.cos(), u.sin(), 0.0);
                let normal = ring * v.cos() + Vector3d::z() * v.sin();
                (ring * major + normal * minor, normal)
            }
        };

        let jitter = if noise > 0.0 {
            Vector3d::new(
                rng.gen_range(-noise..noise),
                rng.gen_range(-noise..noise),
                rng.gen_range(-noise..noise),
            )
        } else {
            Vector3d::zeros()
        };

        let point = Point::new(
            position.x + jitter.x,
            position.y + jitter.y,
            position.z + jitter.z,
        );
        points.push(if with_normals { point.with_normal(normal) } else { point });
    }

    PointCloud::from_points(points)
}
