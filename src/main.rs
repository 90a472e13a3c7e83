// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use nalgebra::Point3;

use tetray::io;
use tetray::{Config, Float, GradientMethod, Method, Raytracer, TetraMesh, TraceOptions};

#[derive(Parser)]
#[command(name = "tetray", about = "Traveltime raytracing on tetrahedral meshes")]
struct Cli {
    /// Vertex array file (.npy, N x 3)
    #[arg(long)]
    vertices: Option<PathBuf>,

    /// Tetrahedron index array file (.npy, M x 4)
    #[arg(long)]
    tets: Option<PathBuf>,

    /// Generate a structured box mesh instead: cells per axis, comma-separated
    #[arg(long, conflicts_with_all = ["vertices", "tets"])]
    box_size: Option<String>,

    /// Cell edge length of the generated box mesh
    #[arg(long, default_value = "1.0")]
    spacing: Float,

    /// Slowness field: "uniform:<val>" or "file:<path>" (.npy)
    #[arg(long, default_value = "uniform:1.0")]
    slowness: String,

    /// Slowness values at vertices instead of cells
    #[arg(long)]
    vertex_slowness: bool,

    /// Source table (.npy/.dat: x y z | t0 x y z | event t0 x y z)
    #[arg(long)]
    src: PathBuf,

    /// Receiver table (.npy/.dat: x y z | event x y z)
    #[arg(long)]
    rcv: PathBuf,

    /// Solver: fsm, spm or dspm
    #[arg(short = 'm', long, default_value = "fsm")]
    method: String,

    /// Raytracer gradient strategy: 0 = linear, 1 = quadratic, 2 = averaging
    #[arg(long, default_value = "0")]
    gradient_method: usize,

    /// Fast sweeping convergence tolerance
    #[arg(long, default_value = "1e-15")]
    eps: Float,

    /// Fast sweeping maximum passes
    #[arg(long, default_value = "20")]
    maxit: usize,

    /// Raytracer termination tolerance
    #[arg(long, default_value = "1e-5")]
    min_dist: Float,

    /// Secondary nodes per edge (spm/dspm)
    #[arg(long, default_value = "2")]
    n_secondary: usize,

    /// Tertiary nodes per edge near the source (dspm)
    #[arg(long, default_value = "2")]
    n_tertiary: usize,

    /// Radius of the tertiary-node sphere around the source (dspm)
    #[arg(long, default_value = "1.0")]
    radius_tertiary: Float,

    /// Interpolate velocity instead of slowness (vertex slowness)
    #[arg(long)]
    interp_vel: bool,

    /// Report traveltimes integrated along the traced rays (spm/dspm)
    #[arg(long)]
    tt_from_rp: bool,

    /// Treat all source rows as one compound source
    #[arg(long)]
    aggregate_src: bool,

    /// Worker pool size; sized from the host and the shot count if omitted
    #[arg(long)]
    threads: Option<usize>,

    /// Traveltime output file (.npy or .dat)
    #[arg(short = 'o', long, default_value = "traveltimes.npy")]
    output: PathBuf,

    /// Also trace raypaths and save them as VTK polylines
    #[arg(long)]
    rays: Option<PathBuf>,

    /// Save the per-vertex traveltime field of worker 0 (.npy or .dat)
    #[arg(long)]
    save_grid_tt: Option<PathBuf>,
}

fn parse_box(s: &str) -> Result<[usize; 3]> {
    let parts: Vec<usize> = s
        .split(',')
        .map(|p| p.trim().parse::<usize>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("invalid --box-size: expected comma-separated integers")?;
    if parts.len() != 3 {
        bail!("--box-size has {} components, expected 3", parts.len());
    }
    Ok([parts[0], parts[1], parts[2]])
}

fn load_model(cli: &Cli) -> Result<(Vec<Point3<Float>>, Vec<[u32; 4]>)> {
    if let Some(box_size) = &cli.box_size {
        let n = parse_box(box_size)?;
        if cli.spacing <= 0.0 || !cli.spacing.is_finite() {
            bail!("--spacing must be positive and finite, got {}", cli.spacing);
        }
        return Ok(TetraMesh::structured(n, cli.spacing));
    }
    match (&cli.vertices, &cli.tets) {
        (Some(v), Some(t)) => {
            let vertices = io::load_vertices(v).map_err(|e| anyhow::anyhow!("{}", e))?;
            let tets = io::load_tetrahedra(t).map_err(|e| anyhow::anyhow!("{}", e))?;
            Ok((vertices, tets))
        }
        _ => bail!("either --box-size or both --vertices and --tets are required"),
    }
}

fn build_slowness(mode: &str, n_params: usize) -> Result<Vec<Float>> {
    if let Some(val_str) = mode.strip_prefix("uniform:") {
        let val: Float = val_str.parse().context("invalid uniform slowness value")?;
        if !val.is_finite() || val <= 0.0 {
            bail!("uniform slowness must be positive and finite, got {}", val);
        }
        return Ok(vec![val; n_params]);
    }
    if let Some(path) = mode.strip_prefix("file:") {
        return io::load_slowness(Path::new(path)).map_err(|e| anyhow::anyhow!("{}", e));
    }
    bail!(
        "unknown --slowness mode: '{}'. Expected 'uniform:<val>' or 'file:<path>'",
        mode
    );
}

/// Pool size when --threads is omitted: the host parallelism, capped so each
/// worker gets a minimum number of shots.
fn default_threads(n_shots: usize) -> usize {
    let hardware = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    let min_per_thread = 5;
    let max_threads = n_shots.div_ceil(min_per_thread).max(1);
    hardware.min(max_threads)
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let method: Method = cli.method.parse().map_err(|e| anyhow::anyhow!("{}", e))?;
    let gradient_method =
        GradientMethod::from_index(cli.gradient_method).map_err(|e| anyhow::anyhow!("{}", e))?;

    let sources = io::load_sources(&cli.src).map_err(|e| anyhow::anyhow!("{}", e))?;
    let receivers = io::load_receivers(&cli.rcv).map_err(|e| anyhow::anyhow!("{}", e))?;
    if sources.is_empty() {
        bail!("source table {} is empty", cli.src.display());
    }

    let nthreads = cli.threads.unwrap_or_else(|| default_threads(sources.len()));
    let (vertices, tets) = load_model(&cli)?;

    let config = Config {
        cell_slowness: !cli.vertex_slowness,
        method,
        gradient_method,
        tt_from_rp: cli.tt_from_rp,
        interp_vel: cli.interp_vel,
        eps: cli.eps,
        maxit: cli.maxit,
        min_dist: cli.min_dist,
        n_secondary: cli.n_secondary,
        n_tertiary: cli.n_tertiary,
        radius_tertiary: cli.radius_tertiary,
        nthreads,
    };

    let mut tracer =
        Raytracer::new(vertices, tets, config).map_err(|e| anyhow::anyhow!("{}", e))?;
    let slowness = build_slowness(&cli.slowness, tracer.n_params())?;

    let options = TraceOptions {
        slowness: Some(&slowness),
        thread_no: None,
        aggregate_src: cli.aggregate_src,
        return_rays: cli.rays.is_some(),
    };
    let output = tracer
        .raytrace(&sources, &receivers, &options)
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    io::save_traveltimes(&cli.output, &output.traveltimes)
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    if let (Some(path), Some(rays)) = (&cli.rays, &output.raypaths) {
        io::save_raypaths(path, rays).map_err(|e| anyhow::anyhow!("{}", e))?;
    }

    if let Some(path) = &cli.save_grid_tt {
        let field = tracer
            .traveltime_field(0)
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        io::save_traveltimes(path, field).map_err(|e| anyhow::anyhow!("{}", e))?;
    }

    Ok(())
}
