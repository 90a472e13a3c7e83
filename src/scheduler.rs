// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use nalgebra::Point3;

use crate::error::{RaytraceError, Result};
use crate::geometry::{bary_inside, barycentric, Float, BARY_TOL};
use crate::graph::{NodeGraph, TertiaryOverlay};
use crate::mesh::TetraMesh;
use crate::raypath::{integrate_slowness, trace_ray, GradientMethod};
use crate::sweep::SweepSolver;

/// Eikonal solver selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Fast Sweeping Method on primary vertices.
    FastSweeping,
    /// Shortest-Path Method on the secondary-node graph.
    ShortestPath,
    /// Shortest-Path Method with tertiary nodes around the source.
    DynamicShortestPath,
}

impl FromStr for Method {
    type Err = RaytraceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fsm" => Ok(Method::FastSweeping),
            "spm" => Ok(Method::ShortestPath),
            "dspm" => Ok(Method::DynamicShortestPath),
            _ => Err(RaytraceError::UnknownMethod(s.to_string())),
        }
    }
}

/// Solver and raytracer options, fixed at construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// Slowness per cell (true) or per vertex (false).
    pub cell_slowness: bool,
    /// Which eikonal solver to run.
    pub method: Method,
    /// Gradient strategy of the backward raytracer.
    pub gradient_method: GradientMethod,
    /// Report receiver traveltimes integrated along the traced ray (SPM/DSPM).
    pub tt_from_rp: bool,
    /// Interpolate velocity instead of slowness inside a cell (vertex fields).
    pub interp_vel: bool,
    /// Fast sweeping convergence tolerance.
    pub eps: Float,
    /// Fast sweeping maximum number of passes.
    pub maxit: usize,
    /// Raytracer termination tolerance.
    pub min_dist: Float,
    /// Secondary nodes per edge (SPM/DSPM).
    pub n_secondary: usize,
    /// Tertiary nodes per edge near the source (DSPM).
    pub n_tertiary: usize,
    /// Radius of the tertiary-node sphere around the source (DSPM).
    pub radius_tertiary: Float,
    /// Worker pool size.
    pub nthreads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cell_slowness: true,
            method: Method::FastSweeping,
            gradient_method: GradientMethod::LeastSquares1,
            tt_from_rp: false,
            interp_vel: false,
            eps: 1e-15,
            maxit: 20,
            min_dist: 1e-5,
            n_secondary: 2,
            n_tertiary: 2,
            radius_tertiary: 1.0,
            nthreads: 1,
        }
    }
}

/// One source row: origin time, position, optional event id.
#[derive(Debug, Clone, Copy)]
pub struct Source {
    /// Event id pairing this row with receiver rows, if any.
    pub event: Option<i64>,
    /// Origin time.
    pub t0: Float,
    /// Source position.
    pub position: Point3<Float>,
}

impl Source {
    /// Source with implicit origin time zero and no event id.
    pub fn at(x: Float, y: Float, z: Float) -> Self {
        Source {
            event: None,
            t0: 0.0,
            position: Point3::new(x, y, z),
        }
    }

    /// Source with an explicit origin time.
    pub fn with_t0(t0: Float, x: Float, y: Float, z: Float) -> Self {
        Source {
            event: None,
            t0,
            position: Point3::new(x, y, z),
        }
    }

    /// Attach an event id.
    pub fn event(mut self, id: i64) -> Self {
        self.event = Some(id);
        self
    }
}

/// One receiver row: position and optional event id.
#[derive(Debug, Clone, Copy)]
pub struct Receiver {
    /// Event id pairing this row with a source row, if any.
    pub event: Option<i64>,
    /// Receiver position.
    pub position: Point3<Float>,
}

impl Receiver {
    /// Receiver with no event id.
    pub fn at(x: Float, y: Float, z: Float) -> Self {
        Receiver {
            event: None,
            position: Point3::new(x, y, z),
        }
    }

    /// Attach an event id.
    pub fn event(mut self, id: i64) -> Self {
        self.event = Some(id);
        self
    }
}

/// Per-call options of `Raytracer::raytrace`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceOptions<'a> {
    /// Install this slowness field before solving.
    pub slowness: Option<&'a [Float]>,
    /// Run sequentially on this worker's scratch.
    pub thread_no: Option<usize>,
    /// Treat all source rows as one compound source.
    pub aggregate_src: bool,
    /// Also return raypaths.
    pub return_rays: bool,
}

/// Result of a `raytrace` call; everything is indexed in receiver input order.
#[derive(Debug)]
pub struct RaytraceOutput {
    /// Traveltime at each receiver row.
    pub traveltimes: Vec<Float>,
    /// Raypath polylines when requested; an empty polyline marks a
    /// per-receiver raytracing failure.
    pub raypaths: Option<Vec<Vec<Point3<Float>>>>,
}

/// A group of source rows solved together and the receiver rows evaluated
/// against the resulting field. Events are the unit of parallelism.
struct Event {
    source_rows: Vec<usize>,
    receiver_rows: Vec<usize>,
}

enum Engine {
    Sweep(SweepSolver),
    Graph(NodeGraph),
}

/// Per-worker mutable scratch; the mesh and engine stay shared read-only.
struct Worker {
    tt_vertices: Vec<Float>,
    tt_nodes: Vec<Float>,
    known: Vec<bool>,
}

/// The public raytracing engine: an immutable mesh index, one solver engine,
/// and per-worker scratch for parallel dispatch of independent events.
pub struct Raytracer {
    mesh: TetraMesh,
    config: Config,
    engine: Engine,
    workers: Vec<Worker>,
    cancel: Arc<AtomicBool>,
}

impl Raytracer {
    /// Build the mesh index and solver for the given configuration.
    ///
    /// # Parameters
    /// - `vertices`: vertex positions (`N` rows)
    /// - `tetrahedra`: four vertex indices per cell, each in `[0, N)`
    /// - `config`: solver selection and options
    ///
    /// # Errors
    /// `InvalidMesh` for structural defects, `IncompatibleOptions` for option
    /// combinations (e.g. `tt_from_rp` with the fast sweeping method), `Other`
    /// for out-of-range tolerances.
    pub fn new(
        vertices: Vec<Point3<Float>>,
        tetrahedra: Vec<[u32; 4]>,
        config: Config,
    ) -> Result<Self> {
        if !config.eps.is_finite() || config.eps <= 0.0 {
            return Err(RaytraceError::Other(format!(
                "eps must be positive and finite, got {}",
                config.eps
            )));
        }
        if !config.min_dist.is_finite() || config.min_dist <= 0.0 {
            return Err(RaytraceError::Other(format!(
                "min_dist must be positive and finite, got {}",
                config.min_dist
            )));
        }
        if config.maxit == 0 {
            return Err(RaytraceError::Other("maxit must be at least 1".to_string()));
        }
        if config.nthreads == 0 {
            return Err(RaytraceError::Other(
                "nthreads must be at least 1".to_string(),
            ));
        }
        if config.tt_from_rp && config.method == Method::FastSweeping {
            return Err(RaytraceError::IncompatibleOptions(
                "tt_from_rp applies to spm/dspm only".to_string(),
            ));
        }

        let mesh = TetraMesh::new(vertices, tetrahedra, config.cell_slowness)?;
        let engine = match config.method {
            Method::FastSweeping => Engine::Sweep(SweepSolver::new(&mesh)),
            Method::ShortestPath | Method::DynamicShortestPath => {
                Engine::Graph(NodeGraph::new(&mesh, config.n_secondary))
            }
        };
        let workers = (0..config.nthreads)
            .map(|_| Worker {
                tt_vertices: vec![Float::INFINITY; mesh.n_vertices()],
                tt_nodes: Vec::new(),
                known: Vec::new(),
            })
            .collect();

        Ok(Raytracer {
            mesh,
            config,
            engine,
            workers,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The mesh index.
    pub fn mesh(&self) -> &TetraMesh {
        &self.mesh
    }

    /// Expected slowness array length.
    pub fn n_params(&self) -> usize {
        self.mesh.n_params()
    }

    /// Install a slowness field; sequenced between dispatches by the
    /// exclusive borrow.
    pub fn set_slowness(&mut self, values: &[Float]) -> Result<()> {
        self.mesh.set_slowness(values)?;
        if let Engine::Graph(g) = &mut self.engine {
            g.refresh_slowness(&self.mesh);
        }
        Ok(())
    }

    /// Shared flag for cooperative cancellation: set it to true from another
    /// thread to abort the running dispatch.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// The last per-vertex traveltime field computed by `worker`.
    ///
    /// # Errors
    /// `ThreadOutOfRange` if `worker` is not below the pool size.
    pub fn traveltime_field(&self, worker: usize) -> Result<&[Float]> {
        if worker >= self.workers.len() {
            return Err(RaytraceError::ThreadOutOfRange {
                thread_no: worker,
                nthreads: self.workers.len(),
            });
        }
        Ok(&self.workers[worker].tt_vertices)
    }

    /// Compute traveltimes (and optionally raypaths) from source rows to
    /// receiver rows.
    ///
    /// Rows are grouped into independent events (by event id, as one compound
    /// source with `aggregate_src`, or pairwise 1:1), validated up front, and
    /// dispatched over the worker pool; results are indexed in receiver input
    /// order.
    ///
    /// # Errors
    /// All input-validation errors (`WrongSize`, `OutOfGrid`,
    /// `IncompatibleOptions`, `ThreadOutOfRange`) abort before any
    /// computation. `Cancelled` reports the number of pending events when the
    /// cancellation flag was raised.
    pub fn raytrace(
        &mut self,
        sources: &[Source],
        receivers: &[Receiver],
        options: &TraceOptions,
    ) -> Result<RaytraceOutput> {
        self.cancel.store(false, Ordering::Release);

        if let Some(values) = options.slowness {
            self.set_slowness(values)?;
        }
        if !self.mesh.has_slowness() {
            return Err(RaytraceError::WrongSize {
                what: "slowness field",
                expected: self.mesh.n_params(),
                got: 0,
            });
        }
        if sources.is_empty() {
            return Err(RaytraceError::Other("source table is empty".to_string()));
        }
        if let Some(thread_no) = options.thread_no {
            if thread_no >= self.config.nthreads {
                return Err(RaytraceError::ThreadOutOfRange {
                    thread_no,
                    nthreads: self.config.nthreads,
                });
            }
        }
        if self.config.method == Method::DynamicShortestPath && options.aggregate_src {
            return Err(RaytraceError::IncompatibleOptions(
                "dspm cannot aggregate sources: tertiary nodes need one source location"
                    .to_string(),
            ));
        }

        for (index, s) in sources.iter().enumerate() {
            if !self.mesh.is_inside(&s.position) {
                return Err(RaytraceError::OutOfGrid {
                    what: "source",
                    index,
                    point: [s.position.x, s.position.y, s.position.z],
                });
            }
        }
        for (index, r) in receivers.iter().enumerate() {
            if !self.mesh.is_inside(&r.position) {
                return Err(RaytraceError::OutOfGrid {
                    what: "receiver",
                    index,
                    point: [r.position.x, r.position.y, r.position.z],
                });
            }
        }

        let events = group_events(sources, receivers, options.aggregate_src)?;
        if self.config.method == Method::DynamicShortestPath {
            for ev in &events {
                let first = sources[ev.source_rows[0]].position;
                if ev.source_rows.iter().any(|&i| sources[i].position != first) {
                    return Err(RaytraceError::IncompatibleOptions(
                        "dspm requires a single source position per event".to_string(),
                    ));
                }
            }
        }

        let mesh = &self.mesh;
        let config = &self.config;
        let engine = &self.engine;
        let cancel: &AtomicBool = &self.cancel;
        let return_rays = options.return_rays;

        let sequential = options.thread_no.is_some()
            || config.nthreads == 1
            || events.len() < config.nthreads;

        let mut block_results: Vec<Result<BlockResult>>;
        if sequential {
            let worker_id = options.thread_no.unwrap_or(0);
            debug!("solving {} events sequentially on worker {}", events.len(), worker_id);
            let worker = &mut self.workers[worker_id];
            block_results = vec![run_block(
                mesh,
                engine,
                config,
                worker,
                &events,
                sources,
                receivers,
                return_rays,
                cancel,
            )];
        } else {
            let nthreads = config.nthreads;
            let blk = events.len().div_ceil(nthreads);
            let chunks: Vec<&[Event]> = events.chunks(blk).collect();
            debug!(
                "dispatching {} events over {} workers ({} per block)",
                events.len(),
                chunks.len(),
                blk
            );
            let mut outs: Vec<Result<BlockResult>> =
                (0..chunks.len()).map(|_| Ok(Vec::new())).collect();
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(nthreads)
                .build()
                .map_err(|e| RaytraceError::Other(e.to_string()))?;
            pool.scope(|scope| {
                for ((worker, chunk), out) in self
                    .workers
                    .iter_mut()
                    .zip(chunks.into_iter())
                    .zip(outs.iter_mut())
                {
                    scope.spawn(move |_| {
                        *out = run_block(
                            mesh,
                            engine,
                            config,
                            worker,
                            chunk,
                            sources,
                            receivers,
                            return_rays,
                            cancel,
                        );
                    });
                }
            });
            block_results = outs;
        }

        // Cancellation discards partial results; other errors propagate first.
        let mut pending = 0usize;
        let mut cancelled = false;
        for res in &block_results {
            match res {
                Err(RaytraceError::Cancelled { pending: p }) => {
                    cancelled = true;
                    pending += p;
                }
                Err(_) => {}
                Ok(_) => {}
            }
        }
        for res in &mut block_results {
            if let Err(e) = res {
                if !matches!(e, RaytraceError::Cancelled { .. }) {
                    return Err(std::mem::replace(e, RaytraceError::Other(String::new())));
                }
            }
        }
        if cancelled {
            return Err(RaytraceError::Cancelled { pending });
        }

        let mut traveltimes = vec![Float::INFINITY; receivers.len()];
        let mut raypaths = if return_rays {
            Some(vec![Vec::new(); receivers.len()])
        } else {
            None
        };
        for res in block_results {
            for (row, tt, ray) in res.unwrap_or_default() {
                traveltimes[row] = tt;
                if let (Some(paths), Some(p)) = (raypaths.as_mut(), ray) {
                    paths[row] = p;
                }
            }
        }

        Ok(RaytraceOutput {
            traveltimes,
            raypaths,
        })
    }
}

/// Group rows into events. With event ids the tables pair 1:1 and rows
/// sharing an id form one event; with `aggregate` everything is one event;
/// otherwise each row is its own event, paired 1:1.
fn group_events(sources: &[Source], receivers: &[Receiver], aggregate: bool) -> Result<Vec<Event>> {
    if sources.iter().any(|s| s.event.is_some()) {
        if sources.iter().any(|s| s.event.is_none()) {
            return Err(RaytraceError::IncompatibleOptions(
                "source table mixes rows with and without event ids".to_string(),
            ));
        }
        if receivers.len() != sources.len() {
            return Err(RaytraceError::WrongSize {
                what: "receiver table",
                expected: sources.len(),
                got: receivers.len(),
            });
        }
        let mut index: HashMap<i64, usize> = HashMap::new();
        let mut events: Vec<Event> = Vec::new();
        for (i, (s, r)) in sources.iter().zip(receivers.iter()).enumerate() {
            let id = s.event.unwrap_or_default();
            if let Some(rid) = r.event {
                if rid != id {
                    return Err(RaytraceError::IncompatibleOptions(format!(
                        "row {}: receiver event id {} does not match source event id {}",
                        i, rid, id
                    )));
                }
            }
            let slot = *index.entry(id).or_insert_with(|| {
                events.push(Event {
                    source_rows: Vec::new(),
                    receiver_rows: Vec::new(),
                });
                events.len() - 1
            });
            events[slot].source_rows.push(i);
            events[slot].receiver_rows.push(i);
        }
        Ok(events)
    } else if aggregate {
        Ok(vec![Event {
            source_rows: (0..sources.len()).collect(),
            receiver_rows: (0..receivers.len()).collect(),
        }])
    } else {
        if receivers.len() != sources.len() {
            return Err(RaytraceError::WrongSize {
                what: "receiver table",
                expected: sources.len(),
                got: receivers.len(),
            });
        }
        Ok((0..sources.len())
            .map(|i| Event {
                source_rows: vec![i],
                receiver_rows: vec![i],
            })
            .collect())
    }
}

type BlockResult = Vec<(usize, Float, Option<Vec<Point3<Float>>>)>;

/// Solve a contiguous block of events on one worker's scratch.
#[allow(clippy::too_many_arguments)]
fn run_block(
    mesh: &TetraMesh,
    engine: &Engine,
    config: &Config,
    worker: &mut Worker,
    events: &[Event],
    sources: &[Source],
    receivers: &[Receiver],
    return_rays: bool,
    stop: &AtomicBool,
) -> Result<BlockResult> {
    let mut results = Vec::new();
    for (done, ev) in events.iter().enumerate() {
        if stop.load(Ordering::Acquire) {
            return Err(RaytraceError::Cancelled {
                pending: events.len() - done,
            });
        }
        match solve_event(
            mesh,
            engine,
            config,
            worker,
            ev,
            sources,
            receivers,
            return_rays,
            stop,
        ) {
            Ok(mut r) => results.append(&mut r),
            Err(RaytraceError::Cancelled { .. }) => {
                return Err(RaytraceError::Cancelled {
                    pending: events.len() - done,
                });
            }
            Err(e) => return Err(e),
        }
    }
    Ok(results)
}

/// Solve one event and evaluate its receivers.
#[allow(clippy::too_many_arguments)]
fn solve_event(
    mesh: &TetraMesh,
    engine: &Engine,
    config: &Config,
    worker: &mut Worker,
    ev: &Event,
    sources: &[Source],
    receivers: &[Receiver],
    return_rays: bool,
    stop: &AtomicBool,
) -> Result<BlockResult> {
    let src_pts: Vec<(Point3<Float>, Float)> = ev
        .source_rows
        .iter()
        .map(|&i| (sources[i].position, sources[i].t0))
        .collect();

    let overlay = match engine {
        Engine::Sweep(solver) => {
            let report = solver.solve(
                mesh,
                &src_pts,
                config.eps,
                config.maxit,
                config.interp_vel,
                stop,
                &mut worker.tt_vertices,
            )?;
            if !report.converged {
                warn!(
                    "{}",
                    RaytraceError::ConvergenceFailure {
                        passes: report.passes,
                        residual: report.residual,
                    }
                );
            }
            None
        }
        Engine::Graph(graph) => {
            let overlay = if config.method == Method::DynamicShortestPath {
                Some(TertiaryOverlay::build(
                    mesh,
                    graph,
                    &src_pts[0].0,
                    config.n_tertiary,
                    config.radius_tertiary,
                ))
            } else {
                None
            };
            graph.solve(
                mesh,
                overlay.as_ref(),
                &src_pts,
                stop,
                &mut worker.tt_nodes,
                &mut worker.known,
            )?;
            worker
                .tt_vertices
                .copy_from_slice(&worker.tt_nodes[..mesh.n_vertices()]);
            overlay
        }
    };

    let mut out = Vec::with_capacity(ev.receiver_rows.len());
    for &row in &ev.receiver_rows {
        let rcv = &receivers[row].position;
        let mut tt = match engine {
            Engine::Sweep(_) => {
                fsm_traveltime_at(mesh, &worker.tt_vertices, &src_pts, rcv, config.interp_vel)
            }
            Engine::Graph(graph) => {
                graph.traveltime_at(mesh, overlay.as_ref(), &worker.tt_nodes, &src_pts, rcv)
            }
        }
        .ok_or(RaytraceError::OutOfGrid {
            what: "receiver",
            index: row,
            point: [rcv.x, rcv.y, rcv.z],
        })?;

        let need_ray = return_rays || config.tt_from_rp;
        let mut ray = None;
        if need_ray {
            match trace_ray(
                mesh,
                &worker.tt_vertices,
                &src_pts,
                rcv,
                config.gradient_method,
                config.min_dist,
                row,
            ) {
                Ok(path) => {
                    if config.tt_from_rp {
                        let end = path[path.len() - 1];
                        let t0 = src_pts
                            .iter()
                            .min_by(|a, b| {
                                let da = (a.0 - end).norm();
                                let db = (b.0 - end).norm();
                                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                            })
                            .map(|&(_, t0)| t0)
                            .unwrap_or(0.0);
                        tt = t0 + integrate_slowness(mesh, &path);
                    }
                    ray = Some(path);
                }
                Err(e) => {
                    // Per-receiver failure: empty raypath, traveltime kept
                    warn!("{}", e);
                    ray = Some(Vec::new());
                }
            }
        }

        out.push((row, tt, if return_rays { ray } else { None }));
    }
    Ok(out)
}

/// Receiver traveltime on a fast-sweeping field: minimum over the corners of
/// the containing cell of `T + s·dist`, with a direct-source shortcut.
fn fsm_traveltime_at(
    mesh: &TetraMesh,
    tt: &[Float],
    sources: &[(Point3<Float>, Float)],
    rcv: &Point3<Float>,
    interp_vel: bool,
) -> Option<Float> {
    let cell = mesh.locate(rcv)?;
    let s = mesh.cell_slowness_effective(cell, interp_vel);
    let mut best = Float::INFINITY;
    for v in mesh.tet(cell) {
        let cand = tt[v as usize] + s * (mesh.vertex(v) - rcv).norm();
        if cand < best {
            best = cand;
        }
    }
    let [a, b, c, d] = mesh.tet_points(cell);
    for (spos, t0) in sources {
        if let Some(l) = barycentric(spos, &a, &b, &c, &d) {
            if bary_inside(&l, BARY_TOL) {
                let cand = t0 + s * (rcv - spos).norm();
                if cand < best {
                    best = cand;
                }
            }
        }
    }
    Some(best)
}
