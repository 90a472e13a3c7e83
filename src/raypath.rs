// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use nalgebra::{DMatrix, DVector, Matrix3, Point3, Vector3};

use crate::error::{RaytraceError, Result};
use crate::geometry::{bary_inside, barycentric, ray_triangle, Float, BARY_TOL};
use crate::mesh::{TetraMesh, TET_FACES};

/// Strategy for estimating the traveltime gradient inside a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradientMethod {
    /// Exact linear fit through the four corner traveltimes.
    LeastSquares1,
    /// Quadratic least-squares fit over the first ring of vertices.
    LeastSquares2,
    /// Barycentric average of per-vertex least-squares gradients.
    Averaging,
}

impl GradientMethod {
    /// Map the numeric option value (0, 1, 2) to a strategy.
    pub fn from_index(i: usize) -> Result<Self> {
        match i {
            0 => Ok(GradientMethod::LeastSquares1),
            1 => Ok(GradientMethod::LeastSquares2),
            2 => Ok(GradientMethod::Averaging),
            _ => Err(RaytraceError::Other(format!(
                "gradient_method must be 0, 1 or 2, got {}",
                i
            ))),
        }
    }
}

const GRAD_EPS: Float = 1e-12;
const MAX_NUDGES: usize = 10;

/// Linear fit through the four corner traveltimes of a cell; exact for a
/// linear field. `None` when a corner is unreached or the cell is degenerate.
fn grad_cell_linear(mesh: &TetraMesh, tt: &[Float], cell: u32) -> Option<Vector3<Float>> {
    let tet = mesh.tet(cell);
    let t: Vec<Float> = tet.iter().map(|&v| tt[v as usize]).collect();
    if t.iter().any(|x| !x.is_finite()) {
        return None;
    }
    let p: Vec<&Point3<Float>> = tet.iter().map(|&v| mesh.vertex(v)).collect();
    let r1 = p[1] - p[0];
    let r2 = p[2] - p[0];
    let r3 = p[3] - p[0];
    let m = Matrix3::new(r1.x, r1.y, r1.z, r2.x, r2.y, r2.z, r3.x, r3.y, r3.z);
    let rhs = Vector3::new(t[1] - t[0], t[2] - t[0], t[3] - t[0]);
    m.lu().solve(&rhs)
}

/// First ring of vertices around a cell: the cell's corners plus every vertex
/// of every cell incident to one of them.
fn first_ring(mesh: &TetraMesh, cell: u32) -> Vec<u32> {
    let mut ring: Vec<u32> = mesh.tet(cell).to_vec();
    for &v in &mesh.tet(cell) {
        for &c in mesh.cells_of_vertex(v) {
            ring.extend_from_slice(&mesh.tet(c));
        }
    }
    ring.sort_unstable();
    ring.dedup();
    ring
}

/// Quadratic least-squares fit over the first ring, evaluated at `p`. Falls
/// back to the linear cell fit when fewer than 10 usable samples exist or the
/// system is rank deficient.
fn grad_quadratic(
    mesh: &TetraMesh,
    tt: &[Float],
    cell: u32,
    p: &Point3<Float>,
) -> Option<Vector3<Float>> {
    let ring: Vec<u32> = first_ring(mesh, cell)
        .into_iter()
        .filter(|&v| tt[v as usize].is_finite())
        .collect();
    if ring.len() < 10 {
        return grad_cell_linear(mesh, tt, cell);
    }

    let n = ring.len();
    let mut a = DMatrix::zeros(n, 10);
    let mut b = DVector::zeros(n);
    for (row, &v) in ring.iter().enumerate() {
        let d = mesh.vertex(v) - p;
        a[(row, 0)] = 1.0;
        a[(row, 1)] = d.x;
        a[(row, 2)] = d.y;
        a[(row, 3)] = d.z;
        a[(row, 4)] = d.x * d.x;
        a[(row, 5)] = d.y * d.y;
        a[(row, 6)] = d.z * d.z;
        a[(row, 7)] = d.x * d.y;
        a[(row, 8)] = d.x * d.z;
        a[(row, 9)] = d.y * d.z;
        b[row] = tt[v as usize];
    }
    match a.svd(true, true).solve(&b, 1e-12) {
        Ok(c) => Some(Vector3::new(c[1], c[2], c[3])),
        Err(_) => grad_cell_linear(mesh, tt, cell),
    }
}

/// Least-squares gradient at one vertex from its adjacent vertices, via the
/// 3x3 normal equations.
fn grad_at_vertex(mesh: &TetraMesh, tt: &[Float], v: u32) -> Option<Vector3<Float>> {
    if !tt[v as usize].is_finite() {
        return None;
    }
    let mut neighbors: Vec<u32> = Vec::new();
    for &c in mesh.cells_of_vertex(v) {
        for w in mesh.tet(c) {
            if w != v {
                neighbors.push(w);
            }
        }
    }
    neighbors.sort_unstable();
    neighbors.dedup();

    let pv = mesh.vertex(v);
    let tv = tt[v as usize];
    let mut ata = Matrix3::zeros();
    let mut atb = Vector3::zeros();
    let mut used = 0;
    for &w in &neighbors {
        let tw = tt[w as usize];
        if !tw.is_finite() {
            continue;
        }
        let d = mesh.vertex(w) - pv;
        ata += d * d.transpose();
        atb += d * (tw - tv);
        used += 1;
    }
    if used < 3 {
        return None;
    }
    ata.lu().solve(&atb)
}

/// Barycentric blend of the four per-vertex gradients of the cell.
fn grad_averaged(
    mesh: &TetraMesh,
    tt: &[Float],
    cell: u32,
    p: &Point3<Float>,
) -> Option<Vector3<Float>> {
    let [a, b, c, d] = mesh.tet_points(cell);
    let lambda = barycentric(p, &a, &b, &c, &d)?;
    let tet = mesh.tet(cell);
    let mut g = Vector3::zeros();
    for (i, &v) in tet.iter().enumerate() {
        let gv = match grad_at_vertex(mesh, tt, v) {
            Some(gv) => gv,
            None => grad_cell_linear(mesh, tt, cell)?,
        };
        g += gv * lambda[i];
    }
    Some(g)
}

fn gradient(
    mesh: &TetraMesh,
    tt: &[Float],
    cell: u32,
    p: &Point3<Float>,
    method: GradientMethod,
) -> Option<Vector3<Float>> {
    match method {
        GradientMethod::LeastSquares1 => grad_cell_linear(mesh, tt, cell),
        GradientMethod::LeastSquares2 => grad_quadratic(mesh, tt, cell, p),
        GradientMethod::Averaging => grad_averaged(mesh, tt, cell, p),
    }
}

/// Whether `p` lies inside cell `c` within the barycentric tolerance. A point
/// on a shared face counts for every cell touching it.
fn cell_contains(mesh: &TetraMesh, c: u32, p: &Point3<Float>) -> bool {
    let [a, b, cc, d] = mesh.tet_points(c);
    match barycentric(p, &a, &b, &cc, &d) {
        Some(l) => bary_inside(&l, BARY_TOL),
        None => false,
    }
}

fn nearest_source(sources: &[(Point3<Float>, Float)], p: &Point3<Float>) -> (Point3<Float>, Float) {
    let mut best = sources[0].0;
    let mut best_d = (sources[0].0 - p).norm();
    for (s, _) in &sources[1..] {
        let d = (s - p).norm();
        if d < best_d {
            best_d = d;
            best = *s;
        }
    }
    (best, best_d)
}

/// Walk from a receiver back to a source along the negative traveltime
/// gradient. Returns the raypath, receiver first, ending at a source point.
///
/// `tt` is the converged per-vertex traveltime field. The walk steps to the
/// nearest exit face of the current cell and crosses into the neighbor; it
/// terminates when the current cell contains a source or the point comes
/// within `min_dist` of one.
///
/// # Errors
/// `RaytraceFailure` (carrying `receiver_index`) when the gradient vanishes,
/// the ray leaves the mesh, or the step budget is exhausted.
pub fn trace_ray(
    mesh: &TetraMesh,
    tt: &[Float],
    sources: &[(Point3<Float>, Float)],
    rcv: &Point3<Float>,
    method: GradientMethod,
    min_dist: Float,
    receiver_index: usize,
) -> Result<Vec<Point3<Float>>> {
    let fail = |reason: &str| RaytraceError::RaytraceFailure {
        receiver: receiver_index,
        reason: reason.to_string(),
    };

    let mut cell = mesh
        .locate(rcv)
        .ok_or_else(|| fail("receiver outside the mesh"))?;

    let mut path = vec![*rcv];
    let mut cur = *rcv;
    let mut entry_face: Option<usize> = None;
    let mut nudges = 0;
    let max_steps = 4 * mesh.n_cells() + 100;

    for _ in 0..max_steps {
        if let Some((spos, _)) = sources
            .iter()
            .find(|(s, _)| cell_contains(mesh, cell, s))
        {
            path.push(*spos);
            return Ok(path);
        }
        let (spos, sdist) = nearest_source(sources, &cur);
        if sdist <= min_dist {
            path.push(spos);
            return Ok(path);
        }

        let g = gradient(mesh, tt, cell, &cur, method).ok_or_else(|| fail("gradient fit failed"))?;
        if g.norm() < GRAD_EPS {
            return Err(fail("vanishing traveltime gradient"));
        }
        let dir = -g.normalize();

        let pts = mesh.tet_points(cell);
        let mut exit: Option<(Float, usize)> = None;
        for (fi, face) in TET_FACES.iter().enumerate() {
            if entry_face == Some(fi) {
                continue;
            }
            if let Some(t) = ray_triangle(&cur, &dir, &pts[face[0]], &pts[face[1]], &pts[face[2]])
            {
                if t > 1e-12 && exit.map_or(true, |(tb, _)| t < tb) {
                    exit = Some((t, fi));
                }
            }
        }

        let (t, fi) = match exit {
            Some(x) => x,
            None => {
                // Grazing an edge or corner: nudge forward and relocate
                nudges += 1;
                if nudges > MAX_NUDGES {
                    return Err(fail("ray stalled on a cell boundary"));
                }
                cur += dir * min_dist.max(1e-12);
                cell = mesh.locate(&cur).ok_or_else(|| fail("ray left the mesh"))?;
                entry_face = None;
                continue;
            }
        };
        nudges = 0;

        let exit_p = cur + dir * t;
        let (spos, sdist) = nearest_source(sources, &exit_p);
        if t < min_dist && sdist <= min_dist {
            path.push(spos);
            return Ok(path);
        }

        match mesh.neighbor(cell, fi) {
            Some(nb) => {
                path.push(exit_p);
                entry_face = (0..4).find(|&f| mesh.neighbor(nb, f) == Some(cell));
                cell = nb;
                cur = exit_p;
            }
            None => return Err(fail("ray reached the mesh boundary")),
        }
    }

    Err(fail("step budget exhausted before reaching a source"))
}

/// Slowness line integral along a polyline, midpoint rule per segment.
pub fn integrate_slowness(mesh: &TetraMesh, path: &[Point3<Float>]) -> Float {
    let mut total = 0.0;
    for seg in path.windows(2) {
        let mid = Point3::from((seg[0].coords + seg[1].coords) / 2.0);
        let cell = mesh
            .locate(&mid)
            .or_else(|| mesh.locate(&seg[0]))
            .or_else(|| mesh.locate(&seg[1]));
        if let Some(c) = cell {
            total += mesh.slowness_at(c, &mid) * (seg[1] - seg[0]).norm();
        }
    }
    total
}
