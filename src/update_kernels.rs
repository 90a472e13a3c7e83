// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use nalgebra::Point3;

use crate::geometry::Float;
use crate::mesh::TetraMesh;

const FEAS_TOL: Float = 1e-9;

/// Solve the planar eikonal update through the face (a, b, c).
///
/// Finds the point p on the face whose planar wavefront arrival gives the
/// smallest traveltime at `v`, assuming T varies linearly over the face and
/// the medium has slowness `s` inside the tetrahedron. If the optimal p falls
/// outside the face, or the face gradient violates causality (|grad T| >= s),
/// falls back to the best edge or vertex update of the three lower-dimensional
/// subproblems.
///
/// Infinite neighbor times are handled: the face update needs all three
/// finite, an edge update needs both of its endpoints finite, and a vertex
/// update needs one.
#[allow(clippy::too_many_arguments)]
pub fn triangle_update(
    v: &Point3<Float>,
    a: &Point3<Float>,
    b: &Point3<Float>,
    c: &Point3<Float>,
    ta: Float,
    tb: Float,
    tc: Float,
    s: Float,
) -> Float {
    if ta.is_finite() && tb.is_finite() && tc.is_finite() {
        let e1 = a - c;
        let e2 = b - c;
        let w = v - c;
        let u1 = ta - tc;
        let u2 = tb - tc;

        let g11 = e1.dot(&e1);
        let g12 = e1.dot(&e2);
        let g22 = e2.dot(&e2);
        let det = g11 * g22 - g12 * g12;
        if det > 1e-14 * g11 * g22 {
            let h1 = e1.dot(&w);
            let h2 = e2.dot(&w);
            // lambda0: foot of the perpendicular from v onto the face plane
            let l01 = (g22 * h1 - g12 * h2) / det;
            let l02 = (g11 * h2 - g12 * h1) / det;
            // G^-1 u and the squared tangential gradient q^2 = u' G^-1 u
            let gu1 = (g22 * u1 - g12 * u2) / det;
            let gu2 = (g11 * u2 - g12 * u1) / det;
            let q2 = u1 * gu1 + u2 * gu2;
            if q2 < s * s {
                let rho2 = (w.dot(&w) - (l01 * h1 + l02 * h2)).max(0.0);
                let ray_len = (rho2 / (1.0 - q2 / (s * s))).sqrt();
                let l1 = l01 - ray_len / s * gu1;
                let l2 = l02 - ray_len / s * gu2;
                if l1 >= -FEAS_TOL && l2 >= -FEAS_TOL && l1 + l2 <= 1.0 + FEAS_TOL {
                    return tc + l1 * u1 + l2 * u2 + s * ray_len;
                }
            }
        }
    }

    let mut best = Float::INFINITY;
    best = best.min(edge_update(v, a, b, ta, tb, s));
    best = best.min(edge_update(v, b, c, tb, tc, s));
    best = best.min(edge_update(v, a, c, ta, tc, s));
    if ta.is_finite() {
        best = best.min(ta + s * (v - a).norm());
    }
    if tb.is_finite() {
        best = best.min(tb + s * (v - b).norm());
    }
    if tc.is_finite() {
        best = best.min(tc + s * (v - c).norm());
    }
    best
}

/// One-dimensional subproblem: best arrival at `v` through the segment (x, y)
/// with linearly varying T. Returns infinity when the optimal foot point falls
/// outside the segment or either endpoint is unreached.
fn edge_update(
    v: &Point3<Float>,
    x: &Point3<Float>,
    y: &Point3<Float>,
    tx: Float,
    ty: Float,
    s: Float,
) -> Float {
    if !tx.is_finite() || !ty.is_finite() {
        return Float::INFINITY;
    }
    let e = y - x;
    let w = v - x;
    let u = ty - tx;
    let ee = e.dot(&e);
    if ee < 1e-28 {
        return Float::INFINITY;
    }
    let q2 = u * u / ee;
    if q2 >= s * s {
        return Float::INFINITY;
    }
    let ew = e.dot(&w);
    let rho2 = (w.dot(&w) - ew * ew / ee).max(0.0);
    let ray_len = (rho2 / (1.0 - q2 / (s * s))).sqrt();
    let t = ew / ee - ray_len / s * u / ee;
    if !(-FEAS_TOL..=1.0 + FEAS_TOL).contains(&t) {
        return Float::INFINITY;
    }
    tx + t * u + s * ray_len
}

/// Candidate traveltime at vertex `v`: the minimum of the planar update over
/// every incident tetrahedron, using that cell's effective slowness.
pub fn vertex_candidate(mesh: &TetraMesh, tt: &[Float], v: u32, interp_vel: bool) -> Float {
    let pv = *mesh.vertex(v);
    let mut best = Float::INFINITY;
    for &cell in mesh.cells_of_vertex(v) {
        let tet = mesh.tet(cell);
        let mut others = [0u32; 3];
        let mut k = 0;
        for &w in &tet {
            if w != v {
                others[k] = w;
                k += 1;
            }
        }
        let s = mesh.cell_slowness_effective(cell, interp_vel);
        let cand = triangle_update(
            &pv,
            mesh.vertex(others[0]),
            mesh.vertex(others[1]),
            mesh.vertex(others[2]),
            tt[others[0] as usize],
            tt[others[1] as usize],
            tt[others[2] as usize],
            s,
        );
        if cand < best {
            best = cand;
        }
    }
    best
}
