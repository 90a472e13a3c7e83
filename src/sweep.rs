// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::sync::atomic::{AtomicBool, Ordering};

use nalgebra::Point3;

use crate::error::{RaytraceError, Result};
use crate::geometry::Float;
use crate::mesh::TetraMesh;
use crate::update_kernels::vertex_candidate;

/// Outcome of a fast sweeping solve. Non-convergence is a diagnostic, not an
/// error; the field holds the best values reached.
pub struct SweepReport {
    /// Whether the residual dropped below the tolerance.
    pub converged: bool,
    /// Number of passes performed (one pass = 8 sweeps).
    pub passes: usize,
    /// Largest traveltime change during the last pass.
    pub residual: Float,
}

/// Fast Sweeping Method solver over the primary vertices.
///
/// Holds the eight sweep orderings, vertices sorted by the keys
/// `±x ± y ± z`, precomputed once per mesh. Orderings are fixed and ties are
/// broken by vertex index, so results are deterministic.
pub struct SweepSolver {
    orders: Vec<Vec<u32>>,
}

impl SweepSolver {
    /// Precompute the eight sweep orderings for `mesh`.
    pub fn new(mesh: &TetraMesh) -> Self {
        let mut orders = Vec::with_capacity(8);
        for dir in 0..8u32 {
            let sx: Float = if dir & 1 != 0 { -1.0 } else { 1.0 };
            let sy: Float = if dir & 2 != 0 { -1.0 } else { 1.0 };
            let sz: Float = if dir & 4 != 0 { -1.0 } else { 1.0 };
            let mut ids: Vec<u32> = (0..mesh.n_vertices() as u32).collect();
            ids.sort_by(|&i, &j| {
                let pi = mesh.vertex(i);
                let pj = mesh.vertex(j);
                let ki = sx * pi.x + sy * pi.y + sz * pi.z;
                let kj = sx * pj.x + sy * pj.y + sz * pj.z;
                ki.partial_cmp(&kj)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| i.cmp(&j))
            });
            orders.push(ids);
        }
        SweepSolver { orders }
    }

    /// Compute the traveltime field for a set of sources.
    ///
    /// `tt` is the caller-owned per-worker field of length `n_vertices`; it is
    /// reinitialized here. Vertices of each source cell are seeded with
    /// `t0 + s·d` and frozen. Sweeping stops when the largest change over a
    /// pass drops to `eps` or after `maxit` passes.
    ///
    /// # Errors
    /// `OutOfGrid` if a source lies outside the mesh; `Cancelled` if the stop
    /// flag is raised mid-solve.
    #[allow(clippy::too_many_arguments)]
    pub fn solve(
        &self,
        mesh: &TetraMesh,
        sources: &[(Point3<Float>, Float)],
        eps: Float,
        maxit: usize,
        interp_vel: bool,
        stop: &AtomicBool,
        tt: &mut [Float],
    ) -> Result<SweepReport> {
        tt.fill(Float::INFINITY);
        let mut frozen = vec![false; mesh.n_vertices()];

        for (n, (pos, t0)) in sources.iter().enumerate() {
            let cell = mesh.locate(pos).ok_or(RaytraceError::OutOfGrid {
                what: "source",
                index: n,
                point: [pos.x, pos.y, pos.z],
            })?;
            let s = mesh.cell_slowness_effective(cell, interp_vel);
            for v in mesh.tet(cell) {
                let t = t0 + s * (mesh.vertex(v) - pos).norm();
                if t < tt[v as usize] {
                    tt[v as usize] = t;
                }
                frozen[v as usize] = true;
            }
        }

        let mut passes = 0;
        let mut residual = Float::INFINITY;
        while passes < maxit {
            passes += 1;
            let mut max_change: Float = 0.0;
            for order in &self.orders {
                if stop.load(Ordering::Acquire) {
                    return Err(RaytraceError::Cancelled { pending: 0 });
                }
                for &v in order {
                    if frozen[v as usize] {
                        continue;
                    }
                    let old = tt[v as usize];
                    let cand = vertex_candidate(mesh, tt, v, interp_vel);
                    if cand < old {
                        tt[v as usize] = cand;
                        let change = if old.is_finite() {
                            old - cand
                        } else {
                            Float::INFINITY
                        };
                        if change > max_change {
                            max_change = change;
                        }
                    }
                }
            }
            residual = max_change;
            if max_change <= eps {
                return Ok(SweepReport {
                    converged: true,
                    passes,
                    residual,
                });
            }
        }

        Ok(SweepReport {
            converged: false,
            passes,
            residual,
        })
    }
}
