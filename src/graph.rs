// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use nalgebra::Point3;

use crate::error::{RaytraceError, Result};
use crate::geometry::{bary_inside, barycentric, Float, BARY_TOL};
use crate::mesh::{TetraMesh, TET_EDGES, TET_FACES};

/// A non-corner node of the shortest-path graph: a secondary node on a mesh
/// edge, or a tertiary node added near a source.
struct GraphNode {
    pos: Point3<Float>,
    /// Cells containing the edge this node sits on, ascending.
    owners: Vec<u32>,
    /// Interpolated slowness at the node (per-vertex fields only).
    slowness: Float,
    /// Parent edge and fraction along it, for slowness refreshes.
    edge: (u32, u32),
    frac: Float,
}

/// Shortest-path graph over primary vertices and secondary nodes.
///
/// Secondary nodes are placed uniformly on each unique mesh edge. Two nodes
/// are connected when they lie on the same tetrahedron face; the connection
/// weight is evaluated during the search as distance times segment slowness.
pub struct NodeGraph {
    n_primary: usize,
    n_secondary: usize,
    extra: Vec<GraphNode>,
    /// Per cell and face: node ids on that face (3 corners + edge secondaries).
    cell_face_nodes: Vec<[Vec<u32>; 4]>,
}

/// Per-solve tertiary node overlay for the dynamic shortest-path method.
/// Augments the faces of cells near the source without mutating the base
/// graph; dropped when the solve finishes.
pub struct TertiaryOverlay {
    base_nodes: usize,
    nodes: Vec<GraphNode>,
    cell_extra: HashMap<u32, [Vec<u32>; 4]>,
}

/// Priority queue entry; BinaryHeap is a max-heap, so the ordering is
/// reversed, with ties broken by node index for determinism.
#[derive(Copy, Clone)]
struct HeapEntry {
    t: Float,
    node: u32,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.t == other.t && self.node == other.node
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .t
            .partial_cmp(&self.t)
            .unwrap_or(CmpOrdering::Equal)
            .then_with(|| other.node.cmp(&self.node))
    }
}

/// Cells containing the edge (a, b): intersection of the two incident-cell
/// lists, which are ascending by construction.
fn edge_owners(mesh: &TetraMesh, a: u32, b: u32) -> Vec<u32> {
    let ca = mesh.cells_of_vertex(a);
    let cb = mesh.cells_of_vertex(b);
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < ca.len() && j < cb.len() {
        match ca[i].cmp(&cb[j]) {
            CmpOrdering::Less => i += 1,
            CmpOrdering::Greater => j += 1,
            CmpOrdering::Equal => {
                out.push(ca[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

fn make_edge_node(mesh: &TetraMesh, a: u32, b: u32, frac: Float, owners: Vec<u32>) -> GraphNode {
    let pa = mesh.vertex(a);
    let pb = mesh.vertex(b);
    let pos = Point3::from(pa.coords * (1.0 - frac) + pb.coords * frac);
    let slowness = if mesh.cell_slowness() {
        0.0
    } else {
        (1.0 - frac) * mesh.vertex_slowness(a) + frac * mesh.vertex_slowness(b)
    };
    GraphNode {
        pos,
        owners,
        slowness,
        edge: (a, b),
        frac,
    }
}

impl NodeGraph {
    /// Build the graph: `n_secondary` nodes per unique edge plus the per-cell
    /// face node tables.
    pub fn new(mesh: &TetraMesh, n_secondary: usize) -> Self {
        let n_primary = mesh.n_vertices();
        let mut extra: Vec<GraphNode> = Vec::new();
        let mut edge_map: HashMap<(u32, u32), Vec<u32>> = HashMap::new();

        for c in 0..mesh.n_cells() as u32 {
            let tet = mesh.tet(c);
            for e in TET_EDGES {
                let (a, b) = {
                    let (x, y) = (tet[e[0]], tet[e[1]]);
                    if x < y {
                        (x, y)
                    } else {
                        (y, x)
                    }
                };
                edge_map.entry((a, b)).or_insert_with(|| {
                    let owners = edge_owners(mesh, a, b);
                    let mut ids = Vec::with_capacity(n_secondary);
                    for i in 1..=n_secondary {
                        let frac = i as Float / (n_secondary + 1) as Float;
                        let id = (n_primary + extra.len()) as u32;
                        extra.push(make_edge_node(mesh, a, b, frac, owners.clone()));
                        ids.push(id);
                    }
                    ids
                });
            }
        }

        let mut cell_face_nodes = Vec::with_capacity(mesh.n_cells());
        for c in 0..mesh.n_cells() as u32 {
            let tet = mesh.tet(c);
            let faces = TET_FACES.map(|face| {
                let corners = [tet[face[0]], tet[face[1]], tet[face[2]]];
                let mut nodes = corners.to_vec();
                for (i, j) in [(0, 1), (1, 2), (0, 2)] {
                    let key = if corners[i] < corners[j] {
                        (corners[i], corners[j])
                    } else {
                        (corners[j], corners[i])
                    };
                    if let Some(ids) = edge_map.get(&key) {
                        nodes.extend_from_slice(ids);
                    }
                }
                nodes
            });
            cell_face_nodes.push(faces);
        }

        NodeGraph {
            n_primary,
            n_secondary,
            extra,
            cell_face_nodes,
        }
    }

    /// Number of primary vertices.
    pub fn n_primary(&self) -> usize {
        self.n_primary
    }

    /// Number of graph nodes without any overlay.
    pub fn n_nodes(&self) -> usize {
        self.n_primary + self.extra.len()
    }

    /// Recompute interpolated node slowness after a slowness swap (the node
    /// values mirror the mesh's per-vertex field).
    pub fn refresh_slowness(&mut self, mesh: &TetraMesh) {
        if mesh.cell_slowness() {
            return;
        }
        for node in &mut self.extra {
            node.slowness = (1.0 - node.frac) * mesh.vertex_slowness(node.edge.0)
                + node.frac * mesh.vertex_slowness(node.edge.1);
        }
    }

    /// Run the best-first search from `sources`, writing arrival times for
    /// every node into `tt` (resized to the node count, overlay included).
    ///
    /// # Errors
    /// `OutOfGrid` if a source lies outside the mesh; `Cancelled` if the stop
    /// flag is raised between queue pops.
    pub fn solve(
        &self,
        mesh: &TetraMesh,
        overlay: Option<&TertiaryOverlay>,
        sources: &[(Point3<Float>, Float)],
        stop: &AtomicBool,
        tt: &mut Vec<Float>,
        known: &mut Vec<bool>,
    ) -> Result<()> {
        let view = View {
            mesh,
            graph: self,
            overlay,
        };
        let n_nodes = view.n_nodes();
        tt.clear();
        tt.resize(n_nodes, Float::INFINITY);
        known.clear();
        known.resize(n_nodes, false);

        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();
        let per_cell = mesh.cell_slowness();

        for (n, (pos, t0)) in sources.iter().enumerate() {
            let cell = mesh.locate(pos).ok_or(RaytraceError::OutOfGrid {
                what: "source",
                index: n,
                point: [pos.x, pos.y, pos.z],
            })?;
            let s_src = mesh.slowness_at(cell, pos);
            for node in view.cell_nodes(cell) {
                let d = (view.pos(node) - pos).norm();
                let w = if per_cell {
                    s_src * d
                } else {
                    0.5 * (s_src + view.slow(node)) * d
                };
                let t = t0 + w;
                if t < tt[node as usize] {
                    tt[node as usize] = t;
                    heap.push(HeapEntry { t, node });
                }
            }
        }

        while let Some(HeapEntry { t, node }) = heap.pop() {
            if stop.load(Ordering::Acquire) {
                return Err(RaytraceError::Cancelled { pending: 0 });
            }
            if known[node as usize] {
                continue; // stale entry
            }
            known[node as usize] = true;
            let pu = view.pos(node);
            let su = view.slow(node);

            for &cell in view.owners(node) {
                let s_cell = if per_cell {
                    mesh.cell_slowness_effective(cell, false)
                } else {
                    0.0
                };
                for fi in 0..4 {
                    let (base, ext) = view.face_nodes(cell, fi);
                    if !base.contains(&node) && !ext.contains(&node) {
                        continue;
                    }
                    for &v in base.iter().chain(ext.iter()) {
                        if v == node || known[v as usize] {
                            continue;
                        }
                        let d = (view.pos(v) - pu).norm();
                        let w = if per_cell {
                            s_cell * d
                        } else {
                            0.5 * (su + view.slow(v)) * d
                        };
                        let cand = t + w;
                        if cand < tt[v as usize] {
                            tt[v as usize] = cand;
                            heap.push(HeapEntry { t: cand, node: v });
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Traveltime at an arbitrary receiver point: the minimum over the nodes
    /// of the containing cell of `T(node) + s·dist`, with a direct-source
    /// shortcut when a source shares the cell. `None` when the receiver is
    /// outside the mesh.
    pub fn traveltime_at(
        &self,
        mesh: &TetraMesh,
        overlay: Option<&TertiaryOverlay>,
        tt: &[Float],
        sources: &[(Point3<Float>, Float)],
        rcv: &Point3<Float>,
    ) -> Option<Float> {
        let view = View {
            mesh,
            graph: self,
            overlay,
        };
        let cell = mesh.locate(rcv)?;
        let per_cell = mesh.cell_slowness();
        let s_cell = if per_cell {
            mesh.cell_slowness_effective(cell, false)
        } else {
            0.0
        };
        let s_rcv = mesh.slowness_at(cell, rcv);

        let mut best = Float::INFINITY;
        for node in view.cell_nodes(cell) {
            let d = (view.pos(node) - rcv).norm();
            let w = if per_cell {
                s_cell * d
            } else {
                0.5 * (s_rcv + view.slow(node)) * d
            };
            let cand = tt[node as usize] + w;
            if cand < best {
                best = cand;
            }
        }

        let [a, b, c, d] = mesh.tet_points(cell);
        for (spos, t0) in sources {
            if let Some(l) = barycentric(spos, &a, &b, &c, &d) {
                if bary_inside(&l, BARY_TOL) {
                    let dist = (rcv - spos).norm();
                    let s = if per_cell {
                        s_cell
                    } else {
                        0.5 * (s_rcv + mesh.slowness_at(cell, spos))
                    };
                    let cand = t0 + s * dist;
                    if cand < best {
                        best = cand;
                    }
                }
            }
        }
        Some(best)
    }
}

impl TertiaryOverlay {
    /// Place `n_tertiary` nodes on every edge of every cell whose centroid
    /// lies within `radius` of the source; the cell containing the source is
    /// always eligible. Fractions coinciding with a secondary node are
    /// skipped.
    pub fn build(
        mesh: &TetraMesh,
        graph: &NodeGraph,
        src: &Point3<Float>,
        n_tertiary: usize,
        radius: Float,
    ) -> Self {
        let base_nodes = graph.n_nodes();
        let src_cell = mesh.locate(src);
        let mut nodes: Vec<GraphNode> = Vec::new();
        let mut edge_map: HashMap<(u32, u32), Vec<u32>> = HashMap::new();
        let mut cell_extra: HashMap<u32, [Vec<u32>; 4]> = HashMap::new();

        for c in 0..mesh.n_cells() as u32 {
            let eligible =
                (mesh.centroid(c) - src).norm() <= radius || src_cell == Some(c);
            if !eligible {
                continue;
            }
            let tet = mesh.tet(c);
            for e in TET_EDGES {
                let key = {
                    let (x, y) = (tet[e[0]], tet[e[1]]);
                    if x < y {
                        (x, y)
                    } else {
                        (y, x)
                    }
                };
                edge_map.entry(key).or_insert_with(|| {
                    let owners = edge_owners(mesh, key.0, key.1);
                    let mut ids = Vec::with_capacity(n_tertiary);
                    for j in 1..=n_tertiary {
                        let frac = (2.0 * j as Float - 1.0) / (2.0 * n_tertiary as Float);
                        let clash = (1..=graph.n_secondary).any(|i| {
                            (frac - i as Float / (graph.n_secondary + 1) as Float).abs() < 1e-12
                        });
                        if clash {
                            continue;
                        }
                        let id = (base_nodes + nodes.len()) as u32;
                        nodes.push(make_edge_node(mesh, key.0, key.1, frac, owners.clone()));
                        ids.push(id);
                    }
                    ids
                });
            }

            let faces = TET_FACES.map(|face| {
                let corners = [tet[face[0]], tet[face[1]], tet[face[2]]];
                let mut ids = Vec::new();
                for (i, j) in [(0, 1), (1, 2), (0, 2)] {
                    let key = if corners[i] < corners[j] {
                        (corners[i], corners[j])
                    } else {
                        (corners[j], corners[i])
                    };
                    if let Some(extra) = edge_map.get(&key) {
                        ids.extend_from_slice(extra);
                    }
                }
                ids
            });
            cell_extra.insert(c, faces);
        }

        TertiaryOverlay {
            base_nodes,
            nodes,
            cell_extra,
        }
    }

    /// Number of tertiary nodes placed.
    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }
}

/// Resolves node ids across the base graph and an optional overlay.
struct View<'a> {
    mesh: &'a TetraMesh,
    graph: &'a NodeGraph,
    overlay: Option<&'a TertiaryOverlay>,
}

const EMPTY: &[u32] = &[];

impl View<'_> {
    fn n_nodes(&self) -> usize {
        self.graph.n_nodes() + self.overlay.map_or(0, |o| o.nodes.len())
    }

    fn pos(&self, id: u32) -> Point3<Float> {
        let id = id as usize;
        if id < self.graph.n_primary {
            *self.mesh.vertex(id as u32)
        } else if id < self.graph.n_nodes() {
            self.graph.extra[id - self.graph.n_primary].pos
        } else {
            self.overlay.map(|o| o.nodes[id - o.base_nodes].pos).unwrap_or_else(Point3::origin)
        }
    }

    fn owners(&self, id: u32) -> &[u32] {
        let idx = id as usize;
        if idx < self.graph.n_primary {
            self.mesh.cells_of_vertex(id)
        } else if idx < self.graph.n_nodes() {
            &self.graph.extra[idx - self.graph.n_primary].owners
        } else {
            self.overlay.map(|o| o.nodes[idx - o.base_nodes].owners.as_slice()).unwrap_or(EMPTY)
        }
    }

    fn slow(&self, id: u32) -> Float {
        let idx = id as usize;
        if idx < self.graph.n_primary {
            self.mesh.vertex_slowness(id)
        } else if idx < self.graph.n_nodes() {
            self.graph.extra[idx - self.graph.n_primary].slowness
        } else {
            self.overlay.map(|o| o.nodes[idx - o.base_nodes].slowness).unwrap_or(0.0)
        }
    }

    fn face_nodes(&self, cell: u32, fi: usize) -> (&[u32], &[u32]) {
        let base = self.graph.cell_face_nodes[cell as usize][fi].as_slice();
        let ext = self
            .overlay
            .and_then(|o| o.cell_extra.get(&cell))
            .map(|f| f[fi].as_slice())
            .unwrap_or(EMPTY);
        (base, ext)
    }

    /// All node ids on a cell, deduplicated.
    fn cell_nodes(&self, cell: u32) -> Vec<u32> {
        let mut out = Vec::new();
        for fi in 0..4 {
            let (base, ext) = self.face_nodes(cell, fi);
            out.extend_from_slice(base);
            out.extend_from_slice(ext);
        }
        out.sort_unstable();
        out.dedup();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube_mesh(n: usize, s: Float) -> TetraMesh {
        let h = 1.0 / n as Float;
        let (vertices, tets) = TetraMesh::structured([n, n, n], h);
        let mut mesh = TetraMesh::new(vertices, tets, true).unwrap();
        mesh.set_slowness(&vec![s; mesh.n_cells()]).unwrap();
        mesh
    }

    fn count_edges(mesh: &TetraMesh) -> usize {
        let mut edges = std::collections::HashSet::new();
        for c in 0..mesh.n_cells() as u32 {
            let tet = mesh.tet(c);
            for e in TET_EDGES {
                let (a, b) = (tet[e[0]].min(tet[e[1]]), tet[e[0]].max(tet[e[1]]));
                edges.insert((a, b));
            }
        }
        edges.len()
    }

    #[test]
    fn secondary_node_count() {
        let mesh = cube_mesh(2, 1.0);
        let graph = NodeGraph::new(&mesh, 3);
        assert_eq!(graph.n_nodes() - graph.n_primary(), 3 * count_edges(&mesh));
    }

    #[test]
    fn heap_orders_by_time_then_index() {
        let mut heap = BinaryHeap::new();
        heap.push(HeapEntry { t: 1.0, node: 9 });
        heap.push(HeapEntry { t: 1.0, node: 5 });
        heap.push(HeapEntry { t: 0.5, node: 7 });
        assert_eq!(heap.pop().map(|e| e.node), Some(7));
        assert_eq!(heap.pop().map(|e| e.node), Some(5));
        assert_eq!(heap.pop().map(|e| e.node), Some(9));
    }

    #[test]
    fn homogeneous_edge_aligned_is_exact() {
        let mesh = cube_mesh(3, 1.0);
        let graph = NodeGraph::new(&mesh, 2);
        let stop = AtomicBool::new(false);
        let (mut tt, mut known) = (Vec::new(), Vec::new());
        let sources = [(Point3::new(0.0, 0.0, 0.0), 0.0)];
        graph
            .solve(&mesh, None, &sources, &stop, &mut tt, &mut known)
            .unwrap();
        let t = graph
            .traveltime_at(&mesh, None, &tt, &sources, &Point3::new(1.0, 0.0, 0.0))
            .unwrap();
        assert!((t - 1.0).abs() < 1e-9, "edge-aligned tt = {}", t);
    }

    #[test]
    fn homogeneous_diagonal_small_angular_error() {
        let mesh = cube_mesh(3, 1.0);
        let graph = NodeGraph::new(&mesh, 2);
        let stop = AtomicBool::new(false);
        let (mut tt, mut known) = (Vec::new(), Vec::new());
        let sources = [(Point3::new(0.0, 0.0, 0.0), 0.0)];
        graph
            .solve(&mesh, None, &sources, &stop, &mut tt, &mut known)
            .unwrap();
        let t = graph
            .traveltime_at(&mesh, None, &tt, &sources, &Point3::new(1.0, 1.0, 1.0))
            .unwrap();
        let exact = 3.0_f64.sqrt();
        assert!(t >= exact - 1e-9, "graph time below geometric bound");
        assert!(t - exact < 0.05, "angular error too large: {}", t - exact);
    }

    #[test]
    fn receiver_in_source_cell_uses_direct_path() {
        let mesh = cube_mesh(2, 2.0);
        let graph = NodeGraph::new(&mesh, 2);
        let stop = AtomicBool::new(false);
        let (mut tt, mut known) = (Vec::new(), Vec::new());
        let src = Point3::new(0.26, 0.26, 0.22);
        let sources = [(src, 1.0)];
        graph
            .solve(&mesh, None, &sources, &stop, &mut tt, &mut known)
            .unwrap();
        let rcv = Point3::new(0.3, 0.3, 0.25);
        let t = graph
            .traveltime_at(&mesh, None, &tt, &sources, &rcv)
            .unwrap();
        let direct = 1.0 + 2.0 * (rcv - src).norm();
        assert!((t - direct).abs() < 1e-9);
    }

    #[test]
    fn tertiary_overlay_counts_and_solve() {
        let mesh = cube_mesh(2, 1.0);
        let graph = NodeGraph::new(&mesh, 2);
        let src = Point3::new(0.1, 0.1, 0.1);
        let overlay = TertiaryOverlay::build(&mesh, &graph, &src, 2, 10.0);
        // Radius covers the whole mesh: every unique edge gets nodes
        assert_eq!(overlay.n_nodes(), 2 * count_edges(&mesh));
        assert_eq!(overlay.cell_extra.len(), mesh.n_cells());

        let stop = AtomicBool::new(false);
        let (mut tt, mut known) = (Vec::new(), Vec::new());
        let sources = [(src, 0.0)];
        graph
            .solve(&mesh, Some(&overlay), &sources, &stop, &mut tt, &mut known)
            .unwrap();
        assert_eq!(tt.len(), graph.n_nodes() + overlay.n_nodes());
        assert!(tt.iter().all(|t| t.is_finite()));

        let far = Point3::new(1.0, 1.0, 1.0);
        let t_dspm = graph
            .traveltime_at(&mesh, Some(&overlay), &tt, &sources, &far)
            .unwrap();
        let exact = (far - src).norm();
        assert!(t_dspm >= exact - 1e-9);
        assert!(t_dspm - exact < 0.05);
    }

    #[test]
    fn zero_radius_overlay_still_covers_source_cell() {
        let mesh = cube_mesh(2, 1.0);
        let graph = NodeGraph::new(&mesh, 2);
        let src = Point3::new(0.1, 0.1, 0.1);
        let overlay = TertiaryOverlay::build(&mesh, &graph, &src, 1, 0.0);
        assert!(overlay.n_nodes() >= 6);
        assert!(overlay.cell_extra.len() >= 1);
    }

    #[test]
    fn cancellation_stops_search() {
        let mesh = cube_mesh(3, 1.0);
        let graph = NodeGraph::new(&mesh, 2);
        let stop = AtomicBool::new(true);
        let (mut tt, mut known) = (Vec::new(), Vec::new());
        let sources = [(Point3::new(0.5, 0.5, 0.5), 0.0)];
        let err = graph.solve(&mesh, None, &sources, &stop, &mut tt, &mut known);
        assert!(matches!(err, Err(RaytraceError::Cancelled { .. })));
    }
}
