// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::collections::{HashMap, HashSet};

use nalgebra::Point3;

use crate::error::{RaytraceError, Result};
use crate::geometry::{bary_inside, barycentric, tet_volume, Float, BARY_TOL};

/// Local vertex triples of the four faces; face `i` is opposite local vertex `i`.
pub const TET_FACES: [[usize; 3]; 4] = [[1, 2, 3], [0, 2, 3], [0, 1, 3], [0, 1, 2]];

/// Local vertex pairs of the six edges.
pub const TET_EDGES: [[usize; 2]; 6] = [[0, 1], [0, 2], [0, 3], [1, 2], [1, 3], [2, 3]];

/// Scalar parameter field attached to the mesh. The variant is fixed at
/// construction; values are installed with `set_slowness`.
enum SlownessField {
    /// Piecewise constant, one value per tetrahedron.
    Cell(Vec<Float>),
    /// One value per vertex, linearly interpolated inside each tetrahedron.
    Vertex(Vec<Float>),
}

/// Uniform spatial bin grid over the tetrahedra for O(1) point location.
/// Each bin stores the tets whose AABB overlaps it.
struct BinGrid {
    origin: Point3<Float>,
    dims: [usize; 3],
    cell_size: [Float; 3],
    bins: Vec<Vec<u32>>,
}

impl BinGrid {
    fn build(vertices: &[Point3<Float>], tets: &[[u32; 4]], lo: &Point3<Float>, hi: &Point3<Float>) -> Self {
        let extent = [
            (hi.x - lo.x).max(1e-12),
            (hi.y - lo.y).max(1e-12),
            (hi.z - lo.z).max(1e-12),
        ];
        let max_extent = extent[0].max(extent[1]).max(extent[2]);
        // Target ~15 bins along the longest axis
        let base = max_extent / 15.0;
        let dims = [
            ((extent[0] / base).ceil() as usize).max(1),
            ((extent[1] / base).ceil() as usize).max(1),
            ((extent[2] / base).ceil() as usize).max(1),
        ];
        let cell_size = [
            extent[0] / dims[0] as Float,
            extent[1] / dims[1] as Float,
            extent[2] / dims[2] as Float,
        ];
        let mut bins = vec![Vec::new(); dims[0] * dims[1] * dims[2]];

        for (ti, tet) in tets.iter().enumerate() {
            let pts: Vec<&Point3<Float>> = tet.iter().map(|&v| &vertices[v as usize]).collect();
            let mut tmin = *pts[0];
            let mut tmax = *pts[0];
            for p in &pts[1..] {
                tmin.x = tmin.x.min(p.x);
                tmin.y = tmin.y.min(p.y);
                tmin.z = tmin.z.min(p.z);
                tmax.x = tmax.x.max(p.x);
                tmax.y = tmax.y.max(p.y);
                tmax.z = tmax.z.max(p.z);
            }
            let i0 = Self::index_1d(tmin.x, lo.x, cell_size[0], dims[0]);
            let j0 = Self::index_1d(tmin.y, lo.y, cell_size[1], dims[1]);
            let k0 = Self::index_1d(tmin.z, lo.z, cell_size[2], dims[2]);
            let i1 = Self::index_1d(tmax.x, lo.x, cell_size[0], dims[0]);
            let j1 = Self::index_1d(tmax.y, lo.y, cell_size[1], dims[1]);
            let k1 = Self::index_1d(tmax.z, lo.z, cell_size[2], dims[2]);
            for k in k0..=k1 {
                for j in j0..=j1 {
                    for i in i0..=i1 {
                        bins[(k * dims[1] + j) * dims[0] + i].push(ti as u32);
                    }
                }
            }
        }

        BinGrid {
            origin: *lo,
            dims,
            cell_size,
            bins,
        }
    }

    fn index_1d(x: Float, origin: Float, size: Float, n: usize) -> usize {
        let i = ((x - origin) / size).floor();
        (i.max(0.0) as usize).min(n - 1)
    }

    fn candidates(&self, p: &Point3<Float>) -> &[u32] {
        let i = Self::index_1d(p.x, self.origin.x, self.cell_size[0], self.dims[0]);
        let j = Self::index_1d(p.y, self.origin.y, self.cell_size[1], self.dims[1]);
        let k = Self::index_1d(p.z, self.origin.z, self.cell_size[2], self.dims[2]);
        &self.bins[(k * self.dims[1] + j) * self.dims[0] + i]
    }
}

/// Immutable index over an unstructured tetrahedral mesh.
///
/// Holds the vertex and tetrahedron arrays, the vertex-to-incident-cells
/// table, the face adjacency table, a bin grid for point location, and the
/// slowness field. Connectivity never changes after construction; the
/// slowness values may be swapped between solves with `set_slowness`.
pub struct TetraMesh {
    vertices: Vec<Point3<Float>>,
    tetrahedra: Vec<[u32; 4]>,
    vertex_cells: Vec<Vec<u32>>,
    neighbors: Vec<[Option<u32>; 4]>,
    slowness: SlownessField,
    bbox_min: Point3<Float>,
    bbox_max: Point3<Float>,
    tol: Float,
    bins: BinGrid,
}

impl TetraMesh {
    /// Build the mesh index from dense vertex and tetrahedron arrays.
    ///
    /// # Parameters
    /// - `vertices`: vertex positions, indexed densely from 0
    /// - `tetrahedra`: four vertex indices per cell, each in `[0, N)`
    /// - `cell_slowness`: slowness per cell (true) or per vertex (false)
    ///
    /// # Errors
    /// Returns `InvalidMesh` on out-of-range indices, repeated vertices within
    /// a cell, duplicated cells, degenerate cells, or a face shared by more
    /// than two cells.
    pub fn new(
        vertices: Vec<Point3<Float>>,
        tetrahedra: Vec<[u32; 4]>,
        cell_slowness: bool,
    ) -> Result<Self> {
        if vertices.len() < 4 {
            return Err(RaytraceError::InvalidMesh(format!(
                "need at least 4 vertices, got {}",
                vertices.len()
            )));
        }
        if tetrahedra.is_empty() {
            return Err(RaytraceError::InvalidMesh("no tetrahedra".to_string()));
        }

        let n = vertices.len() as u32;
        let mut seen = HashSet::with_capacity(tetrahedra.len());
        for (ti, tet) in tetrahedra.iter().enumerate() {
            for &v in tet {
                if v >= n {
                    return Err(RaytraceError::InvalidMesh(format!(
                        "tetrahedron {} references vertex {} but there are {} vertices",
                        ti, v, n
                    )));
                }
            }
            let mut key = *tet;
            key.sort_unstable();
            if key[0] == key[1] || key[1] == key[2] || key[2] == key[3] {
                return Err(RaytraceError::InvalidMesh(format!(
                    "tetrahedron {} has repeated vertices",
                    ti
                )));
            }
            if !seen.insert(key) {
                return Err(RaytraceError::InvalidMesh(format!(
                    "tetrahedron {} is a duplicate",
                    ti
                )));
            }
            let [a, b, c, d] = tet.map(|v| vertices[v as usize]);
            let lmax = (b - a)
                .norm()
                .max((c - a).norm())
                .max((d - a).norm())
                .max((c - b).norm())
                .max((d - b).norm())
                .max((d - c).norm());
            if tet_volume(&a, &b, &c, &d).abs() <= 1e-12 * lmax.powi(3) {
                return Err(RaytraceError::InvalidMesh(format!(
                    "tetrahedron {} is degenerate",
                    ti
                )));
            }
        }

        let mut vertex_cells = vec![Vec::new(); vertices.len()];
        for (ti, tet) in tetrahedra.iter().enumerate() {
            for &v in tet {
                vertex_cells[v as usize].push(ti as u32);
            }
        }

        // Pair cells across shared faces
        let mut face_map: HashMap<[u32; 3], (u32, usize)> = HashMap::new();
        let mut neighbors = vec![[None; 4]; tetrahedra.len()];
        for (ti, tet) in tetrahedra.iter().enumerate() {
            for (fi, face) in TET_FACES.iter().enumerate() {
                let mut key = [tet[face[0]], tet[face[1]], tet[face[2]]];
                key.sort_unstable();
                match face_map.remove(&key) {
                    None => {
                        face_map.insert(key, (ti as u32, fi));
                    }
                    Some((tj, fj)) => {
                        if neighbors[tj as usize][fj].is_some() {
                            return Err(RaytraceError::InvalidMesh(format!(
                                "face {:?} is shared by more than two cells",
                                key
                            )));
                        }
                        neighbors[ti][fi] = Some(tj);
                        neighbors[tj as usize][fj] = Some(ti as u32);
                    }
                }
            }
        }

        let mut bbox_min = vertices[0];
        let mut bbox_max = vertices[0];
        for p in &vertices[1..] {
            bbox_min.x = bbox_min.x.min(p.x);
            bbox_min.y = bbox_min.y.min(p.y);
            bbox_min.z = bbox_min.z.min(p.z);
            bbox_max.x = bbox_max.x.max(p.x);
            bbox_max.y = bbox_max.y.max(p.y);
            bbox_max.z = bbox_max.z.max(p.z);
        }
        let tol = 1e-8 * (bbox_max - bbox_min).norm().max(1.0);

        let bins = BinGrid::build(&vertices, &tetrahedra, &bbox_min, &bbox_max);

        let slowness = if cell_slowness {
            SlownessField::Cell(Vec::new())
        } else {
            SlownessField::Vertex(Vec::new())
        };

        Ok(TetraMesh {
            vertices,
            tetrahedra,
            vertex_cells,
            neighbors,
            slowness,
            bbox_min,
            bbox_max,
            tol,
            bins,
        })
    }

    /// Vertex and tetrahedron arrays for a structured mesh of
    /// `n[0] x n[1] x n[2]` hexahedral cells of edge `h`, each split into six
    /// tetrahedra around the main diagonal. Used by the CLI, tests and benches.
    pub fn structured(n: [usize; 3], h: Float) -> (Vec<Point3<Float>>, Vec<[u32; 4]>) {
        let np = [n[0] + 1, n[1] + 1, n[2] + 1];
        let vid = |i: usize, j: usize, k: usize| ((k * np[1] + j) * np[0] + i) as u32;

        let mut vertices = Vec::with_capacity(np[0] * np[1] * np[2]);
        for k in 0..np[2] {
            for j in 0..np[1] {
                for i in 0..np[0] {
                    vertices.push(Point3::new(i as Float * h, j as Float * h, k as Float * h));
                }
            }
        }

        let mut tets = Vec::with_capacity(6 * n[0] * n[1] * n[2]);
        for k in 0..n[2] {
            for j in 0..n[1] {
                for i in 0..n[0] {
                    let v000 = vid(i, j, k);
                    let v100 = vid(i + 1, j, k);
                    let v010 = vid(i, j + 1, k);
                    let v110 = vid(i + 1, j + 1, k);
                    let v001 = vid(i, j, k + 1);
                    let v101 = vid(i + 1, j, k + 1);
                    let v011 = vid(i, j + 1, k + 1);
                    let v111 = vid(i + 1, j + 1, k + 1);
                    // Kuhn subdivision: all six tets share the main diagonal,
                    // face diagonals match between adjacent cells.
                    tets.push([v000, v100, v110, v111]);
                    tets.push([v000, v110, v010, v111]);
                    tets.push([v000, v010, v011, v111]);
                    tets.push([v000, v011, v001, v111]);
                    tets.push([v000, v001, v101, v111]);
                    tets.push([v000, v101, v100, v111]);
                }
            }
        }
        (vertices, tets)
    }

    /// Number of vertices.
    pub fn n_vertices(&self) -> usize {
        self.vertices.len()
    }

    /// Number of tetrahedra.
    pub fn n_cells(&self) -> usize {
        self.tetrahedra.len()
    }

    /// Position of vertex `v`.
    pub fn vertex(&self, v: u32) -> &Point3<Float> {
        &self.vertices[v as usize]
    }

    /// Vertex indices of cell `c`.
    pub fn tet(&self, c: u32) -> [u32; 4] {
        self.tetrahedra[c as usize]
    }

    /// Positions of the four corners of cell `c`.
    pub fn tet_points(&self, c: u32) -> [Point3<Float>; 4] {
        self.tetrahedra[c as usize].map(|v| self.vertices[v as usize])
    }

    /// Cells incident to vertex `v`.
    pub fn cells_of_vertex(&self, v: u32) -> &[u32] {
        &self.vertex_cells[v as usize]
    }

    /// Cell adjacent to `c` across face `face` (opposite local vertex `face`),
    /// or `None` on the mesh boundary.
    pub fn neighbor(&self, c: u32, face: usize) -> Option<u32> {
        self.neighbors[c as usize][face]
    }

    /// Centroid of cell `c`.
    pub fn centroid(&self, c: u32) -> Point3<Float> {
        let [a, b, cc, d] = self.tet_points(c);
        Point3::from((a.coords + b.coords + cc.coords + d.coords) / 4.0)
    }

    /// Mesh bounding box.
    pub fn bbox(&self) -> (Point3<Float>, Point3<Float>) {
        (self.bbox_min, self.bbox_max)
    }

    /// Find the cell containing `p`, within the barycentric tolerance.
    pub fn locate(&self, p: &Point3<Float>) -> Option<u32> {
        if p.x < self.bbox_min.x - self.tol
            || p.y < self.bbox_min.y - self.tol
            || p.z < self.bbox_min.z - self.tol
            || p.x > self.bbox_max.x + self.tol
            || p.y > self.bbox_max.y + self.tol
            || p.z > self.bbox_max.z + self.tol
        {
            return None;
        }
        for &c in self.bins.candidates(p) {
            let [a, b, cc, d] = self.tet_points(c);
            if let Some(l) = barycentric(p, &a, &b, &cc, &d) {
                if bary_inside(&l, BARY_TOL.max(self.tol)) {
                    return Some(c);
                }
            }
        }
        None
    }

    /// Whether `p` lies inside the mesh (within tolerance).
    pub fn is_inside(&self, p: &Point3<Float>) -> bool {
        self.locate(p).is_some()
    }

    /// Length of the slowness array expected by `set_slowness`.
    pub fn n_params(&self) -> usize {
        match self.slowness {
            SlownessField::Cell(_) => self.tetrahedra.len(),
            SlownessField::Vertex(_) => self.vertices.len(),
        }
    }

    /// Whether the slowness field has been installed.
    pub fn has_slowness(&self) -> bool {
        match &self.slowness {
            SlownessField::Cell(s) | SlownessField::Vertex(s) => !s.is_empty(),
        }
    }

    /// Whether the slowness field is per cell.
    pub fn cell_slowness(&self) -> bool {
        matches!(self.slowness, SlownessField::Cell(_))
    }

    /// Replace the slowness field. Must not overlap with an active solve; the
    /// exclusive borrow sequences it between dispatches.
    ///
    /// # Errors
    /// `WrongSize` if the length differs from `n_params()`; `InvalidSlowness`
    /// if any value is not positive and finite.
    pub fn set_slowness(&mut self, values: &[Float]) -> Result<()> {
        if values.len() != self.n_params() {
            return Err(RaytraceError::WrongSize {
                what: "slowness field",
                expected: self.n_params(),
                got: values.len(),
            });
        }
        for (index, &value) in values.iter().enumerate() {
            if !value.is_finite() || value <= 0.0 {
                return Err(RaytraceError::InvalidSlowness { index, value });
            }
        }
        match &mut self.slowness {
            SlownessField::Cell(s) | SlownessField::Vertex(s) => {
                s.clear();
                s.extend_from_slice(values);
            }
        }
        Ok(())
    }

    /// Slowness at vertex `v` (per-vertex mode only; callers guard the mode).
    /// Zero until a field is installed.
    pub fn vertex_slowness(&self, v: u32) -> Float {
        match &self.slowness {
            SlownessField::Vertex(s) => s.get(v as usize).copied().unwrap_or(0.0),
            SlownessField::Cell(_) => 0.0,
        }
    }

    /// Effective slowness of cell `c` for the local traveltime update: the
    /// cell value, or the midpoint quadrature of the four vertex values
    /// (arithmetic in slowness, harmonic via mean velocity when `interp_vel`).
    pub fn cell_slowness_effective(&self, c: u32, interp_vel: bool) -> Float {
        match &self.slowness {
            SlownessField::Cell(s) => s[c as usize],
            SlownessField::Vertex(s) => {
                let tet = self.tetrahedra[c as usize];
                if interp_vel {
                    let vmean: Float =
                        tet.iter().map(|&v| 1.0 / s[v as usize]).sum::<Float>() / 4.0;
                    1.0 / vmean
                } else {
                    tet.iter().map(|&v| s[v as usize]).sum::<Float>() / 4.0
                }
            }
        }
    }

    /// Slowness at a point inside cell `c`: the cell value, or the barycentric
    /// interpolation of the vertex values.
    pub fn slowness_at(&self, c: u32, p: &Point3<Float>) -> Float {
        match &self.slowness {
            SlownessField::Cell(s) => s[c as usize],
            SlownessField::Vertex(s) => {
                let [a, b, cc, d] = self.tet_points(c);
                match barycentric(p, &a, &b, &cc, &d) {
                    Some(l) => {
                        let tet = self.tetrahedra[c as usize];
                        l.iter()
                            .zip(tet.iter())
                            .map(|(&li, &v)| li * s[v as usize])
                            .sum()
                    }
                    None => self.cell_slowness_effective(c, false),
                }
            }
        }
    }

    /// Largest slowness value of the installed field.
    pub fn max_slowness(&self) -> Float {
        match &self.slowness {
            SlownessField::Cell(s) | SlownessField::Vertex(s) => {
                s.iter().cloned().fold(0.0, Float::max)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube_mesh(n: usize) -> TetraMesh {
        let (vertices, tets) = TetraMesh::structured([n, n, n], 1.0 / n as Float);
        TetraMesh::new(vertices, tets, true).unwrap()
    }

    #[test]
    fn structured_counts() {
        let (vertices, tets) = TetraMesh::structured([2, 3, 4], 0.5);
        assert_eq!(vertices.len(), 3 * 4 * 5);
        assert_eq!(tets.len(), 6 * 2 * 3 * 4);
    }

    #[test]
    fn structured_volumes_fill_cube() {
        let (vertices, tets) = TetraMesh::structured([2, 2, 2], 0.5);
        let total: Float = tets
            .iter()
            .map(|t| {
                let [a, b, c, d] = t.map(|v| vertices[v as usize]);
                tet_volume(&a, &b, &c, &d).abs()
            })
            .sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn face_adjacency_is_symmetric() {
        let mesh = cube_mesh(2);
        for c in 0..mesh.n_cells() as u32 {
            for f in 0..4 {
                if let Some(nb) = mesh.neighbor(c, f) {
                    let back = (0..4).filter_map(|g| mesh.neighbor(nb, g)).any(|x| x == c);
                    assert!(back, "cell {} face {} neighbor {} has no back edge", c, f, nb);
                }
            }
        }
    }

    #[test]
    fn interior_faces_paired() {
        // 1x1x1 cube in 6 tets: 18 faces total, 12 on the boundary, 6 internal
        // pairings shared around the main diagonal.
        let mesh = cube_mesh(1);
        let boundary: usize = (0..mesh.n_cells() as u32)
            .map(|c| (0..4).filter(|&f| mesh.neighbor(c, f).is_none()).count())
            .sum();
        assert_eq!(boundary, 12);
    }

    #[test]
    fn locate_inside_and_outside() {
        let mesh = cube_mesh(3);
        let c = mesh.locate(&Point3::new(0.41, 0.33, 0.17)).unwrap();
        let [a, b, cc, d] = mesh.tet_points(c);
        let l = barycentric(&Point3::new(0.41, 0.33, 0.17), &a, &b, &cc, &d).unwrap();
        assert!(bary_inside(&l, 1e-9));
        assert!(mesh.locate(&Point3::new(1.5, 0.5, 0.5)).is_none());
        assert!(!mesh.is_inside(&Point3::new(-0.1, 0.0, 0.0)));
        // Corner of the box is inside within tolerance
        assert!(mesh.is_inside(&Point3::new(1.0, 1.0, 1.0)));
    }

    #[test]
    fn vertex_cells_cover_all_cells() {
        let mesh = cube_mesh(2);
        let mut count = 0usize;
        for v in 0..mesh.n_vertices() as u32 {
            count += mesh.cells_of_vertex(v).len();
        }
        // Each tet is listed once per corner
        assert_eq!(count, 4 * mesh.n_cells());
    }

    #[test]
    fn rejects_out_of_range_index() {
        let (vertices, mut tets) = TetraMesh::structured([1, 1, 1], 1.0);
        tets[0] = [0, 1, 2, 99];
        assert!(matches!(
            TetraMesh::new(vertices, tets, true),
            Err(RaytraceError::InvalidMesh(_))
        ));
    }

    #[test]
    fn rejects_duplicate_tet() {
        let (vertices, mut tets) = TetraMesh::structured([1, 1, 1], 1.0);
        tets[1] = tets[0];
        assert!(matches!(
            TetraMesh::new(vertices, tets, true),
            Err(RaytraceError::InvalidMesh(_))
        ));
    }

    #[test]
    fn rejects_repeated_vertex() {
        let (vertices, mut tets) = TetraMesh::structured([1, 1, 1], 1.0);
        let t = tets[0];
        tets[0] = [t[0], t[0], t[1], t[2]];
        assert!(matches!(
            TetraMesh::new(vertices, tets, true),
            Err(RaytraceError::InvalidMesh(_))
        ));
    }

    #[test]
    fn slowness_validation() {
        let mut mesh = cube_mesh(1);
        assert_eq!(mesh.n_params(), 6);
        assert!(!mesh.has_slowness());
        assert!(matches!(
            mesh.set_slowness(&[1.0; 5]),
            Err(RaytraceError::WrongSize { .. })
        ));
        assert!(matches!(
            mesh.set_slowness(&[1.0, 1.0, -1.0, 1.0, 1.0, 1.0]),
            Err(RaytraceError::InvalidSlowness { index: 2, .. })
        ));
        mesh.set_slowness(&[2.0; 6]).unwrap();
        assert!(mesh.has_slowness());
        assert_eq!(mesh.cell_slowness_effective(3, false), 2.0);
        assert_eq!(mesh.max_slowness(), 2.0);
    }

    #[test]
    fn vertex_slowness_interpolation() {
        let (vertices, tets) = TetraMesh::structured([1, 1, 1], 1.0);
        let n = vertices.len();
        let mut mesh = TetraMesh::new(vertices, tets, false).unwrap();
        assert_eq!(mesh.n_params(), n);
        mesh.set_slowness(&vec![2.0; n]).unwrap();
        // Constant field interpolates to itself everywhere
        let p = Point3::new(0.3, 0.4, 0.2);
        let c = mesh.locate(&p).unwrap();
        assert!((mesh.slowness_at(c, &p) - 2.0).abs() < 1e-12);
        assert!((mesh.cell_slowness_effective(c, false) - 2.0).abs() < 1e-12);
        assert!((mesh.cell_slowness_effective(c, true) - 2.0).abs() < 1e-12);
    }
}
