// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use nalgebra::{Matrix3, Point3, Vector3};

/// Scalar type used throughout the crate. Single precision is a build-time
/// change of this alias.
pub type Float = f64;

/// Barycentric coordinates smaller than -BARY_TOL count as outside.
pub const BARY_TOL: Float = 1e-9;

/// Signed volume of the tetrahedron (a, b, c, d). Positive when (b-a, c-a, d-a)
/// form a right-handed frame.
pub fn tet_volume(a: &Point3<Float>, b: &Point3<Float>, c: &Point3<Float>, d: &Point3<Float>) -> Float {
    (b - a).cross(&(c - a)).dot(&(d - a)) / 6.0
}

/// Barycentric coordinates of `p` with respect to the tetrahedron (a, b, c, d).
/// Returns `None` for a degenerate tetrahedron.
pub fn barycentric(
    p: &Point3<Float>,
    a: &Point3<Float>,
    b: &Point3<Float>,
    c: &Point3<Float>,
    d: &Point3<Float>,
) -> Option<[Float; 4]> {
    let m = Matrix3::from_columns(&[b - a, c - a, d - a]);
    let x = m.lu().solve(&(p - a))?;
    Some([1.0 - x[0] - x[1] - x[2], x[0], x[1], x[2]])
}

/// Whether all barycentric coordinates are within the tolerance of [0, 1].
pub fn bary_inside(lambda: &[Float; 4], tol: Float) -> bool {
    lambda.iter().all(|&l| l >= -tol)
}

/// Intersection of the ray `origin + t*dir` (t > 0) with the triangle
/// (a, b, c), via Moller-Trumbore. Returns the ray parameter `t`.
pub fn ray_triangle(
    origin: &Point3<Float>,
    dir: &Vector3<Float>,
    a: &Point3<Float>,
    b: &Point3<Float>,
    c: &Point3<Float>,
) -> Option<Float> {
    let e1 = b - a;
    let e2 = c - a;
    let pvec = dir.cross(&e2);
    let det = e1.dot(&pvec);
    if det.abs() < 1e-14 {
        return None;
    }
    let inv_det = 1.0 / det;
    let tvec = origin - a;
    let u = tvec.dot(&pvec) * inv_det;
    if !(-BARY_TOL..=1.0 + BARY_TOL).contains(&u) {
        return None;
    }
    let qvec = tvec.cross(&e1);
    let v = dir.dot(&qvec) * inv_det;
    if v < -BARY_TOL || u + v > 1.0 + BARY_TOL {
        return None;
    }
    let t = e2.dot(&qvec) * inv_det;
    if t > 0.0 {
        Some(t)
    } else {
        None
    }
}

/// Unsigned distance from `p` to the plane spanned by the triangle (a, b, c).
/// Returns `None` for a degenerate triangle.
pub fn point_plane_distance(
    p: &Point3<Float>,
    a: &Point3<Float>,
    b: &Point3<Float>,
    c: &Point3<Float>,
) -> Option<Float> {
    let n = (b - a).cross(&(c - a));
    let norm = n.norm();
    if norm < 1e-14 {
        return None;
    }
    Some((p - a).dot(&n).abs() / norm)
}

/// Point at the barycentric combination of the four tetrahedron corners.
pub fn bary_point(
    lambda: &[Float; 4],
    a: &Point3<Float>,
    b: &Point3<Float>,
    c: &Point3<Float>,
    d: &Point3<Float>,
) -> Point3<Float> {
    Point3::from(
        a.coords * lambda[0] + b.coords * lambda[1] + c.coords * lambda[2] + d.coords * lambda[3],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_tet() -> [Point3<Float>; 4] {
        [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
        ]
    }

    #[test]
    fn volume_unit_tet() {
        let [a, b, c, d] = unit_tet();
        assert!((tet_volume(&a, &b, &c, &d) - 1.0 / 6.0).abs() < 1e-14);
        // Swapping two vertices flips the sign
        assert!((tet_volume(&a, &c, &b, &d) + 1.0 / 6.0).abs() < 1e-14);
    }

    #[test]
    fn barycentric_corners_and_centroid() {
        let [a, b, c, d] = unit_tet();
        let l = barycentric(&a, &a, &b, &c, &d).unwrap();
        assert!((l[0] - 1.0).abs() < 1e-12);
        let centroid = Point3::new(0.25, 0.25, 0.25);
        let l = barycentric(&centroid, &a, &b, &c, &d).unwrap();
        for li in l {
            assert!((li - 0.25).abs() < 1e-12);
        }
        assert!(bary_inside(&l, BARY_TOL));
    }

    #[test]
    fn barycentric_outside() {
        let [a, b, c, d] = unit_tet();
        let p = Point3::new(2.0, 0.0, 0.0);
        let l = barycentric(&p, &a, &b, &c, &d).unwrap();
        assert!(!bary_inside(&l, BARY_TOL));
    }

    #[test]
    fn barycentric_degenerate() {
        let a = Point3::new(0.0, 0.0, 0.0);
        let b = Point3::new(1.0, 0.0, 0.0);
        let c = Point3::new(2.0, 0.0, 0.0);
        let d = Point3::new(3.0, 0.0, 0.0);
        assert!(barycentric(&Point3::new(0.5, 0.0, 0.0), &a, &b, &c, &d).is_none());
    }

    #[test]
    fn bary_point_roundtrip() {
        let [a, b, c, d] = unit_tet();
        let p = Point3::new(0.1, 0.2, 0.3);
        let l = barycentric(&p, &a, &b, &c, &d).unwrap();
        let q = bary_point(&l, &a, &b, &c, &d);
        assert!((p - q).norm() < 1e-12);
    }

    #[test]
    fn ray_triangle_hit() {
        let a = Point3::new(0.0, 0.0, 1.0);
        let b = Point3::new(1.0, 0.0, 1.0);
        let c = Point3::new(0.0, 1.0, 1.0);
        let origin = Point3::new(0.2, 0.2, 0.0);
        let dir = Vector3::new(0.0, 0.0, 1.0);
        let t = ray_triangle(&origin, &dir, &a, &b, &c).unwrap();
        assert!((t - 1.0).abs() < 1e-12);
    }

    #[test]
    fn ray_triangle_miss() {
        let a = Point3::new(0.0, 0.0, 1.0);
        let b = Point3::new(1.0, 0.0, 1.0);
        let c = Point3::new(0.0, 1.0, 1.0);
        // Outside the triangle
        let origin = Point3::new(0.9, 0.9, 0.0);
        let dir = Vector3::new(0.0, 0.0, 1.0);
        assert!(ray_triangle(&origin, &dir, &a, &b, &c).is_none());
        // Behind the origin
        let origin = Point3::new(0.2, 0.2, 2.0);
        assert!(ray_triangle(&origin, &dir, &a, &b, &c).is_none());
    }

    #[test]
    fn plane_distance() {
        let a = Point3::new(0.0, 0.0, 0.0);
        let b = Point3::new(1.0, 0.0, 0.0);
        let c = Point3::new(0.0, 1.0, 0.0);
        let p = Point3::new(0.3, 0.3, 2.5);
        assert!((point_plane_distance(&p, &a, &b, &c).unwrap() - 2.5).abs() < 1e-12);
    }
}
