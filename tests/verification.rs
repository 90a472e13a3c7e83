// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use nalgebra::Point3;

use tetray::raypath::integrate_slowness;
use tetray::{
    Config, Float, Method, RaytraceError, Raytracer, Receiver, Source, TetraMesh, TraceOptions,
};

/// Unit cube split into 6n^3 tetrahedra with uniform slowness.
fn cube_tracer(n: usize, slowness: Float, config: Config) -> Raytracer {
    let h = 1.0 / n as Float;
    let (vertices, tets) = TetraMesh::structured([n, n, n], h);
    let mut tracer = Raytracer::new(vertices, tets, config).unwrap();
    let field = vec![slowness; tracer.n_params()];
    tracer.set_slowness(&field).unwrap();
    tracer
}

/// Test 1: homogeneous unit cube, edge-aligned source/receiver pair.
/// FSM follows the chain of collinear updates exactly; SPM is bounded by the
/// secondary-node sampling.
#[test]
fn homogeneous_cube_fsm() {
    let mut tracer = cube_tracer(4, 1.0, Config::default());
    let out = tracer
        .raytrace(
            &[Source::at(0.0, 0.0, 0.0)],
            &[Receiver::at(1.0, 0.0, 0.0)],
            &TraceOptions::default(),
        )
        .unwrap();
    assert!(
        (out.traveltimes[0] - 1.0).abs() < 1e-6,
        "fsm tt = {}",
        out.traveltimes[0]
    );
}

#[test]
fn homogeneous_cube_spm() {
    let mut tracer = cube_tracer(
        4,
        1.0,
        Config {
            method: Method::ShortestPath,
            n_secondary: 2,
            ..Config::default()
        },
    );
    let out = tracer
        .raytrace(
            &[Source::at(0.0, 0.0, 0.0)],
            &[Receiver::at(1.0, 0.0, 0.0)],
            &TraceOptions::default(),
        )
        .unwrap();
    assert!(
        (out.traveltimes[0] - 1.0).abs() < 0.01,
        "spm tt = {}",
        out.traveltimes[0]
    );
}

#[test]
fn homogeneous_cube_dspm() {
    let mut tracer = cube_tracer(
        4,
        1.0,
        Config {
            method: Method::DynamicShortestPath,
            n_secondary: 2,
            n_tertiary: 2,
            radius_tertiary: 0.5,
            ..Config::default()
        },
    );
    let out = tracer
        .raytrace(
            &[Source::at(0.0, 0.0, 0.0)],
            &[Receiver::at(1.0, 1.0, 1.0)],
            &TraceOptions::default(),
        )
        .unwrap();
    let exact = 3.0_f64.sqrt();
    assert!(out.traveltimes[0] >= exact - 1e-9);
    assert!(
        out.traveltimes[0] - exact < 0.05,
        "dspm tt = {}",
        out.traveltimes[0]
    );
}

/// Test 2: layered slowness (top half 1, bottom half 2), vertical ray.
#[test]
fn layered_slowness_vertical_ray() {
    let n = 4;
    let h = 1.0 / n as Float;
    let (vertices, tets) = TetraMesh::structured([n, n, n], h);
    // Per-cell slowness by centroid depth
    let slowness: Vec<Float> = tets
        .iter()
        .map(|t| {
            let z = t
                .iter()
                .map(|&v| vertices[v as usize].z)
                .sum::<Float>()
                / 4.0;
            if z > 0.5 {
                1.0
            } else {
                2.0
            }
        })
        .collect();
    let mut tracer = Raytracer::new(vertices, tets, Config::default()).unwrap();
    tracer.set_slowness(&slowness).unwrap();
    let out = tracer
        .raytrace(
            &[Source::at(0.5, 0.5, 1.0)],
            &[Receiver::at(0.5, 0.5, 0.0)],
            &TraceOptions::default(),
        )
        .unwrap();
    assert!(
        (out.traveltimes[0] - 1.5).abs() < 0.05,
        "layered tt = {}",
        out.traveltimes[0]
    );
}

/// Test 3: origin-time offset shifts the receiver traveltime.
#[test]
fn origin_time_offset() {
    let mut tracer = cube_tracer(4, 1.0, Config::default());
    let out = tracer
        .raytrace(
            &[Source::with_t0(5.0, 0.0, 0.0, 0.0)],
            &[Receiver::at(1.0, 0.0, 0.0)],
            &TraceOptions::default(),
        )
        .unwrap();
    assert!((out.traveltimes[0] - 6.0).abs() < 1e-6);
}

/// Origin-time shift property: T(t0 + d) - T(t0) = d.
#[test]
fn origin_time_shift_property() {
    let mut tracer = cube_tracer(3, 1.0, Config::default());
    let rcvs = [
        Receiver::at(0.9, 0.3, 0.2),
        Receiver::at(0.2, 0.8, 0.6),
        Receiver::at(0.5, 0.5, 0.5),
    ];
    let src = |t0: Float| [Source::with_t0(t0, 0.1, 0.1, 0.1); 3];
    let base = tracer
        .raytrace(&src(0.0), &rcvs, &TraceOptions::default())
        .unwrap();
    let shifted = tracer
        .raytrace(&src(2.5), &rcvs, &TraceOptions::default())
        .unwrap();
    for (a, b) in base.traveltimes.iter().zip(shifted.traveltimes.iter()) {
        assert!((b - a - 2.5).abs() < 1e-9);
    }
}

/// Slowness scaling property: scaling the field by k scales traveltime
/// differences by k.
#[test]
fn slowness_scaling_property() {
    let k = 3.0;
    let rcvs = [Receiver::at(0.9, 0.3, 0.2), Receiver::at(0.4, 0.7, 0.8)];
    let srcs = [Source::at(0.1, 0.1, 0.1), Source::at(0.1, 0.1, 0.1)];
    let mut t1 = cube_tracer(3, 1.0, Config::default());
    let mut tk = cube_tracer(3, k, Config::default());
    let base = t1.raytrace(&srcs, &rcvs, &TraceOptions::default()).unwrap();
    let scaled = tk.raytrace(&srcs, &rcvs, &TraceOptions::default()).unwrap();
    for (a, b) in base.traveltimes.iter().zip(scaled.traveltimes.iter()) {
        assert!((b - k * a).abs() < 1e-9, "{} vs k*{}", b, a);
    }
}

/// Triangle inequality between receivers in a homogeneous medium.
#[test]
fn triangle_inequality() {
    let s_max = 2.0;
    let mut tracer = cube_tracer(3, s_max, Config::default());
    let a = Point3::new(0.8, 0.2, 0.3);
    let b = Point3::new(0.3, 0.7, 0.6);
    let srcs = [Source::at(0.1, 0.1, 0.1), Source::at(0.1, 0.1, 0.1)];
    let rcvs = [
        Receiver::at(a.x, a.y, a.z),
        Receiver::at(b.x, b.y, b.z),
    ];
    let out = tracer.raytrace(&srcs, &rcvs, &TraceOptions::default()).unwrap();
    let d = (a - b).norm();
    assert!(out.traveltimes[0] <= out.traveltimes[1] + s_max * d + 1e-9);
    assert!(out.traveltimes[1] <= out.traveltimes[0] + s_max * d + 1e-9);
}

/// Test 4: out-of-grid source aborts with OutOfGrid.
#[test]
fn out_of_grid_source() {
    let mut tracer = cube_tracer(2, 1.0, Config::default());
    let err = tracer.raytrace(
        &[Source::at(2.0, 0.0, 0.0)],
        &[Receiver::at(0.5, 0.5, 0.5)],
        &TraceOptions::default(),
    );
    assert!(matches!(
        err,
        Err(RaytraceError::OutOfGrid { what: "source", .. })
    ));
}

/// Test 5: DSPM cannot aggregate sources.
#[test]
fn dspm_aggregate_incompatible() {
    let mut tracer = cube_tracer(
        2,
        1.0,
        Config {
            method: Method::DynamicShortestPath,
            ..Config::default()
        },
    );
    let err = tracer.raytrace(
        &[Source::at(0.1, 0.1, 0.1), Source::at(0.9, 0.9, 0.9)],
        &[Receiver::at(0.5, 0.5, 0.5)],
        &TraceOptions {
            aggregate_src: true,
            ..TraceOptions::default()
        },
    );
    assert!(matches!(err, Err(RaytraceError::IncompatibleOptions(_))));
}

/// Test 6: identical outputs regardless of the worker pool size.
#[test]
fn parallel_equivalence() {
    let srcs: Vec<Source> = (0..8)
        .map(|i| Source::at(0.1 + 0.1 * i as Float, 0.1, 0.1))
        .collect();
    let rcvs: Vec<Receiver> = (0..8)
        .map(|i| Receiver::at(0.9 - 0.1 * i as Float, 0.8, 0.9))
        .collect();

    let mut serial = cube_tracer(3, 1.0, Config::default());
    let mut parallel = cube_tracer(
        3,
        1.0,
        Config {
            nthreads: 4,
            ..Config::default()
        },
    );
    let out1 = serial.raytrace(&srcs, &rcvs, &TraceOptions::default()).unwrap();
    let out4 = parallel
        .raytrace(&srcs, &rcvs, &TraceOptions::default())
        .unwrap();
    for (a, b) in out1.traveltimes.iter().zip(out4.traveltimes.iter()) {
        assert_eq!(a.to_bits(), b.to_bits(), "{} != {}", a, b);
    }
}

/// Raypath endpoints: first point is the receiver, last point is a source.
#[test]
fn raypath_endpoints() {
    let mut tracer = cube_tracer(3, 1.0, Config::default());
    let src = Point3::new(0.1, 0.1, 0.1);
    let rcv = Point3::new(0.9, 0.8, 0.7);
    let out = tracer
        .raytrace(
            &[Source::at(src.x, src.y, src.z)],
            &[Receiver::at(rcv.x, rcv.y, rcv.z)],
            &TraceOptions {
                return_rays: true,
                ..TraceOptions::default()
            },
        )
        .unwrap();
    let rays = out.raypaths.unwrap();
    let path = &rays[0];
    assert!(!path.is_empty(), "raypath failed");
    assert_eq!(path[0], rcv);
    assert!((path[path.len() - 1] - src).norm() < 1e-9);
    // Consecutive points stay inside the mesh
    for p in path {
        assert!(tracer.mesh().is_inside(p));
    }
}

/// Raypath-traveltime consistency with tt_from_rp: the reported traveltime is
/// the slowness integral along the returned polyline plus the origin time.
#[test]
fn tt_from_rp_consistency() {
    let s = 1.3;
    let t0 = 0.4;
    let min_dist = 1e-5;
    let mut tracer = cube_tracer(
        3,
        s,
        Config {
            method: Method::ShortestPath,
            tt_from_rp: true,
            min_dist,
            ..Config::default()
        },
    );
    let out = tracer
        .raytrace(
            &[Source::with_t0(t0, 0.1, 0.1, 0.1)],
            &[Receiver::at(0.9, 0.5, 0.3)],
            &TraceOptions {
                return_rays: true,
                ..TraceOptions::default()
            },
        )
        .unwrap();
    let rays = out.raypaths.unwrap();
    let path = &rays[0];
    assert!(!path.is_empty());
    let integral = integrate_slowness(tracer.mesh(), path);
    assert!(
        (out.traveltimes[0] - t0 - integral).abs() <= 10.0 * min_dist * s,
        "tt {} vs integral {}",
        out.traveltimes[0] - t0,
        integral
    );
    // And the integral itself should be close to the geometric value
    let direct = s * (Point3::<Float>::new(0.9, 0.5, 0.3) - Point3::<Float>::new(0.1, 0.1, 0.1)).norm();
    assert!((integral - direct).abs() < 0.1 * direct);
}

/// Grid-level query returns the per-vertex field of the requested worker.
#[test]
fn traveltime_field_query() {
    let mut tracer = cube_tracer(3, 1.0, Config::default());
    tracer
        .raytrace(
            &[Source::at(0.0, 0.0, 0.0)],
            &[Receiver::at(1.0, 1.0, 1.0)],
            &TraceOptions::default(),
        )
        .unwrap();
    let field = tracer.traveltime_field(0).unwrap();
    assert_eq!(field.len(), tracer.mesh().n_vertices());
    // Causality against the homogeneous analytical solution
    for v in 0..tracer.mesh().n_vertices() as u32 {
        let d = tracer.mesh().vertex(v).coords.norm();
        assert!(field[v as usize] >= d - 1e-9);
    }
    assert!(matches!(
        tracer.traveltime_field(3),
        Err(RaytraceError::ThreadOutOfRange { .. })
    ));
}

/// Vertex-slowness field with velocity interpolation on a homogeneous medium
/// matches the cell-slowness result.
#[test]
fn vertex_slowness_interp_vel() {
    let n = 3;
    let h = 1.0 / n as Float;
    let (vertices, tets) = TetraMesh::structured([n, n, n], h);
    let nv = vertices.len();
    let mut tracer = Raytracer::new(
        vertices,
        tets,
        Config {
            cell_slowness: false,
            interp_vel: true,
            ..Config::default()
        },
    )
    .unwrap();
    tracer.set_slowness(&vec![2.0; nv]).unwrap();
    let out = tracer
        .raytrace(
            &[Source::at(0.0, 0.0, 0.0)],
            &[Receiver::at(1.0, 0.0, 0.0)],
            &TraceOptions::default(),
        )
        .unwrap();
    assert!((out.traveltimes[0] - 2.0).abs() < 1e-6);
}

/// Event-id grouping pairs each receiver with its own event's sources.
#[test]
fn event_grouping_pairs_receivers() {
    let mut tracer = cube_tracer(3, 1.0, Config::default());
    // Two events with different origin times at the same position
    let srcs = [
        Source::with_t0(0.0, 0.1, 0.1, 0.1).event(1),
        Source::with_t0(10.0, 0.1, 0.1, 0.1).event(2),
    ];
    let rcvs = [
        Receiver::at(0.9, 0.1, 0.1).event(1),
        Receiver::at(0.9, 0.1, 0.1).event(2),
    ];
    let out = tracer.raytrace(&srcs, &rcvs, &TraceOptions::default()).unwrap();
    assert!((out.traveltimes[1] - out.traveltimes[0] - 10.0).abs() < 1e-9);
}
