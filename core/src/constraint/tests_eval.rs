use crate::constraint::eval::{evaluate, residual, EvalContext, EvalFailure, LocalLayout};
use crate::constraint::{ConstraintKind, CurveId, JointFrame, NoCurves, PointRef};
use crate::store::{EntityStore, Geometry};
use crate::test_support::CircleCurves;
use crate::units::{AngleUnit, LengthUnit, Unit};

fn local(store: &EntityStore, kind: &ConstraintKind) -> (LocalLayout, Vec<f64>) {
    let layout = LocalLayout::for_constraint(kind, |id| store.kind(id).ok()).unwrap();
    let x: Vec<f64> = layout.slots().iter().flat_map(|s| store.params(s.entity).unwrap()).collect();
    (layout, x)
}

/// Compare the analytic Jacobian with central differences of the residual.
fn check_jacobian(store: &EntityStore, kind: &ConstraintKind, ctx: &EvalContext<'_>) {
    let (layout, x) = local(store, kind);
    let (r, jac) = evaluate(kind, &layout, &x, ctx).unwrap();
    assert_eq!(r.len(), kind.validate(store).unwrap(), "{} row count", kind.name());
    assert_eq!(jac.ncols(), x.len());

    let h = 1e-6;
    let mut shifted = x.clone();
    for j in 0..x.len() {
        shifted[j] = x[j] + h;
        let fp = residual(kind, &layout, &shifted, ctx).unwrap();
        shifted[j] = x[j] - h;
        let fm = residual(kind, &layout, &shifted, ctx).unwrap();
        shifted[j] = x[j];
        for i in 0..r.len() {
            let fd = (fp[i] - fm[i]) / (2.0 * h);
            assert!(
                (fd - jac[(i, j)]).abs() < 1e-5,
                "{} d r{} / d x{}: analytic {} vs fd {}",
                kind.name(),
                i,
                j,
                jac[(i, j)],
                fd
            );
        }
    }
}

#[test]
fn test_sketch_jacobians_match_finite_differences() {
    let mut store = EntityStore::new();
    let p = store.add(Geometry::point2(1.0, 2.0)).unwrap();
    let q = store.add(Geometry::point2(4.0, -1.5)).unwrap();
    let l1 = store.add(Geometry::line([0.5, 0.2], [2.0, 0.7])).unwrap();
    let l2 = store.add(Geometry::line([-1.0, 3.0], [0.3, 1.9])).unwrap();
    let c1 = store.add(Geometry::circle([3.0, 4.0], 1.5)).unwrap();
    let c2 = store.add(Geometry::circle([9.0, 4.5], 2.5)).unwrap();
    let arc = store
        .add(Geometry::Arc { center: [1.0, 1.0], radius: 2.0, start_angle: 0.3, end_angle: 2.1 })
        .unwrap();

    let kinds = vec![
        ConstraintKind::Coincident { a: p.into(), b: q.into() },
        ConstraintKind::Coincident { a: PointRef::start(arc), b: PointRef::from(l1) },
        ConstraintKind::distance(p, q, 5.0, LengthUnit::Millimeter),
        ConstraintKind::distance(PointRef::end(arc), q, 5.0, LengthUnit::Millimeter),
        ConstraintKind::horizontal_distance(p, q, 2.0, LengthUnit::Millimeter),
        ConstraintKind::vertical_distance(p, q, 2.0, LengthUnit::Millimeter),
        ConstraintKind::Horizontal { line: l1 },
        ConstraintKind::Vertical { line: l2 },
        ConstraintKind::Parallel { a: l1, b: l2 },
        ConstraintKind::Perpendicular { a: l1, b: l2 },
        ConstraintKind::angle(l1, l2, 30.0, AngleUnit::Degrees),
        ConstraintKind::Tangent { a: l1, b: c1 },
        ConstraintKind::Tangent { a: c2, b: l2 },
        ConstraintKind::Tangent { a: c1, b: c2 },
        ConstraintKind::Tangent { a: arc, b: c1 },
        ConstraintKind::PointOnLine { point: p.into(), line: l2 },
        ConstraintKind::distance_point_line(q, l1, 1.0, LengthUnit::Millimeter),
        ConstraintKind::radius(c1, 2.0, LengthUnit::Millimeter),
        ConstraintKind::EqualRadius { a: c1, b: arc },
        ConstraintKind::Fix { point: PointRef::end(arc), position: [1.0, 1.0, 0.0] },
        ConstraintKind::Symmetric { a: p.into(), b: q.into(), axis: l2 },
    ];

    let ctx = EvalContext { curves: &NoCurves, fd_step: 1e-7 };
    for kind in &kinds {
        check_jacobian(&store, kind, &ctx);
    }
}

#[test]
fn test_spatial_jacobians_match_finite_differences() {
    let mut store = EntityStore::new();
    let a = store.add(Geometry::Axis { origin: [0.0, 0.0, 0.0], direction: [0.2, 0.3, 1.0] }).unwrap();
    let n = store.add(Geometry::Plane { origin: [1.0, 0.0, 0.0], normal: [1.0, -0.4, 0.2] }).unwrap();
    let p = store.add(Geometry::point3(1.0, 2.0, 3.0)).unwrap();
    let q = store.add(Geometry::point3(-1.0, 0.5, 2.0)).unwrap();
    let b1 = store.add(Geometry::Body { origin: [0.0, 0.0, 0.0], rotation: [0.1, -0.2, 0.3] }).unwrap();
    let b2 = store.add(Geometry::Body { origin: [0.5, 0.2, 1.0], rotation: [0.0, 0.4, 0.9] }).unwrap();
    let frame = JointFrame::new([0.1, 0.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]).unwrap();

    let kinds = vec![
        ConstraintKind::Coincident { a: p.into(), b: q.into() },
        ConstraintKind::distance(p, q, 2.0, LengthUnit::Millimeter),
        ConstraintKind::Parallel { a, b: n },
        ConstraintKind::Perpendicular { a, b: n },
        ConstraintKind::angle(a, n, 45.0, AngleUnit::Degrees),
        ConstraintKind::Fix { point: p.into(), position: [0.0, 0.0, 0.0] },
        ConstraintKind::revolute(b1, b2, frame, frame).with_target(20.0, Unit::Angle(AngleUnit::Degrees)),
        ConstraintKind::prismatic(b1, b2, frame, frame).with_target(3.0, Unit::Length(LengthUnit::Millimeter)),
        ConstraintKind::cylindrical(b1, b2, frame, frame),
    ];

    let ctx = EvalContext { curves: &NoCurves, fd_step: 1e-7 };
    for kind in &kinds {
        check_jacobian(&store, kind, &ctx);
    }
}

#[test]
fn test_curve_constraints_use_the_oracle() {
    let mut store = EntityStore::new();
    let p = store.add(Geometry::point2(4.0, 3.0)).unwrap();
    let u = store.add(Geometry::Scalar { value: 0.6 }).unwrap();
    let line = store.add(Geometry::line([5.0, 0.0], [0.0, 1.0])).unwrap();
    let curve = CurveId(5);

    let on_curve = ConstraintKind::PointOnCurve { point: p.into(), curve, param: u };
    let tangent = ConstraintKind::TangentToCurve { line, curve, param: u };

    let ctx = EvalContext { curves: &CircleCurves, fd_step: 1e-7 };
    check_jacobian(&store, &on_curve, &ctx);
    check_jacobian(&store, &tangent, &ctx);

    let missing = EvalContext { curves: &NoCurves, fd_step: 1e-7 };
    let (layout, x) = local(&store, &on_curve);
    assert_eq!(residual(&on_curve, &layout, &x, &missing), Err(EvalFailure::Curve(curve)));
}

#[test]
fn test_line_circle_tangent_residual() {
    // Horizontal line y = 10 touches the circle of radius 10 at the origin.
    let mut store = EntityStore::new();
    let c = store.add(Geometry::circle([0.0, 0.0], 10.0)).unwrap();
    let l = store.add(Geometry::line([-3.0, 10.0], [4.0, 0.0])).unwrap();
    let kind = ConstraintKind::Tangent { a: c, b: l };

    let (layout, x) = local(&store, &kind);
    let ctx = EvalContext { curves: &NoCurves, fd_step: 1e-7 };
    let r = residual(&kind, &layout, &x, &ctx).unwrap();
    assert!(r[0].abs() < 1e-12);
}

#[test]
fn test_degenerate_geometry_is_reported() {
    let mut store = EntityStore::new();
    let p = store.add(Geometry::point2(1.0, 1.0)).unwrap();
    let q = store.add(Geometry::point2(1.0, 1.0)).unwrap();
    let c1 = store.add(Geometry::circle([0.0, 0.0], 1.0)).unwrap();
    let c2 = store.add(Geometry::circle([0.0, 0.0], 2.0)).unwrap();
    let ctx = EvalContext { curves: &NoCurves, fd_step: 1e-7 };

    let dist = ConstraintKind::distance(p, q, 5.0, LengthUnit::Millimeter);
    let (layout, x) = local(&store, &dist);
    assert_eq!(evaluate(&dist, &layout, &x, &ctx).unwrap_err(), EvalFailure::Degenerate);

    // Zero distance between coincident points is satisfied, not degenerate.
    let zero = ConstraintKind::distance(p, q, 0.0, LengthUnit::Millimeter);
    let (layout, x) = local(&store, &zero);
    assert!(evaluate(&zero, &layout, &x, &ctx).is_ok());

    let concentric = ConstraintKind::Tangent { a: c1, b: c2 };
    let (layout, x) = local(&store, &concentric);
    assert_eq!(evaluate(&concentric, &layout, &x, &ctx).unwrap_err(), EvalFailure::Degenerate);
}

/// The squared residual norm does not depend on which orthogonal basis a
/// directional row uses, so `2 J^T r` can be checked against its differences
/// even where the basis choice flips.
fn check_gradient_of_norm(store: &EntityStore, kind: &ConstraintKind) {
    let ctx = EvalContext { curves: &NoCurves, fd_step: 1e-7 };
    let (layout, x) = local(store, kind);
    let (r, jac) = evaluate(kind, &layout, &x, &ctx).unwrap();
    let norm2 = |p: &[f64]| residual(kind, &layout, p, &ctx).unwrap().iter().map(|v| v * v).sum::<f64>();

    let h = 1e-6;
    let mut shifted = x.clone();
    for j in 0..x.len() {
        let analytic: f64 = (0..r.len()).map(|i| 2.0 * r[i] * jac[(i, j)]).sum();
        shifted[j] = x[j] + h;
        let fp = norm2(&shifted);
        shifted[j] = x[j] - h;
        let fm = norm2(&shifted);
        shifted[j] = x[j];
        let fd = (fp - fm) / (2.0 * h);
        assert!((fd - analytic).abs() < 1e-5, "{} column {}: {} vs {}", kind.name(), j, analytic, fd);
    }
}

#[test]
fn test_directional_jacobians_at_tied_components() {
    let mut store = EntityStore::new();
    let tied = store.add(Geometry::Axis { origin: [0.0; 3], direction: [0.3, 0.3, 1.0] }).unwrap();
    let diagonal = store.add(Geometry::Axis { origin: [0.0; 3], direction: [1.0, 1.0, 1.0] }).unwrap();
    let z = store.add(Geometry::Axis { origin: [0.0; 3], direction: [0.0, 0.0, 1.0] }).unwrap();
    // Identity rotation puts both joint axes on world z, where x and y tie
    let b1 = store.add(Geometry::Body { origin: [0.0; 3], rotation: [0.0; 3] }).unwrap();
    let b2 = store.add(Geometry::Body { origin: [0.3, 0.1, 0.5], rotation: [0.2, -0.1, 0.4] }).unwrap();
    let frame = JointFrame::default();

    let kinds = vec![
        ConstraintKind::Parallel { a: tied, b: z },
        ConstraintKind::Parallel { a: diagonal, b: z },
        ConstraintKind::revolute(b1, b2, frame, frame),
        ConstraintKind::prismatic(b1, b2, frame, frame),
        ConstraintKind::cylindrical(b1, b2, frame, frame),
    ];
    for kind in &kinds {
        check_gradient_of_norm(&store, kind);
    }
}
