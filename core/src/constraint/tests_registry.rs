use crate::constraint::{ConstraintKind, ConstraintSet, CurveId, JointFrame, JointLimits, PointRef};
use crate::error::SolverError;
use crate::store::{EntityKind, EntityStore, Geometry};
use crate::units::{AngleUnit, LengthUnit, Unit};

#[test]
fn test_add_validates_references() {
    let mut store = EntityStore::new();
    let mut set = ConstraintSet::new();
    let p = store.add(Geometry::point2(0.0, 0.0)).unwrap();
    let q = store.add(Geometry::point3(1.0, 0.0, 0.0)).unwrap();
    let c = store.add(Geometry::circle([0.0, 0.0], 1.0)).unwrap();
    let l = store.add(Geometry::line([0.0, 0.0], [1.0, 0.0])).unwrap();

    // 2D point against 3D point
    assert!(matches!(
        set.add(&store, ConstraintKind::Coincident { a: p.into(), b: q.into() }),
        Err(SolverError::DimensionMismatch { left: 2, right: 3, .. })
    ));

    // A circle has no direction
    assert!(matches!(
        set.add(&store, ConstraintKind::Horizontal { line: c }),
        Err(SolverError::IncompatibleEntity { found: EntityKind::Circle, .. })
    ));

    // Only arcs have start/end points
    assert!(matches!(
        set.add(&store, ConstraintKind::Coincident { a: PointRef::start(l), b: p.into() }),
        Err(SolverError::InvalidPointRef { index: 1, .. })
    ));

    // Two lines cannot be tangent
    assert!(set.add(&store, ConstraintKind::Tangent { a: l, b: l }).is_err());

    assert!(matches!(
        set.add(&store, ConstraintKind::distance(p, c, f64::NAN, LengthUnit::Millimeter)),
        Err(SolverError::NonFiniteConstant("Distance"))
    ));

    store.remove(q).unwrap();
    assert!(matches!(
        set.add(&store, ConstraintKind::Fix { point: q.into(), position: [0.0; 3] }),
        Err(SolverError::StaleEntity(_))
    ));
    assert!(set.is_empty());
    assert_eq!(set.revision(), 0, "rejected constraints do not bump the revision");
}

#[test]
fn test_rows_match_dof_removed() {
    let mut store = EntityStore::new();
    let mut set = ConstraintSet::new();
    let a = store.add(Geometry::Axis { origin: [0.0; 3], direction: [0.0, 0.0, 1.0] }).unwrap();
    let b = store.add(Geometry::Axis { origin: [0.0; 3], direction: [1.0, 0.0, 0.0] }).unwrap();
    let l1 = store.add(Geometry::line([0.0, 0.0], [1.0, 0.0])).unwrap();
    let l2 = store.add(Geometry::line([0.0, 0.0], [0.0, 1.0])).unwrap();
    let u = store.add(Geometry::Scalar { value: 0.0 }).unwrap();
    let b1 = store.add(Geometry::Body { origin: [0.0; 3], rotation: [0.0; 3] }).unwrap();
    let b2 = store.add(Geometry::Body { origin: [0.0; 3], rotation: [0.0; 3] }).unwrap();
    let f = JointFrame::default();

    let cases = [
        (ConstraintKind::Parallel { a, b }, 2),
        (ConstraintKind::Parallel { a: l1, b: l2 }, 1),
        (ConstraintKind::Coincident { a: a.into(), b: b.into() }, 3),
        (ConstraintKind::TangentToCurve { line: l1, curve: CurveId(1), param: u }, 2),
        (ConstraintKind::PointOnCurve { point: l1.into(), curve: CurveId(1), param: u }, 2),
        (ConstraintKind::revolute(b1, b2, f, f), 5),
        (ConstraintKind::revolute(b1, b2, f, f).with_target(10.0, Unit::Angle(AngleUnit::Degrees)), 6),
        (ConstraintKind::prismatic(b1, b2, f, f).with_target(2.0, Unit::Length(LengthUnit::Millimeter)), 6),
        (ConstraintKind::cylindrical(b1, b2, f, f), 4),
    ];
    for (kind, rows) in cases {
        let name = kind.name();
        let id = set.add(&store, kind).unwrap();
        assert_eq!(set.get(id).unwrap().dof_removed(), rows, "{name}");
    }
}

#[test]
fn test_builders_convert_units() {
    let mut store = EntityStore::new();
    let p = store.add(Geometry::point2(0.0, 0.0)).unwrap();
    let q = store.add(Geometry::point2(1.0, 0.0)).unwrap();
    let l1 = store.add(Geometry::line([0.0, 0.0], [1.0, 0.0])).unwrap();
    let l2 = store.add(Geometry::line([0.0, 0.0], [0.0, 1.0])).unwrap();

    let ConstraintKind::Distance { value, .. } = ConstraintKind::distance(p, q, 2.0, LengthUnit::Inch) else {
        panic!("expected Distance");
    };
    assert!((value - 50.8).abs() < 1e-12);

    let ConstraintKind::Angle { value, .. } = ConstraintKind::angle(l1, l2, 90.0, AngleUnit::Degrees) else {
        panic!("expected Angle");
    };
    assert!((value - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
}

#[test]
fn test_suppression_and_removal() {
    let mut store = EntityStore::new();
    let mut set = ConstraintSet::new();
    let p = store.add(Geometry::point2(0.0, 0.0)).unwrap();
    let q = store.add(Geometry::point2(1.0, 0.0)).unwrap();

    let c1 = set.add(&store, ConstraintKind::Coincident { a: p.into(), b: q.into() }).unwrap();
    let c2 = set.add(&store, ConstraintKind::distance(p, q, 3.0, LengthUnit::Millimeter)).unwrap();
    assert_eq!(set.referencing(p), vec![c1, c2]);

    let rev = set.revision();
    set.set_suppressed(c1, true).unwrap();
    assert!(set.revision() > rev);
    let active: Vec<_> = set.active().iter().map(|c| c.id).collect();
    assert_eq!(active, vec![c2]);

    set.remove(c2).unwrap();
    assert!(matches!(set.get(c2), Err(SolverError::StaleConstraint(_))));
    let c3 = set.add(&store, ConstraintKind::distance(p, q, 4.0, LengthUnit::Millimeter)).unwrap();
    assert_eq!(c3.index(), c2.index());
    assert!(!set.contains(c2));
    assert_eq!(set.iter().map(|c| c.id).collect::<Vec<_>>(), vec![c1, c3]);
}

#[test]
fn test_joint_target_clamping() {
    let mut store = EntityStore::new();
    let b1 = store.add(Geometry::Body { origin: [0.0; 3], rotation: [0.0; 3] }).unwrap();
    let b2 = store.add(Geometry::Body { origin: [0.0; 3], rotation: [0.0; 3] }).unwrap();
    let f = JointFrame::default();
    let joint = ConstraintKind::revolute(b1, b2, f, f)
        .with_target(200.0, Unit::Angle(AngleUnit::Degrees))
        .with_limits(JointLimits::degrees(-180.0, 180.0));

    let (target, limits) = joint.joint_target().unwrap();
    assert!(!limits.unwrap().contains(target));
    let (clamped, _) = joint.clamped().joint_target().unwrap();
    assert!((clamped - std::f64::consts::PI).abs() < 1e-12);

    let inverted = ConstraintKind::revolute(b1, b2, f, f).with_limits(JointLimits::new(1.0, -1.0));
    assert!(matches!(inverted.validate(&store), Err(SolverError::InvalidJointFrame(_))));
}

#[test]
fn test_entities_are_deduplicated() {
    let mut store = EntityStore::new();
    let arc = store
        .add(Geometry::Arc { center: [0.0, 0.0], radius: 1.0, start_angle: 0.0, end_angle: 1.0 })
        .unwrap();
    let kind = ConstraintKind::Coincident { a: PointRef::start(arc), b: PointRef::end(arc) };
    assert_eq!(kind.entities(), vec![arc]);
}
