//! Tests for the sketch container: guarded removal, suppression and solving through it.

use crate::config::SolverConfig;
use crate::constraint::ConstraintKind;
use crate::error::SolverError;
use crate::sketch::{Sketch, SketchOperation};
use crate::solver::{ClusterStatus, IncrementalSolver, Solver};
use crate::store::Geometry;
use crate::units::LengthUnit;

fn solver() -> Solver {
    Solver::new(SolverConfig::default()).unwrap()
}

#[test]
fn test_remove_referenced_entity_is_refused() {
    let mut sketch = Sketch::new();
    let a = sketch.add_entity(Geometry::point2(0.0, 0.0)).unwrap();
    let b = sketch.add_entity(Geometry::point2(1.0, 0.0)).unwrap();
    let c = sketch.add_constraint(ConstraintKind::distance(a, b, 2.0, LengthUnit::Millimeter)).unwrap();

    assert!(matches!(sketch.remove_entity(b), Err(SolverError::EntityInUse(id)) if id == b));
    // Suppressed constraints still hold a reference
    sketch.set_suppressed(c, true).unwrap();
    assert!(sketch.remove_entity(b).is_err());

    sketch.remove_constraint(c).unwrap();
    sketch.remove_entity(b).unwrap();
    assert!(!sketch.entities.contains(b));
    assert!(matches!(sketch.history.last(), Some(SketchOperation::RemoveEntity { id }) if *id == b));
}

#[test]
fn test_cascade_removal() {
    let mut sketch = Sketch::new();
    let a = sketch.add_entity(Geometry::point2(0.0, 0.0)).unwrap();
    let b = sketch.add_entity(Geometry::point2(1.0, 0.0)).unwrap();
    let c1 = sketch.add_constraint(ConstraintKind::distance(a, b, 2.0, LengthUnit::Millimeter)).unwrap();
    let c2 = sketch.add_constraint(ConstraintKind::vertical_distance(a, b, 0.0, LengthUnit::Millimeter)).unwrap();

    let removed = sketch.remove_entity_cascade(b).unwrap();
    assert_eq!(removed, vec![c1, c2]);
    assert!(sketch.constraints.is_empty());
    assert_eq!(sketch.entities.len(), 1);
}

#[test]
fn test_suppressed_constraint_ignored() {
    let mut sketch = Sketch::new();
    let l = sketch.add_entity(Geometry::line([0.0, 0.0], [10.0, 5.0])).unwrap();
    let h = sketch.add_constraint(ConstraintKind::Horizontal { line: l }).unwrap();
    sketch.set_suppressed(h, true).unwrap();

    let report = sketch.solve(&solver()).unwrap();
    assert!(report.is_success());
    assert_eq!(sketch.entities.params(l).unwrap(), vec![0.0, 0.0, 10.0, 5.0]);

    sketch.set_suppressed(h, false).unwrap();
    sketch.solve(&solver()).unwrap();
    let p = sketch.entities.params(l).unwrap();
    assert!(p[3].abs() < 1e-9, "line should be horizontal: {p:?}");
}

#[test]
fn test_suppression_restores_dof() {
    let mut sketch = Sketch::new();
    let l = sketch.add_entity(Geometry::line([0.0, 0.0], [10.0, 5.0])).unwrap();
    let h = sketch.add_constraint(ConstraintKind::Horizontal { line: l }).unwrap();

    let remaining = |sketch: &Sketch| -> usize {
        sketch.analyze(&solver()).unwrap().iter().map(|(_, a)| a.remaining_dof()).sum()
    };
    assert_eq!(remaining(&sketch), 2);

    sketch.set_suppressed(h, true).unwrap();
    let report = sketch.solve(&solver()).unwrap();
    assert_eq!(
        report.clusters[0].status,
        ClusterStatus::Underconstrained { remaining_dof: 3, free_entities: vec![l] }
    );
}

#[test]
fn test_symmetric_points_about_axis() {
    let mut sketch = Sketch::new();
    let axis = sketch.add_fixed(Geometry::line([0.0, 0.0], [0.0, 1.0])).unwrap();
    let a = sketch.add_fixed(Geometry::point2(-3.0, 2.0)).unwrap();
    let b = sketch.add_entity(Geometry::point2(1.0, 1.0)).unwrap();
    sketch.add_constraint(ConstraintKind::Symmetric { a: a.into(), b: b.into(), axis }).unwrap();

    let report = sketch.solve(&solver()).unwrap();
    assert!(report.is_fully_constrained(), "{}", report.summary());
    let p = sketch.entities.params(b).unwrap();
    assert!((p[0] - 3.0).abs() < 1e-9 && (p[1] - 2.0).abs() < 1e-9);
}

#[test]
fn test_accepted_drag_is_recorded() {
    let mut sketch = Sketch::new();
    let o = sketch.add_fixed(Geometry::point2(0.0, 0.0)).unwrap();
    let p = sketch.add_entity(Geometry::point2(0.0, 5.0)).unwrap();
    sketch.add_constraint(ConstraintKind::distance(o, p, 5.0, LengthUnit::Millimeter)).unwrap();
    let mut drag = IncrementalSolver::new(SolverConfig::default()).unwrap();

    let report = sketch.drag(&mut drag, p, vec![3.0, 4.0]).unwrap();
    assert!(report.accepted);
    assert!(matches!(
        sketch.history.last(),
        Some(SketchOperation::MoveEntity { id, params }) if *id == p && *params == vec![3.0, 4.0]
    ));

    let len = sketch.history.len();
    let report = sketch.drag(&mut drag, p, vec![1.0, 1.0]).unwrap();
    assert!(!report.accepted);
    assert_eq!(sketch.history.len(), len);
}
