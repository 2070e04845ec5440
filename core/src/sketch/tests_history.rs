use crate::constraint::ConstraintKind;
use crate::sketch::{Sketch, SketchOperation};
use crate::store::Geometry;

#[test]
fn test_history_appending() {
    let mut sketch = Sketch::new();
    let id = sketch.add_entity(Geometry::point2(0.0, 0.0)).unwrap();

    assert_eq!(sketch.history.len(), 1);
    match &sketch.history[0] {
        SketchOperation::AddEntity { id: op_id, geometry, fixed } => {
            assert_eq!(id, *op_id);
            assert_eq!(*geometry, Geometry::point2(0.0, 0.0));
            assert!(!fixed);
        }
        _ => panic!("Wrong operation type"),
    }

    let constraint = ConstraintKind::Fix { point: id.into(), position: [1.0, 2.0, 0.0] };
    let cid = sketch.add_constraint(constraint.clone()).unwrap();

    assert_eq!(sketch.history.len(), 2);
    match &sketch.history[1] {
        SketchOperation::AddConstraint { id: op_id, constraint: op_constraint } => {
            assert_eq!(*op_id, cid);
            assert_eq!(*op_constraint, constraint);
        }
        _ => panic!("Wrong operation type"),
    }
}

#[test]
fn test_rejected_edits_are_not_recorded() {
    let mut sketch = Sketch::new();
    let p = sketch.add_fixed(Geometry::point2(0.0, 0.0)).unwrap();
    let c = sketch.add_entity(Geometry::circle([0.0, 0.0], 1.0)).unwrap();

    assert!(sketch.move_entity(p, vec![1.0, 1.0]).is_err());
    assert!(sketch.add_constraint(ConstraintKind::Horizontal { line: c }).is_err());
    assert_eq!(sketch.history.len(), 2);
}

#[test]
fn test_history_round_trips_through_json() {
    let mut sketch = Sketch::new();
    let a = sketch.add_entity(Geometry::point2(0.0, 0.0)).unwrap();
    let b = sketch.add_entity(Geometry::point2(1.0, 0.0)).unwrap();
    let c = sketch.add_constraint(ConstraintKind::Coincident { a: a.into(), b: b.into() }).unwrap();
    sketch.set_suppressed(c, true).unwrap();

    let json = serde_json::to_string(&sketch).unwrap();
    let back: Sketch = serde_json::from_str(&json).unwrap();
    assert_eq!(back.history, sketch.history);
    assert!(back.constraints.get(c).unwrap().suppressed);
}
