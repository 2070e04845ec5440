use crate::error::SolverError;
use crate::store::{EntityKind, EntityStore, Geometry, WriteBatch};

#[test]
fn test_stale_handle_after_remove() {
    let mut store = EntityStore::new();
    let p = store.add(Geometry::point2(1.0, 2.0)).unwrap();
    store.remove(p).unwrap();

    // The slot is reused, but the old handle must not resolve to the new entity.
    let q = store.add(Geometry::point2(5.0, 6.0)).unwrap();
    assert_eq!(p.index(), q.index());
    assert_ne!(p.generation(), q.generation());
    assert!(matches!(store.get(p), Err(SolverError::StaleEntity(_))));
    assert_eq!(store.params(q).unwrap(), vec![5.0, 6.0]);
}

#[test]
fn test_iteration_follows_creation_order() {
    let mut store = EntityStore::new();
    let a = store.add(Geometry::point2(0.0, 0.0)).unwrap();
    let b = store.add(Geometry::point2(1.0, 0.0)).unwrap();
    store.remove(a).unwrap();
    let c = store.add(Geometry::point2(2.0, 0.0)).unwrap();

    // c reuses a's slot (index 0) but was created after b.
    let order: Vec<_> = store.iter().map(|e| e.id).collect();
    assert_eq!(order, vec![b, c]);
}

#[test]
fn test_move_respects_fixed_flag() {
    let mut store = EntityStore::new();
    let origin = store.add_fixed(Geometry::point2(0.0, 0.0)).unwrap();
    assert!(matches!(store.move_entity(origin, &[1.0, 1.0]), Err(SolverError::FixedEntity(_))));

    store.set_fixed(origin, false).unwrap();
    store.move_entity(origin, &[1.0, 1.0]).unwrap();
    assert_eq!(store.params(origin).unwrap(), vec![1.0, 1.0]);
}

#[test]
fn test_param_validation() {
    let mut store = EntityStore::new();
    let line = store.add(Geometry::line([0.0, 0.0], [1.0, 0.0])).unwrap();
    assert!(matches!(
        store.move_entity(line, &[1.0, 2.0]),
        Err(SolverError::ParamCount { kind: EntityKind::Line, expected: 4, actual: 2 })
    ));
    assert!(matches!(
        store.move_entity(line, &[0.0, f64::NAN, 1.0, 0.0]),
        Err(SolverError::NonFinite(EntityKind::Line))
    ));
    assert!(store.add(Geometry::point2(f64::INFINITY, 0.0)).is_err());
}

#[test]
fn test_batch_is_all_or_nothing() {
    let mut store = EntityStore::new();
    let a = store.add(Geometry::point2(0.0, 0.0)).unwrap();
    let b = store.add(Geometry::point2(1.0, 1.0)).unwrap();

    let mut batch = WriteBatch::new();
    batch.push(a, vec![3.0, 3.0]);
    batch.push(b, vec![4.0]); // wrong length
    assert!(store.apply_batch(&batch).is_err());
    assert_eq!(store.params(a).unwrap(), vec![0.0, 0.0]);

    let mut batch = WriteBatch::new();
    batch.push(a, vec![3.0, 3.0]);
    batch.push(b, vec![4.0, 4.0]);
    store.apply_batch(&batch).unwrap();
    assert_eq!(store.params(a).unwrap(), vec![3.0, 3.0]);
    assert_eq!(store.params(b).unwrap(), vec![4.0, 4.0]);
}

#[test]
fn test_structure_revision() {
    let mut store = EntityStore::new();
    let a = store.add(Geometry::point2(0.0, 0.0)).unwrap();
    let rev = store.structure_revision();

    store.move_entity(a, &[2.0, 2.0]).unwrap();
    assert_eq!(store.structure_revision(), rev, "moving is not a structural edit");

    store.set_fixed(a, true).unwrap();
    assert!(store.structure_revision() > rev);
}

#[test]
fn test_kind_dof() {
    assert_eq!(EntityKind::Line.dof(), 3);
    assert_eq!(EntityKind::Axis.dof(), 5);
    assert_eq!(EntityKind::Body.dof(), 6);
    assert_eq!(EntityKind::Arc.dof(), 5);

    let g = Geometry::line([1.0, 1.0], [0.0, 3.0]);
    let d = g.direction().unwrap();
    assert!((d.y - 1.0).abs() < 1e-12);
    assert_eq!(Geometry::from_params(EntityKind::Line, &g.params()).unwrap(), g);
}
