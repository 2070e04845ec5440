use crate::config::SolverConfig;
use crate::constraint::{ConstraintKind, ConstraintSet, NoCurves, PointRef};
use crate::solver::dof::{self, DofAnalysis};
use crate::solver::system::{ClusterSystem, ParamSource};
use crate::store::{EntityId, EntityStore, Geometry};
use crate::units::LengthUnit;

fn analyze(store: &EntityStore, set: &ConstraintSet, unknowns: &[EntityId]) -> DofAnalysis {
    let constraints = set.active();
    let system = ClusterSystem::new(&ParamSource::new(store), unknowns, &constraints, &NoCurves, 1e-7).unwrap();
    dof::analyze(&system, system.initial(), SolverConfig::default().rank_tolerance)
}

#[test]
fn test_point_on_circle_keeps_one_dof() {
    let mut store = EntityStore::new();
    let mut set = ConstraintSet::new();
    let o = store.add_fixed(Geometry::point2(0.0, 0.0)).unwrap();
    let p = store.add(Geometry::point2(3.0, 4.0)).unwrap();
    set.add(&store, ConstraintKind::distance(o, p, 10.0, LengthUnit::Millimeter)).unwrap();

    let analysis = analyze(&store, &set, &[p]);
    assert_eq!(analysis.dof, 2);
    assert_eq!(analysis.removed, 1);
    assert_eq!(analysis.rank, 1);
    assert_eq!(analysis.remaining_dof(), 1);
    assert_eq!(analysis.free_entities, vec![p]);
    assert!(!analysis.is_overconstrained());
}

#[test]
fn test_well_constrained_point() {
    let mut store = EntityStore::new();
    let mut set = ConstraintSet::new();
    let o = store.add_fixed(Geometry::point2(0.0, 0.0)).unwrap();
    let p = store.add(Geometry::point2(3.0, 1.0)).unwrap();
    set.add(&store, ConstraintKind::horizontal_distance(o, p, 5.0, LengthUnit::Millimeter)).unwrap();
    set.add(&store, ConstraintKind::vertical_distance(o, p, 2.0, LengthUnit::Millimeter)).unwrap();

    let analysis = analyze(&store, &set, &[p]);
    assert_eq!(analysis.structural(), 0);
    assert!(analysis.is_well_constrained());
    assert!(analysis.free_entities.is_empty());
}

#[test]
fn test_implied_distance_is_redundant() {
    let mut store = EntityStore::new();
    let mut set = ConstraintSet::new();
    let o = store.add_fixed(Geometry::point2(0.0, 0.0)).unwrap();
    let p = store.add(Geometry::point2(3.0, 1.0)).unwrap();
    set.add(&store, ConstraintKind::horizontal_distance(o, p, 5.0, LengthUnit::Millimeter)).unwrap();
    set.add(&store, ConstraintKind::vertical_distance(o, p, 2.0, LengthUnit::Millimeter)).unwrap();
    let dist = set.add(&store, ConstraintKind::distance(o, p, 29f64.sqrt(), LengthUnit::Millimeter)).unwrap();

    let analysis = analyze(&store, &set, &[p]);
    assert_eq!(analysis.structural(), -1);
    assert!(analysis.is_overconstrained());
    assert_eq!(analysis.redundant, vec![dist]);
}

#[test]
fn test_structural_redundancy_walks_capacity() {
    let mut store = EntityStore::new();
    let mut set = ConstraintSet::new();
    let o = store.add_fixed(Geometry::point2(0.0, 0.0)).unwrap();
    let p = store.add(Geometry::point2(1.0, 2.0)).unwrap();
    set.add(&store, ConstraintKind::Fix { point: PointRef::from(p), position: [1.0, 2.0, 0.0] }).unwrap();
    let coincident = set.add(&store, ConstraintKind::Coincident { a: p.into(), b: o.into() }).unwrap();

    let constraints = set.active();
    let system = ClusterSystem::new(&ParamSource::new(&store), &[p], &constraints, &NoCurves, 1e-7).unwrap();
    assert_eq!(dof::structural_redundancy(&system), vec![coincident]);

    let analysis = dof::analyze(&system, system.initial(), 1e-8);
    assert_eq!(analysis.structural(), -2);
    assert_eq!(analysis.redundant, vec![coincident]);
}

#[test]
fn test_accidental_alignment_is_not_redundant() {
    // P sits exactly between two anchors, so both distance gradients are collinear here
    let mut store = EntityStore::new();
    let mut set = ConstraintSet::new();
    let o = store.add_fixed(Geometry::point2(0.0, 0.0)).unwrap();
    let a = store.add_fixed(Geometry::point2(10.0, 0.0)).unwrap();
    let p = store.add(Geometry::point2(5.0, 0.0)).unwrap();
    set.add(&store, ConstraintKind::distance(o, p, 5.0, LengthUnit::Millimeter)).unwrap();
    set.add(&store, ConstraintKind::distance(a, p, 5.0, LengthUnit::Millimeter)).unwrap();

    let analysis = analyze(&store, &set, &[p]);
    assert!(analysis.redundant.is_empty());
    assert_eq!(analysis.rank, 2);
    assert!(analysis.is_well_constrained());
}

#[test]
fn test_three_perpendicular_lines_are_overconstrained() {
    let mut store = EntityStore::new();
    let mut set = ConstraintSet::new();
    let l1 = store.add_fixed(Geometry::line([0.0, 0.0], [1.0, 0.0])).unwrap();
    let l2 = store.add(Geometry::line([1.0, 1.0], [0.3, 1.0])).unwrap();
    let l3 = store.add(Geometry::line([2.0, 0.0], [1.0, 0.2])).unwrap();
    set.add(&store, ConstraintKind::Perpendicular { a: l1, b: l2 }).unwrap();
    set.add(&store, ConstraintKind::Perpendicular { a: l2, b: l3 }).unwrap();
    let third = set.add(&store, ConstraintKind::Perpendicular { a: l1, b: l3 }).unwrap();

    let analysis = analyze(&store, &set, &[l2, l3]);
    assert_eq!(analysis.dof, 6);
    assert_eq!(analysis.removed, 3);
    assert_eq!(analysis.rank, 2);
    assert_eq!(analysis.redundant, vec![third]);
}

#[test]
fn test_line_direction_scale_is_not_freedom() {
    let mut store = EntityStore::new();
    let mut set = ConstraintSet::new();
    let o = store.add_fixed(Geometry::point2(0.0, 0.0)).unwrap();
    let l = store.add(Geometry::line([0.0, 0.0], [2.0, 0.5])).unwrap();
    set.add(&store, ConstraintKind::Coincident { a: l.into(), b: o.into() }).unwrap();
    set.add(&store, ConstraintKind::Horizontal { line: l }).unwrap();

    let analysis = analyze(&store, &set, &[l]);
    assert_eq!(analysis.dof, 3);
    assert_eq!(analysis.rank, 3);
    assert_eq!(analysis.remaining_dof(), 0);
    assert!(analysis.free_entities.is_empty());
}
