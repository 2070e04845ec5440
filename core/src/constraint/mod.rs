//! Constraint registry: the closed set of constraint kinds, their validation
//! against the entity store, and the arena that owns the constraints of one
//! sketch or assembly.
//!
//! Every kind exposes the same capability through [`eval`]: a residual vector
//! whose length equals [`Constraint::dof_removed`], and its Jacobian over the
//! parameters of the entities the constraint references.

pub mod curve;
pub mod eval;
pub mod joint;

#[cfg(test)]
mod tests_eval;
#[cfg(test)]
mod tests_registry;

pub use curve::{CurveEvaluator, CurveId, CurveSample, NoCurves};
pub use joint::{JointFrame, JointLimits};

use crate::error::{Result, SolverError};
use crate::store::{EntityId, EntityKind, EntityStore};
use crate::units::{AngleUnit, LengthUnit, Unit};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Generation-checked handle to a constraint in a [`ConstraintSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConstraintId {
    index: u32,
    generation: u32,
}

impl ConstraintId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ConstraintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}v{}", self.index, self.generation)
    }
}

/// A point read off an entity: 0 = position/origin/center, 1 = arc start, 2 = arc end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PointRef {
    pub entity: EntityId,
    pub index: u8,
}

impl PointRef {
    pub fn new(entity: EntityId, index: u8) -> Self {
        Self { entity, index }
    }

    pub fn start(entity: EntityId) -> Self {
        Self { entity, index: 1 }
    }

    pub fn end(entity: EntityId) -> Self {
        Self { entity, index: 2 }
    }
}

impl From<EntityId> for PointRef {
    fn from(entity: EntityId) -> Self {
        Self { entity, index: 0 }
    }
}

/// Constant parameters are stored in document units and radians.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstraintKind {
    Coincident { a: PointRef, b: PointRef },
    Distance { a: PointRef, b: PointRef, value: f64 },
    /// `b.x - a.x = value`
    HorizontalDistance { a: PointRef, b: PointRef, value: f64 },
    /// `b.y - a.y = value`
    VerticalDistance { a: PointRef, b: PointRef, value: f64 },
    Horizontal { line: EntityId },
    Vertical { line: EntityId },
    /// Lines, axes or plane normals.
    Parallel { a: EntityId, b: EntityId },
    Perpendicular { a: EntityId, b: EntityId },
    /// Signed angle from `a` to `b` in 2D, unsigned angle in 3D.
    Angle { a: EntityId, b: EntityId, value: f64 },
    /// Line and circle/arc, or two circles/arcs (external when the centers are
    /// farther apart than the larger radius, internal otherwise).
    Tangent { a: EntityId, b: EntityId },
    PointOnLine { point: PointRef, line: EntityId },
    DistancePointLine { point: PointRef, line: EntityId, value: f64 },
    Radius { entity: EntityId, value: f64 },
    EqualRadius { a: EntityId, b: EntityId },
    /// Pins a point; the third coordinate is ignored for 2D points.
    Fix { point: PointRef, position: [f64; 3] },
    /// `b` is the mirror image of `a` across `axis`.
    Symmetric { a: PointRef, b: PointRef, axis: EntityId },
    /// Point lies on a kernel curve at the parameter held by the `param` scalar.
    PointOnCurve { point: PointRef, curve: CurveId, param: EntityId },
    /// Line touches a kernel curve at the parameter held by the `param` scalar.
    TangentToCurve { line: EntityId, curve: CurveId, param: EntityId },
    /// Bodies share the joint anchor and axis; `target` drives the rotation about the axis.
    Revolute {
        a: EntityId,
        b: EntityId,
        frame_a: JointFrame,
        frame_b: JointFrame,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limits: Option<JointLimits>,
    },
    /// Bodies slide along a shared axis without twisting; `target` drives the offset.
    Prismatic {
        a: EntityId,
        b: EntityId,
        frame_a: JointFrame,
        frame_b: JointFrame,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limits: Option<JointLimits>,
    },
    /// Bodies share an axis and may both slide along and rotate about it.
    Cylindrical { a: EntityId, b: EntityId, frame_a: JointFrame, frame_b: JointFrame },
}

impl ConstraintKind {
    pub fn distance(a: impl Into<PointRef>, b: impl Into<PointRef>, value: f64, unit: LengthUnit) -> Self {
        Self::Distance { a: a.into(), b: b.into(), value: unit.to_mm(value) }
    }

    pub fn horizontal_distance(a: impl Into<PointRef>, b: impl Into<PointRef>, value: f64, unit: LengthUnit) -> Self {
        Self::HorizontalDistance { a: a.into(), b: b.into(), value: unit.to_mm(value) }
    }

    pub fn vertical_distance(a: impl Into<PointRef>, b: impl Into<PointRef>, value: f64, unit: LengthUnit) -> Self {
        Self::VerticalDistance { a: a.into(), b: b.into(), value: unit.to_mm(value) }
    }

    pub fn angle(a: EntityId, b: EntityId, value: f64, unit: AngleUnit) -> Self {
        Self::Angle { a, b, value: unit.to_radians(value) }
    }

    pub fn radius(entity: EntityId, value: f64, unit: LengthUnit) -> Self {
        Self::Radius { entity, value: unit.to_mm(value) }
    }

    pub fn distance_point_line(point: impl Into<PointRef>, line: EntityId, value: f64, unit: LengthUnit) -> Self {
        Self::DistancePointLine { point: point.into(), line, value: unit.to_mm(value) }
    }

    pub fn revolute(a: EntityId, b: EntityId, frame_a: JointFrame, frame_b: JointFrame) -> Self {
        Self::Revolute { a, b, frame_a, frame_b, target: None, limits: None }
    }

    pub fn prismatic(a: EntityId, b: EntityId, frame_a: JointFrame, frame_b: JointFrame) -> Self {
        Self::Prismatic { a, b, frame_a, frame_b, target: None, limits: None }
    }

    pub fn cylindrical(a: EntityId, b: EntityId, frame_a: JointFrame, frame_b: JointFrame) -> Self {
        Self::Cylindrical { a, b, frame_a, frame_b }
    }

    /// Drive a revolute or prismatic joint to `value`. Other kinds are returned unchanged.
    pub fn with_target(mut self, value: f64, unit: Unit) -> Self {
        if let Self::Revolute { target, .. } | Self::Prismatic { target, .. } = &mut self {
            *target = Some(unit.to_base(value));
        }
        self
    }

    /// Declare joint limits in base units (radians or document units).
    pub fn with_limits(mut self, joint_limits: JointLimits) -> Self {
        if let Self::Revolute { limits, .. } | Self::Prismatic { limits, .. } = &mut self {
            *limits = Some(joint_limits);
        }
        self
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Coincident { .. } => "Coincident",
            Self::Distance { .. } => "Distance",
            Self::HorizontalDistance { .. } => "HorizontalDistance",
            Self::VerticalDistance { .. } => "VerticalDistance",
            Self::Horizontal { .. } => "Horizontal",
            Self::Vertical { .. } => "Vertical",
            Self::Parallel { .. } => "Parallel",
            Self::Perpendicular { .. } => "Perpendicular",
            Self::Angle { .. } => "Angle",
            Self::Tangent { .. } => "Tangent",
            Self::PointOnLine { .. } => "PointOnLine",
            Self::DistancePointLine { .. } => "DistancePointLine",
            Self::Radius { .. } => "Radius",
            Self::EqualRadius { .. } => "EqualRadius",
            Self::Fix { .. } => "Fix",
            Self::Symmetric { .. } => "Symmetric",
            Self::PointOnCurve { .. } => "PointOnCurve",
            Self::TangentToCurve { .. } => "TangentToCurve",
            Self::Revolute { .. } => "Revolute",
            Self::Prismatic { .. } => "Prismatic",
            Self::Cylindrical { .. } => "Cylindrical",
        }
    }

    /// Referenced entities in declaration order, without duplicates.
    pub fn entities(&self) -> Vec<EntityId> {
        let raw: Vec<EntityId> = match self {
            Self::Coincident { a, b }
            | Self::Distance { a, b, .. }
            | Self::HorizontalDistance { a, b, .. }
            | Self::VerticalDistance { a, b, .. } => vec![a.entity, b.entity],
            Self::Horizontal { line } | Self::Vertical { line } => vec![*line],
            Self::Parallel { a, b }
            | Self::Perpendicular { a, b }
            | Self::Angle { a, b, .. }
            | Self::Tangent { a, b }
            | Self::EqualRadius { a, b }
            | Self::Revolute { a, b, .. }
            | Self::Prismatic { a, b, .. }
            | Self::Cylindrical { a, b, .. } => vec![*a, *b],
            Self::PointOnLine { point, line } | Self::DistancePointLine { point, line, .. } => {
                vec![point.entity, *line]
            }
            Self::Radius { entity, .. } => vec![*entity],
            Self::Fix { point, .. } => vec![point.entity],
            Self::Symmetric { a, b, axis } => vec![a.entity, b.entity, *axis],
            Self::PointOnCurve { point, param, .. } => vec![point.entity, *param],
            Self::TangentToCurve { line, param, .. } => vec![*line, *param],
        };
        let mut out = Vec::with_capacity(raw.len());
        for id in raw {
            if !out.contains(&id) {
                out.push(id);
            }
        }
        out
    }

    pub fn curve(&self) -> Option<CurveId> {
        match self {
            Self::PointOnCurve { curve, .. } | Self::TangentToCurve { curve, .. } => Some(*curve),
            _ => None,
        }
    }

    /// Joint target and limits, for the kinds that carry them.
    pub fn joint_target(&self) -> Option<(f64, Option<JointLimits>)> {
        match self {
            Self::Revolute { target: Some(t), limits, .. } | Self::Prismatic { target: Some(t), limits, .. } => {
                Some((*t, *limits))
            }
            _ => None,
        }
    }

    /// Copy of a joint with its target clamped into its limits.
    pub fn clamped(&self) -> Self {
        let mut out = self.clone();
        if let Self::Revolute { target: Some(t), limits: Some(l), .. }
        | Self::Prismatic { target: Some(t), limits: Some(l), .. } = &mut out
        {
            *t = l.clamp(*t);
        }
        out
    }

    fn constants(&self) -> Vec<f64> {
        match self {
            Self::Distance { value, .. }
            | Self::HorizontalDistance { value, .. }
            | Self::VerticalDistance { value, .. }
            | Self::Angle { value, .. }
            | Self::DistancePointLine { value, .. }
            | Self::Radius { value, .. } => vec![*value],
            Self::Fix { position, .. } => position.to_vec(),
            Self::Revolute { target, limits, .. } | Self::Prismatic { target, limits, .. } => {
                let mut v: Vec<f64> = target.iter().copied().collect();
                if let Some(l) = limits {
                    v.extend([l.min, l.max]);
                }
                v
            }
            _ => Vec::new(),
        }
    }

    /// Check the references against `store` and return the residual row count.
    pub fn validate(&self, store: &EntityStore) -> Result<usize> {
        let name = self.name();
        if self.constants().iter().any(|v| !v.is_finite()) {
            return Err(SolverError::NonFiniteConstant(name));
        }

        let point_dim = |p: &PointRef| -> Result<usize> {
            let kind = store.kind(p.entity)?;
            if p.index >= kind.point_count() {
                return Err(SolverError::InvalidPointRef { entity: p.entity, index: p.index });
            }
            Ok(kind.dimension())
        };
        let expect = |id: EntityId, allowed: &[EntityKind]| -> Result<EntityKind> {
            let found = store.kind(id)?;
            if allowed.contains(&found) {
                Ok(found)
            } else {
                Err(SolverError::IncompatibleEntity { constraint: name, entity: id, found })
            }
        };
        let same_dim = |left: usize, right: usize| -> Result<usize> {
            if left == right {
                Ok(left)
            } else {
                Err(SolverError::DimensionMismatch { constraint: name, left, right })
            }
        };

        const DIRECTIONAL: &[EntityKind] = &[EntityKind::Line, EntityKind::Axis, EntityKind::Plane];
        const ROUND: &[EntityKind] = &[EntityKind::Circle, EntityKind::Arc];
        const BODY: &[EntityKind] = &[EntityKind::Body];

        let rows = match self {
            Self::Coincident { a, b } => same_dim(point_dim(a)?, point_dim(b)?)?,
            Self::Distance { a, b, .. } => {
                same_dim(point_dim(a)?, point_dim(b)?)?;
                1
            }
            Self::HorizontalDistance { a, b, .. } | Self::VerticalDistance { a, b, .. } => {
                same_dim(point_dim(a)?, 2)?;
                same_dim(point_dim(b)?, 2)?;
                1
            }
            Self::Horizontal { line } | Self::Vertical { line } => {
                expect(*line, &[EntityKind::Line])?;
                1
            }
            Self::Parallel { a, b } => {
                let dim = same_dim(expect(*a, DIRECTIONAL)?.dimension(), expect(*b, DIRECTIONAL)?.dimension())?;
                if dim == 2 {
                    1
                } else {
                    2
                }
            }
            Self::Perpendicular { a, b } | Self::Angle { a, b, .. } => {
                same_dim(expect(*a, DIRECTIONAL)?.dimension(), expect(*b, DIRECTIONAL)?.dimension())?;
                1
            }
            Self::Tangent { a, b } => {
                let ka = expect(*a, &[EntityKind::Line, EntityKind::Circle, EntityKind::Arc])?;
                let kb = expect(*b, &[EntityKind::Line, EntityKind::Circle, EntityKind::Arc])?;
                if ka == EntityKind::Line && kb == EntityKind::Line {
                    return Err(SolverError::IncompatibleEntity { constraint: name, entity: *b, found: kb });
                }
                1
            }
            Self::PointOnLine { point, line } | Self::DistancePointLine { point, line, .. } => {
                same_dim(point_dim(point)?, 2)?;
                expect(*line, &[EntityKind::Line])?;
                1
            }
            Self::Radius { entity, .. } => {
                expect(*entity, ROUND)?;
                1
            }
            Self::EqualRadius { a, b } => {
                expect(*a, ROUND)?;
                expect(*b, ROUND)?;
                1
            }
            Self::Fix { point, .. } => point_dim(point)?,
            Self::Symmetric { a, b, axis } => {
                same_dim(point_dim(a)?, 2)?;
                same_dim(point_dim(b)?, 2)?;
                expect(*axis, &[EntityKind::Line])?;
                2
            }
            Self::PointOnCurve { point, param, .. } => {
                expect(*param, &[EntityKind::Scalar])?;
                point_dim(point)?
            }
            Self::TangentToCurve { line, param, .. } => {
                expect(*line, &[EntityKind::Line])?;
                expect(*param, &[EntityKind::Scalar])?;
                2
            }
            Self::Revolute { a, b, target, limits, .. } | Self::Prismatic { a, b, target, limits, .. } => {
                expect(*a, BODY)?;
                expect(*b, BODY)?;
                if let Some(l) = limits {
                    if l.min > l.max {
                        return Err(SolverError::InvalidJointFrame(format!(
                            "{name} limits are inverted: [{}, {}]",
                            l.min, l.max
                        )));
                    }
                }
                5 + usize::from(target.is_some())
            }
            Self::Cylindrical { a, b, .. } => {
                expect(*a, BODY)?;
                expect(*b, BODY)?;
                4
            }
        };
        Ok(rows)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub id: ConstraintId,
    pub kind: ConstraintKind,
    /// Creation order; the newest constraint is the first candidate for relaxing.
    pub seq: u64,
    /// Suppressed constraints are ignored by every solver stage.
    pub suppressed: bool,
    rows: usize,
}

impl Constraint {
    /// Nominal DOF reduction; equal to the residual row count.
    pub fn dof_removed(&self) -> usize {
        self.rows
    }

    pub fn entities(&self) -> Vec<EntityId> {
        self.kind.entities()
    }

    pub fn references(&self, entity: EntityId) -> bool {
        self.kind.entities().contains(&entity)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Slot {
    generation: u32,
    constraint: Option<Constraint>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConstraintSet {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
    next_seq: u64,
    revision: u64,
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `kind` against `store` and register it.
    pub fn add(&mut self, store: &EntityStore, kind: ConstraintKind) -> Result<ConstraintId> {
        let rows = kind.validate(store)?;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.revision += 1;
        self.len += 1;

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot { generation: 0, constraint: None });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = ConstraintId { index, generation: slot.generation };
        slot.constraint = Some(Constraint { id, kind, seq, suppressed: false, rows });
        Ok(id)
    }

    pub fn get(&self, id: ConstraintId) -> Result<&Constraint> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.constraint.as_ref())
            .ok_or(SolverError::StaleConstraint(id))
    }

    fn get_mut(&mut self, id: ConstraintId) -> Result<&mut Constraint> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.constraint.as_mut())
            .ok_or(SolverError::StaleConstraint(id))
    }

    pub fn contains(&self, id: ConstraintId) -> bool {
        self.get(id).is_ok()
    }

    pub fn remove(&mut self, id: ConstraintId) -> Result<Constraint> {
        self.get(id)?;
        let slot = &mut self.slots[id.index as usize];
        let constraint = slot.constraint.take().ok_or(SolverError::StaleConstraint(id))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        self.revision += 1;
        Ok(constraint)
    }

    pub fn set_suppressed(&mut self, id: ConstraintId, suppressed: bool) -> Result<()> {
        let constraint = self.get_mut(id)?;
        if constraint.suppressed != suppressed {
            constraint.suppressed = suppressed;
            self.revision += 1;
        }
        Ok(())
    }

    /// All constraints in creation order, suppressed ones included.
    pub fn iter(&self) -> impl Iterator<Item = &Constraint> {
        let mut all: Vec<&Constraint> = self.slots.iter().filter_map(|s| s.constraint.as_ref()).collect();
        all.sort_by_key(|c| c.seq);
        all.into_iter()
    }

    /// Unsuppressed constraints in creation order.
    pub fn active(&self) -> Vec<&Constraint> {
        self.iter().filter(|c| !c.suppressed).collect()
    }

    /// Constraints (suppressed or not) that reference `entity`.
    pub fn referencing(&self, entity: EntityId) -> Vec<ConstraintId> {
        self.iter().filter(|c| c.references(entity)).map(|c| c.id).collect()
    }

    /// Re-check every active constraint, e.g. after entities were removed or re-typed.
    pub fn validate(&self, store: &EntityStore) -> Result<()> {
        for constraint in self.active() {
            constraint.kind.validate(store)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Changes whenever a constraint is added, removed, suppressed or unsuppressed.
    pub fn revision(&self) -> u64 {
        self.revision
    }
}
