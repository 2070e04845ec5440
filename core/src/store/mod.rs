//! The entity store owns every geometric parameter the constraints read.
//!
//! Entities live in an arena and are addressed by [`EntityId`] handles that
//! carry a generation, so a handle to a removed entity can never alias the
//! entity that later reuses its slot.

use crate::error::{Result, SolverError};
use crate::geometry::{Vector3, DEGENERATE_LENGTH};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

#[cfg(test)]
mod tests_store;

/// Generation-checked handle to an entity in an [`EntityStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    index: u32,
    generation: u32,
}

impl EntityId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}v{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Point2,
    Point3,
    Line,
    Circle,
    Arc,
    Scalar,
    Plane,
    Axis,
    Body,
}

impl EntityKind {
    pub fn param_count(self) -> usize {
        match self {
            Self::Point2 => 2,
            Self::Point3 => 3,
            Self::Line => 4,
            Self::Circle => 3,
            Self::Arc => 5,
            Self::Scalar => 1,
            Self::Plane | Self::Axis | Self::Body => 6,
        }
    }

    /// Degrees of freedom: parameters minus the free scale of a stored direction.
    pub fn dof(self) -> usize {
        match self.direction_range() {
            Some(_) => self.param_count() - 1,
            None => self.param_count(),
        }
    }

    /// Spatial dimension of the points and directions read off this kind.
    pub fn dimension(self) -> usize {
        match self {
            Self::Point2 | Self::Line | Self::Circle | Self::Arc => 2,
            Self::Point3 | Self::Plane | Self::Axis | Self::Body => 3,
            Self::Scalar => 1,
        }
    }

    /// Parameters holding an unnormalized direction (line direction, axis direction, plane normal).
    pub fn direction_range(self) -> Option<Range<usize>> {
        match self {
            Self::Line => Some(2..4),
            Self::Plane | Self::Axis => Some(3..6),
            _ => None,
        }
    }

    /// Number of addressable points: 0 = position/origin/center, 1 = arc start, 2 = arc end.
    pub fn point_count(self) -> u8 {
        match self {
            Self::Scalar => 0,
            Self::Arc => 3,
            _ => 1,
        }
    }

    /// Parameter index of the radius for circles and arcs.
    pub fn radius_index(self) -> Option<usize> {
        match self {
            Self::Circle | Self::Arc => Some(2),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Point2 => "Point2",
            Self::Point3 => "Point3",
            Self::Line => "Line",
            Self::Circle => "Circle",
            Self::Arc => "Arc",
            Self::Scalar => "Scalar",
            Self::Plane => "Plane",
            Self::Axis => "Axis",
            Self::Body => "Body",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Geometry {
    Point2 { pos: [f64; 2] },
    Point3 { pos: [f64; 3] },
    /// Infinite line through `origin`. The direction is normalized on read, never on write.
    Line { origin: [f64; 2], direction: [f64; 2] },
    Circle { center: [f64; 2], radius: f64 },
    Arc { center: [f64; 2], radius: f64, start_angle: f64, end_angle: f64 },
    Scalar { value: f64 },
    Plane { origin: [f64; 3], normal: [f64; 3] },
    Axis { origin: [f64; 3], direction: [f64; 3] },
    /// Rigid frame for assembly joints; `rotation` is axis * angle in radians.
    Body { origin: [f64; 3], rotation: [f64; 3] },
}

impl Geometry {
    pub fn point2(x: f64, y: f64) -> Self {
        Self::Point2 { pos: [x, y] }
    }

    pub fn point3(x: f64, y: f64, z: f64) -> Self {
        Self::Point3 { pos: [x, y, z] }
    }

    pub fn line(origin: [f64; 2], direction: [f64; 2]) -> Self {
        Self::Line { origin, direction }
    }

    pub fn circle(center: [f64; 2], radius: f64) -> Self {
        Self::Circle { center, radius }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Point2 { .. } => EntityKind::Point2,
            Self::Point3 { .. } => EntityKind::Point3,
            Self::Line { .. } => EntityKind::Line,
            Self::Circle { .. } => EntityKind::Circle,
            Self::Arc { .. } => EntityKind::Arc,
            Self::Scalar { .. } => EntityKind::Scalar,
            Self::Plane { .. } => EntityKind::Plane,
            Self::Axis { .. } => EntityKind::Axis,
            Self::Body { .. } => EntityKind::Body,
        }
    }

    /// Flat parameter vector in the layout documented on [`EntityKind`].
    pub fn params(&self) -> Vec<f64> {
        match self {
            Self::Point2 { pos } => pos.to_vec(),
            Self::Point3 { pos } => pos.to_vec(),
            Self::Line { origin, direction } => vec![origin[0], origin[1], direction[0], direction[1]],
            Self::Circle { center, radius } => vec![center[0], center[1], *radius],
            Self::Arc { center, radius, start_angle, end_angle } => {
                vec![center[0], center[1], *radius, *start_angle, *end_angle]
            }
            Self::Scalar { value } => vec![*value],
            Self::Plane { origin, normal: v }
            | Self::Axis { origin, direction: v }
            | Self::Body { origin, rotation: v } => {
                vec![origin[0], origin[1], origin[2], v[0], v[1], v[2]]
            }
        }
    }

    /// Rebuild a geometry of `kind` from a flat parameter vector.
    pub fn from_params(kind: EntityKind, p: &[f64]) -> Result<Self> {
        if p.len() != kind.param_count() {
            return Err(SolverError::ParamCount {
                kind,
                expected: kind.param_count(),
                actual: p.len(),
            });
        }
        if p.iter().any(|v| !v.is_finite()) {
            return Err(SolverError::NonFinite(kind));
        }
        Ok(match kind {
            EntityKind::Point2 => Self::Point2 { pos: [p[0], p[1]] },
            EntityKind::Point3 => Self::Point3 { pos: [p[0], p[1], p[2]] },
            EntityKind::Line => Self::Line { origin: [p[0], p[1]], direction: [p[2], p[3]] },
            EntityKind::Circle => Self::Circle { center: [p[0], p[1]], radius: p[2] },
            EntityKind::Arc => Self::Arc {
                center: [p[0], p[1]],
                radius: p[2],
                start_angle: p[3],
                end_angle: p[4],
            },
            EntityKind::Scalar => Self::Scalar { value: p[0] },
            EntityKind::Plane => Self::Plane { origin: [p[0], p[1], p[2]], normal: [p[3], p[4], p[5]] },
            EntityKind::Axis => Self::Axis { origin: [p[0], p[1], p[2]], direction: [p[3], p[4], p[5]] },
            EntityKind::Body => Self::Body { origin: [p[0], p[1], p[2]], rotation: [p[3], p[4], p[5]] },
        })
    }

    /// Normalized direction of a line or axis, or normal of a plane.
    pub fn direction(&self) -> Option<Vector3> {
        let v = match self {
            Self::Line { direction, .. } => Vector3::new(direction[0], direction[1], 0.0),
            Self::Axis { direction, .. } => Vector3::from(*direction),
            Self::Plane { normal, .. } => Vector3::from(*normal),
            _ => return None,
        };
        let len = v.norm();
        (len > DEGENERATE_LENGTH).then(|| v / len)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub geometry: Geometry,
    /// Fixed entities are inputs; their parameters never enter the unknown vector.
    pub fixed: bool,
    /// Creation order; every deterministic ordering in the solver sorts by this.
    pub seq: u64,
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        self.geometry.kind()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Slot {
    generation: u32,
    entity: Option<Entity>,
}

/// Parameter writes for one cluster, applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    writes: Vec<(EntityId, Vec<f64>)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: EntityId, params: Vec<f64>) {
        self.writes.push((id, params));
    }

    pub fn extend(&mut self, other: WriteBatch) {
        self.writes.extend(other.writes);
    }

    pub fn iter(&self) -> impl Iterator<Item = &(EntityId, Vec<f64>)> {
        self.writes.iter()
    }

    pub fn get(&self, id: EntityId) -> Option<&[f64]> {
        self.writes.iter().find(|(e, _)| *e == id).map(|(_, p)| p.as_slice())
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
    next_seq: u64,
    structure_revision: u64,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a free (solvable) entity.
    pub fn add(&mut self, geometry: Geometry) -> Result<EntityId> {
        self.insert(geometry, false)
    }

    /// Add an entity whose parameters are inputs to the solve, e.g. a grounded origin.
    pub fn add_fixed(&mut self, geometry: Geometry) -> Result<EntityId> {
        self.insert(geometry, true)
    }

    fn insert(&mut self, geometry: Geometry, fixed: bool) -> Result<EntityId> {
        let geometry = Geometry::from_params(geometry.kind(), &geometry.params())?;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.structure_revision += 1;
        self.len += 1;

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot { generation: 0, entity: None });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = EntityId { index, generation: slot.generation };
        slot.entity = Some(Entity { id, geometry, fixed, seq });
        Ok(id)
    }

    pub fn get(&self, id: EntityId) -> Result<&Entity> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entity.as_ref())
            .ok_or(SolverError::StaleEntity(id))
    }

    fn get_mut(&mut self, id: EntityId) -> Result<&mut Entity> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entity.as_mut())
            .ok_or(SolverError::StaleEntity(id))
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.get(id).is_ok()
    }

    pub fn kind(&self, id: EntityId) -> Result<EntityKind> {
        self.get(id).map(Entity::kind)
    }

    pub fn params(&self, id: EntityId) -> Result<Vec<f64>> {
        self.get(id).map(|e| e.geometry.params())
    }

    pub fn is_fixed(&self, id: EntityId) -> Result<bool> {
        self.get(id).map(|e| e.fixed)
    }

    /// Remove an entity; its handle (and every copy of it) becomes stale.
    pub fn remove(&mut self, id: EntityId) -> Result<Entity> {
        self.get(id)?;
        let slot = &mut self.slots[id.index as usize];
        let entity = slot.entity.take().ok_or(SolverError::StaleEntity(id))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        self.structure_revision += 1;
        Ok(entity)
    }

    /// Overwrite the parameters of an unfixed entity.
    pub fn move_entity(&mut self, id: EntityId, params: &[f64]) -> Result<()> {
        let entity = self.get_mut(id)?;
        if entity.fixed {
            return Err(SolverError::FixedEntity(id));
        }
        entity.geometry = Geometry::from_params(entity.kind(), params)?;
        Ok(())
    }

    pub fn set_fixed(&mut self, id: EntityId, fixed: bool) -> Result<()> {
        let entity = self.get_mut(id)?;
        if entity.fixed != fixed {
            entity.fixed = fixed;
            self.structure_revision += 1;
        }
        Ok(())
    }

    /// Validate every write, then apply them all. A failed batch leaves the store untouched.
    pub fn apply_batch(&mut self, batch: &WriteBatch) -> Result<()> {
        let mut staged = Vec::with_capacity(batch.len());
        for (id, params) in batch.iter() {
            let entity = self.get(*id)?;
            if entity.fixed {
                return Err(SolverError::FixedEntity(*id));
            }
            staged.push((*id, Geometry::from_params(entity.kind(), params)?));
        }
        for (id, geometry) in staged {
            self.get_mut(id)?.geometry = geometry;
        }
        Ok(())
    }

    /// Entities in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        let mut entities: Vec<&Entity> = self.slots.iter().filter_map(|s| s.entity.as_ref()).collect();
        entities.sort_by_key(|e| e.seq);
        entities.into_iter()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Changes whenever an entity is added, removed, fixed or unfixed.
    pub fn structure_revision(&self) -> u64 {
        self.structure_revision
    }
}
