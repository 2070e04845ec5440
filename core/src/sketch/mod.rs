//! A sketch or assembly document: the entity store, its constraints and the
//! history of edits made through it.

#[cfg(test)]
mod tests_history;
#[cfg(test)]
mod tests_sketch;

use crate::constraint::{ConstraintId, ConstraintKind, ConstraintSet, CurveEvaluator, NoCurves};
use crate::error::{Result, SolverError};
use crate::solver::{CancelToken, ClusterId, DofAnalysis, DragReport, IncrementalSolver, SolveReport, Solver};
use crate::store::{EntityId, EntityStore, Geometry};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SketchOperation {
    AddEntity { id: EntityId, geometry: Geometry, fixed: bool },
    RemoveEntity { id: EntityId },
    MoveEntity { id: EntityId, params: Vec<f64> },
    SetFixed { id: EntityId, fixed: bool },
    AddConstraint { id: ConstraintId, constraint: ConstraintKind },
    RemoveConstraint { id: ConstraintId },
    SetSuppressed { id: ConstraintId, suppressed: bool },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sketch {
    pub entities: EntityStore,
    pub constraints: ConstraintSet,
    #[serde(default)]
    pub history: Vec<SketchOperation>,
}

impl Sketch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entity(&mut self, geometry: Geometry) -> Result<EntityId> {
        let id = self.entities.add(geometry.clone())?;
        self.history.push(SketchOperation::AddEntity { id, geometry, fixed: false });
        Ok(id)
    }

    pub fn add_fixed(&mut self, geometry: Geometry) -> Result<EntityId> {
        let id = self.entities.add_fixed(geometry.clone())?;
        self.history.push(SketchOperation::AddEntity { id, geometry, fixed: true });
        Ok(id)
    }

    /// Refused while any constraint, suppressed or not, still references the entity.
    pub fn remove_entity(&mut self, id: EntityId) -> Result<()> {
        self.entities.get(id)?;
        if !self.constraints.referencing(id).is_empty() {
            return Err(SolverError::EntityInUse(id));
        }
        self.entities.remove(id)?;
        self.history.push(SketchOperation::RemoveEntity { id });
        Ok(())
    }

    /// Remove an entity together with every constraint that references it.
    pub fn remove_entity_cascade(&mut self, id: EntityId) -> Result<Vec<ConstraintId>> {
        self.entities.get(id)?;
        let removed = self.constraints.referencing(id);
        for c in &removed {
            self.remove_constraint(*c)?;
        }
        self.remove_entity(id)?;
        Ok(removed)
    }

    pub fn move_entity(&mut self, id: EntityId, params: Vec<f64>) -> Result<()> {
        self.entities.move_entity(id, &params)?;
        self.history.push(SketchOperation::MoveEntity { id, params });
        Ok(())
    }

    pub fn set_fixed(&mut self, id: EntityId, fixed: bool) -> Result<()> {
        self.entities.set_fixed(id, fixed)?;
        self.history.push(SketchOperation::SetFixed { id, fixed });
        Ok(())
    }

    pub fn add_constraint(&mut self, constraint: ConstraintKind) -> Result<ConstraintId> {
        let id = self.constraints.add(&self.entities, constraint.clone())?;
        self.history.push(SketchOperation::AddConstraint { id, constraint });
        Ok(id)
    }

    pub fn remove_constraint(&mut self, id: ConstraintId) -> Result<()> {
        self.constraints.remove(id)?;
        self.history.push(SketchOperation::RemoveConstraint { id });
        Ok(())
    }

    pub fn set_suppressed(&mut self, id: ConstraintId, suppressed: bool) -> Result<()> {
        self.constraints.set_suppressed(id, suppressed)?;
        self.history.push(SketchOperation::SetSuppressed { id, suppressed });
        Ok(())
    }

    pub fn solve(&mut self, solver: &Solver) -> Result<SolveReport> {
        solver.solve(&mut self.entities, &self.constraints)
    }

    pub fn solve_with(
        &mut self,
        solver: &Solver,
        curves: &dyn CurveEvaluator,
        cancel: Option<&CancelToken>,
    ) -> Result<SolveReport> {
        solver.solve_with(&mut self.entities, &self.constraints, curves, cancel)
    }

    /// DOF analysis of each cluster at the current configuration.
    pub fn analyze(&self, solver: &Solver) -> Result<Vec<(ClusterId, DofAnalysis)>> {
        solver.analyze(&self.entities, &self.constraints, &NoCurves)
    }

    /// Drag an entity. Accepted drags are recorded as a move of the dragged entity.
    pub fn drag(&mut self, drag: &mut IncrementalSolver, id: EntityId, target: Vec<f64>) -> Result<DragReport> {
        let report = drag.drag(&mut self.entities, &self.constraints, id, target)?;
        if report.accepted {
            let params = self.entities.params(id)?;
            self.history.push(SketchOperation::MoveEntity { id, params });
        }
        Ok(report)
    }
}
