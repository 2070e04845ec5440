//! Interactive dragging.
//!
//! A drag pins one entity at a target and re-solves only the clusters that
//! contain it or read from it. The full decomposition is cached and reused
//! until the store structure or the constraint set changes. Every write of a
//! drag goes into one batch, so a drag either moves everything it touched or
//! leaves the store as it was.

use crate::config::SolverConfig;
use crate::constraint::{ConstraintSet, CurveEvaluator, NoCurves};
use crate::error::{Result, SolverError};
use crate::solver::decompose::{ClusterId, Decomposer, Decomposition};
use crate::solver::engine::{check_fixed_only, fixed_conflict, run_component, Lookup, SolveContext};
use crate::solver::lm::LmSettings;
use crate::solver::report::ClusterReport;
use crate::solver::system::ParamSource;
use crate::store::{EntityId, EntityStore, Geometry, WriteBatch};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, instrument, warn};

/// Sequence number of a drag, unique per [`IncrementalSolver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DragAttempt(pub u64);

impl fmt::Display for DragAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "drag#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DragReport {
    pub attempt: DragAttempt,
    pub entity: EntityId,
    /// False when any affected cluster failed; the store is then unchanged.
    pub accepted: bool,
    /// Reports of the re-solved clusters, numbered within the drag's scope.
    pub clusters: Vec<ClusterReport>,
    /// Total LM iterations over the affected clusters.
    pub iterations: usize,
}

impl DragReport {
    pub fn failed(&self) -> Vec<&ClusterReport> {
        self.clusters.iter().filter(|c| !c.status.is_success()).collect()
    }
}

struct Cached {
    key: (u64, u64),
    decomposition: Decomposition,
}

pub struct IncrementalSolver {
    config: SolverConfig,
    cache: Option<Cached>,
    attempts: u64,
}

impl IncrementalSolver {
    pub fn new(config: SolverConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, cache: None, attempts: 0 })
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Drop the cached decomposition; the next drag rebuilds it.
    pub fn invalidate(&mut self) {
        self.cache = None;
    }

    /// Cached decomposition, if it is current for `store` and `constraints`.
    pub fn decomposition(&self, store: &EntityStore, constraints: &ConstraintSet) -> Option<&Decomposition> {
        let key = (store.structure_revision(), constraints.revision());
        self.cache.as_ref().filter(|c| c.key == key).map(|c| &c.decomposition)
    }

    /// Move `entity` to `target` and re-solve what depends on it.
    pub fn drag(
        &mut self,
        store: &mut EntityStore,
        constraints: &ConstraintSet,
        entity: EntityId,
        target: Vec<f64>,
    ) -> Result<DragReport> {
        self.drag_with(store, constraints, &NoCurves, entity, target)
    }

    /// Drag by an offset added to the entity's current parameters.
    pub fn drag_by(
        &mut self,
        store: &mut EntityStore,
        constraints: &ConstraintSet,
        entity: EntityId,
        delta: &[f64],
    ) -> Result<DragReport> {
        let current = store.params(entity)?;
        if delta.len() != current.len() {
            return Err(SolverError::ParamCount {
                kind: store.kind(entity)?,
                expected: current.len(),
                actual: delta.len(),
            });
        }
        let target = current.iter().zip(delta).map(|(p, d)| p + d).collect();
        self.drag(store, constraints, entity, target)
    }

    #[instrument(level = "debug", skip(self, store, constraints, curves, target))]
    pub fn drag_with(
        &mut self,
        store: &mut EntityStore,
        constraints: &ConstraintSet,
        curves: &dyn CurveEvaluator,
        entity: EntityId,
        target: Vec<f64>,
    ) -> Result<DragReport> {
        if store.is_fixed(entity)? {
            return Err(SolverError::FixedEntity(entity));
        }
        let target = Geometry::from_params(store.kind(entity)?, &target)?.params();
        constraints.validate(store)?;

        self.attempts += 1;
        let attempt = DragAttempt(self.attempts);

        let active = constraints.active();
        let lookup: Lookup<'_> = active.iter().map(|c| (c.id, *c)).collect();
        let ctx = SolveContext { lookup: &lookup, curves, config: &self.config, settings: LmSettings::for_drag(&self.config) };

        let key = (store.structure_revision(), constraints.revision());
        let cached = match self.cache.take() {
            Some(cached) if cached.key == key => cached,
            _ => {
                let decomposition =
                    Decomposer::new(&self.config, curves).decompose(&ParamSource::new(store), &active, |e| !e.fixed)?;
                debug!(clusters = decomposition.clusters.len(), "rebuilt drag decomposition");
                Cached { key, decomposition }
            }
        };
        let full = &self.cache.insert(cached).decomposition;

        let roots: Vec<ClusterId> = full.cluster_of(entity).into_iter().collect();
        let affected = full.with_dependents(&roots);
        let scope: HashSet<EntityId> = affected
            .iter()
            .filter_map(|id| full.cluster(*id))
            .flat_map(|c| c.entities.iter().copied())
            .collect();
        let in_scope: HashSet<_> =
            affected.iter().filter_map(|id| full.cluster(*id)).flat_map(|c| c.constraints.iter().copied()).collect();
        let scoped_constraints: Vec<_> = active.iter().copied().filter(|c| in_scope.contains(&c.id)).collect();

        let overlay: HashMap<EntityId, Vec<f64>> = HashMap::from([(entity, target.clone())]);
        let snapshot: &EntityStore = store;
        let source = ParamSource::with_overlay(snapshot, &overlay);
        let scoped = Decomposer::new(&self.config, curves).decompose(&source, &scoped_constraints, |e| {
            e.id != entity && scope.contains(&e.id)
        })?;

        let mut clusters = Vec::new();
        let mut iterations = 0;
        let mut batch = WriteBatch::new();
        batch.push(entity, target);

        let (_, violated) = check_fixed_only(&source, &scoped.fixed_only, &ctx)?;
        let mut accepted = violated.is_empty();
        if accepted {
            for component in &scoped.components {
                for outcome in run_component(snapshot, &overlay, &scoped, component, &ctx, None)? {
                    iterations += outcome.report.iterations;
                    accepted &= outcome.report.status.is_success();
                    if let Some(writes) = outcome.batch {
                        batch.extend(writes);
                    }
                    clusters.push(outcome.report);
                }
            }
        } else {
            clusters.push(fixed_conflict(ClusterId(scoped.clusters.len()), violated, &lookup, snapshot));
        }

        if accepted {
            store.apply_batch(&batch)?;
            debug!(%attempt, %entity, clusters = clusters.len(), iterations, "drag accepted");
        } else {
            let failed: Vec<String> = clusters
                .iter()
                .filter(|c| !c.status.is_success())
                .map(|c| format!("{} {}", c.cluster, c.status.label()))
                .collect();
            warn!(%attempt, %entity, ?failed, "drag rejected");
        }

        Ok(DragReport { attempt, entity, accepted, clusters, iterations })
    }
}
