//! Cluster decomposition.
//!
//! The free entities are partitioned into connected components with a
//! union-find over shared constraints. Inside a component, seed sets are grown
//! in entity creation order; a seed set whose internal constraints fix it
//! completely (zero DOF, full Jacobian rank) becomes a cluster of its own and
//! is frozen, i.e. treated as a fixed input by whatever is left of the
//! component. Freezing is recorded as a [`Substitution`]; the constraint
//! graph itself is never rewritten. A set is only frozen when all of its
//! internal constraints are older than the pending constraints touching it.

use crate::config::SolverConfig;
use crate::constraint::{Constraint, ConstraintId, CurveEvaluator};
use crate::error::Result;
use crate::solver::dof;
use crate::solver::graph::ConstraintGraph;
use crate::solver::system::{ClusterSystem, ParamSource};
use crate::store::{Entity, EntityId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(pub usize);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cluster{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    /// Free entities solved by this cluster, in creation order.
    pub entities: Vec<EntityId>,
    /// Constraints solved by this cluster, in creation order.
    pub constraints: Vec<ConstraintId>,
    /// Entities read but not solved here: fixed entities and upstream clusters' entities.
    pub inputs: Vec<EntityId>,
    /// Clusters that must be solved first.
    pub depends_on: Vec<ClusterId>,
    /// Extracted as a fully determined subset.
    pub rigid: bool,
}

/// Entities frozen after `cluster` was extracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Substitution {
    pub cluster: ClusterId,
    pub frozen: Vec<EntityId>,
}

/// A connected component: its clusters in solve order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub clusters: Vec<ClusterId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Decomposition {
    /// Indexed by `ClusterId.0`.
    pub clusters: Vec<Cluster>,
    pub components: Vec<Component>,
    pub substitutions: Vec<Substitution>,
    /// Constraints that reference no free entity; checked, never solved.
    pub fixed_only: Vec<ConstraintId>,
}

impl Decomposition {
    pub fn cluster(&self, id: ClusterId) -> Option<&Cluster> {
        self.clusters.get(id.0)
    }

    pub fn cluster_of(&self, entity: EntityId) -> Option<ClusterId> {
        self.clusters.iter().find(|c| c.entities.contains(&entity)).map(|c| c.id)
    }

    /// `roots` plus every cluster that depends on them, directly or not, in id order.
    pub fn with_dependents(&self, roots: &[ClusterId]) -> Vec<ClusterId> {
        let mut marked: BTreeSet<ClusterId> = roots.iter().copied().collect();
        // Dependencies always point to lower ids, so one ascending sweep is enough.
        for cluster in &self.clusters {
            if cluster.depends_on.iter().any(|d| marked.contains(d)) {
                marked.insert(cluster.id);
            }
        }
        marked.into_iter().collect()
    }
}

pub struct Decomposer<'a> {
    config: &'a SolverConfig,
    curves: &'a dyn CurveEvaluator,
}

/// Per-component working state.
struct Pending<'g> {
    entities: Vec<EntityId>,
    /// Constraint indices into the graph not yet assigned to a cluster.
    constraints: Vec<usize>,
    frozen: HashMap<EntityId, ClusterId>,
    graph: &'g ConstraintGraph<'g>,
}

impl<'a> Decomposer<'a> {
    pub fn new(config: &'a SolverConfig, curves: &'a dyn CurveEvaluator) -> Self {
        Self { config, curves }
    }

    /// Decompose `constraints` (creation order). Entities accepted by
    /// `is_free` are unknowns; all others are inputs read from `source`.
    pub fn decompose(
        &self,
        source: &ParamSource<'_>,
        constraints: &[&Constraint],
        is_free: impl Fn(&Entity) -> bool,
    ) -> Result<Decomposition> {
        let graph = ConstraintGraph::build(source.store(), constraints, is_free)?;
        let mut out = Decomposition {
            fixed_only: graph.fixed_only().into_iter().map(|ci| graph.constraints()[ci].id).collect(),
            ..Decomposition::default()
        };

        for entities in graph.components() {
            let mut seen = HashSet::new();
            let mut member_constraints = Vec::new();
            for entity in &entities {
                for &ci in graph.constraints_of(*entity) {
                    if seen.insert(ci) {
                        member_constraints.push(ci);
                    }
                }
            }
            member_constraints.sort_unstable();

            let mut pending = Pending { entities, constraints: member_constraints, frozen: HashMap::new(), graph: &graph };
            let first = out.clusters.len();
            self.extract_rigid(source, &mut pending, &mut out)?;
            self.push_cluster(&pending, pending.entities.clone(), pending.constraints.clone(), false, &mut out);
            out.components.push(Component { clusters: (first..out.clusters.len()).map(ClusterId).collect() });
        }

        debug!(
            clusters = out.clusters.len(),
            components = out.components.len(),
            substitutions = out.substitutions.len(),
            "decomposed constraint graph"
        );
        Ok(out)
    }

    fn extract_rigid(&self, source: &ParamSource<'_>, pending: &mut Pending<'_>, out: &mut Decomposition) -> Result<()> {
        'restart: loop {
            if pending.entities.len() < 2 {
                return Ok(());
            }
            for seed_index in 0..pending.entities.len() {
                let mut set = vec![pending.entities[seed_index]];
                loop {
                    if set.len() == pending.entities.len() {
                        break;
                    }
                    let internal = internal_constraints(pending, &set);
                    if !internal.is_empty()
                        && !newer_than_boundary(pending, &set, &internal)
                        && self.is_rigid(source, pending, &set, &internal)?
                    {
                        let mut entities = set.clone();
                        entities.sort_by_key(|e| pending.graph.seq(*e));
                        let id = self.push_cluster(pending, entities.clone(), internal.clone(), true, out);
                        out.substitutions.push(Substitution { cluster: id, frozen: entities.clone() });
                        for e in &entities {
                            pending.frozen.insert(*e, id);
                        }
                        pending.entities.retain(|e| !entities.contains(e));
                        pending.constraints.retain(|ci| !internal.contains(ci));
                        continue 'restart;
                    }
                    if set.len() >= self.config.max_seed_entities {
                        break;
                    }
                    match next_neighbor(pending, &set) {
                        Some(e) => set.push(e),
                        None => break,
                    }
                }
            }
            return Ok(());
        }
    }

    /// Zero DOF left and every constraint row independent.
    fn is_rigid(
        &self,
        source: &ParamSource<'_>,
        pending: &Pending<'_>,
        set: &[EntityId],
        internal: &[usize],
    ) -> Result<bool> {
        let dof: usize = set.iter().map(|e| source.kind(*e).map(|k| k.dof())).sum::<Result<usize>>()?;
        let removed: usize = internal.iter().map(|&ci| pending.graph.constraints()[ci].dof_removed()).sum();
        if dof != removed {
            return Ok(false);
        }
        let mut unknowns = set.to_vec();
        unknowns.sort_by_key(|e| pending.graph.seq(*e));
        let constraints: Vec<&Constraint> = internal.iter().map(|&ci| pending.graph.constraints()[ci]).collect();
        let system = ClusterSystem::new(source, &unknowns, &constraints, self.curves, self.config.finite_difference_step)?;
        let analysis = dof::analyze(&system, system.initial(), self.config.rank_tolerance);
        Ok(analysis.is_well_constrained())
    }

    fn push_cluster(
        &self,
        pending: &Pending<'_>,
        entities: Vec<EntityId>,
        constraint_indices: Vec<usize>,
        rigid: bool,
        out: &mut Decomposition,
    ) -> ClusterId {
        let id = ClusterId(out.clusters.len());
        let graph = pending.graph;
        let mut inputs = Vec::new();
        let mut depends_on = BTreeSet::new();
        for &ci in &constraint_indices {
            for e in graph.constraints()[ci].entities() {
                if entities.contains(&e) || inputs.contains(&e) {
                    continue;
                }
                if let Some(upstream) = pending.frozen.get(&e) {
                    depends_on.insert(*upstream);
                }
                inputs.push(e);
            }
        }
        inputs.sort_by_key(|e| graph.seq(*e));
        out.clusters.push(Cluster {
            id,
            entities,
            constraints: constraint_indices.iter().map(|&ci| graph.constraints()[ci].id).collect(),
            inputs,
            depends_on: depends_on.into_iter().collect(),
            rigid,
        });
        id
    }
}

/// Pending constraints whose unfrozen free entities all lie in `set`.
fn internal_constraints(pending: &Pending<'_>, set: &[EntityId]) -> Vec<usize> {
    pending
        .constraints
        .iter()
        .copied()
        .filter(|&ci| {
            let mut touches = false;
            for e in pending.graph.touched(ci) {
                if pending.frozen.contains_key(e) {
                    continue;
                }
                if !set.contains(e) {
                    return false;
                }
                touches = true;
            }
            touches
        })
        .collect()
}

/// True when some constraint inside `set` was added after a pending constraint
/// that links `set` to the rest of the component. Such a set stays unfrozen so
/// the newest constraint is always solved downstream of the older ones.
fn newer_than_boundary(pending: &Pending<'_>, set: &[EntityId], internal: &[usize]) -> bool {
    let seq = |ci: usize| pending.graph.constraints()[ci].seq;
    let newest_internal = internal.iter().map(|&ci| seq(ci)).max();
    let oldest_boundary = pending
        .constraints
        .iter()
        .copied()
        .filter(|ci| !internal.contains(ci))
        .filter(|&ci| pending.graph.touched(ci).iter().any(|e| set.contains(e)))
        .map(seq)
        .min();
    matches!((newest_internal, oldest_boundary), (Some(newest), Some(oldest)) if newest > oldest)
}

/// Oldest unfrozen entity adjacent to `set` through a pending constraint.
fn next_neighbor(pending: &Pending<'_>, set: &[EntityId]) -> Option<EntityId> {
    pending
        .entities
        .iter()
        .copied()
        .filter(|e| !set.contains(e))
        .find(|candidate| {
            pending.constraints.iter().any(|&ci| {
                let touched = pending.graph.touched(ci);
                touched.contains(candidate) && touched.iter().any(|e| set.contains(e))
            })
        })
}
