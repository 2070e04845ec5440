//! Relax suggestions for clusters that could not be solved.
//!
//! Constraints are taken out of a scratch copy of the cluster one at a time,
//! newest first among those the last attempt implicated, until the remainder
//! solves or the step budget runs out. The store is never written.

use crate::constraint::{Constraint, ConstraintId};
use crate::error::Result;
use crate::solver::decompose::{Cluster, ClusterId};
use crate::solver::engine::{cluster_constraints, solve_cluster, Lookup, SolveContext};
use crate::solver::report::{ClusterReport, ClusterStatus};
use crate::solver::system::ParamSource;
use crate::store::EntityId;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub cluster: ClusterId,
    /// Constraints to delete or suppress, most recent first.
    pub relax: Vec<ConstraintId>,
    /// Entities referenced by `relax`, in creation order.
    pub entities: Vec<EntityId>,
    /// Whether the cluster solves once `relax` is removed.
    pub resolved: bool,
}

impl Diagnosis {
    fn new(cluster: ClusterId, mut relax: Vec<&Constraint>, source: &ParamSource<'_>, resolved: bool) -> Self {
        relax.sort_by(|a, b| b.seq.cmp(&a.seq));
        let mut entities: Vec<EntityId> = Vec::new();
        for constraint in &relax {
            for e in constraint.entities() {
                if !entities.contains(&e) {
                    entities.push(e);
                }
            }
        }
        let store = source.store();
        entities.sort_by_key(|e| store.get(*e).map(|entity| entity.seq).unwrap_or(u64::MAX));
        Self { cluster, relax: relax.iter().map(|c| c.id).collect(), entities, resolved }
    }
}

fn implicated(status: &ClusterStatus) -> &[ConstraintId] {
    match status {
        ClusterStatus::Overconstrained { redundant } => redundant,
        ClusterStatus::Conflicting { incompatible } => incompatible,
        _ => &[],
    }
}

/// Find a relax set for a cluster that ended with `status`.
pub(crate) fn diagnose(
    source: &ParamSource<'_>,
    cluster: &Cluster,
    status: &ClusterStatus,
    ctx: &SolveContext<'_>,
) -> Result<Diagnosis> {
    let mut remaining = cluster_constraints(cluster, ctx.lookup)?;
    let mut relax: Vec<&Constraint> = Vec::new();
    let mut current = status.clone();
    let mut resolved = false;

    for _ in 0..ctx.config.max_diagnostic_steps {
        let blamed = implicated(&current);
        let pick = remaining
            .iter()
            .filter(|c| blamed.contains(&c.id))
            .max_by_key(|c| c.seq)
            .or_else(|| remaining.iter().max_by_key(|c| c.seq))
            .copied();
        let Some(pick) = pick else {
            break;
        };
        remaining.retain(|c| c.id != pick.id);
        relax.push(pick);

        let scratch = Cluster { constraints: remaining.iter().map(|c| c.id).collect(), ..cluster.clone() };
        current = solve_cluster(source, &scratch, ctx)?.report.status;
        debug!(cluster = %cluster.id, relaxed = %pick.id, status = current.label(), "diagnostic step");
        if current.is_success() {
            resolved = true;
            break;
        }
        if !current.needs_diagnosis() {
            break;
        }
    }

    Ok(Diagnosis::new(cluster.id, relax, source, resolved))
}

/// Every constraint of `report` goes; used for constraints between fixed entities.
pub(crate) fn relax_all(report: &ClusterReport, lookup: &Lookup<'_>, source: &ParamSource<'_>) -> Diagnosis {
    let relax: Vec<&Constraint> = report.constraints.iter().filter_map(|id| lookup.get(id).copied()).collect();
    Diagnosis::new(report.cluster, relax, source, true)
}
