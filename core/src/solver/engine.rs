//! Full solve pipeline: validate, check fixed-only constraints, decompose,
//! solve components (in parallel when there are enough of them), commit one
//! write batch per successful cluster, then diagnose what failed.

use crate::config::{JointLimitPolicy, SolverConfig};
use crate::constraint::eval::EvalFailure;
use crate::constraint::{Constraint, ConstraintId, ConstraintSet, CurveEvaluator, NoCurves};
use crate::error::{Result, SolverError};
use crate::solver::decompose::{Cluster, ClusterId, Component, Decomposer, Decomposition};
use crate::solver::diagnostics;
use crate::solver::dof::{self, DofAnalysis};
use crate::solver::lm::{self, LmOutcome, LmSettings};
use crate::solver::report::{ClusterReport, ClusterStatus, FailureReason, SolveReport};
use crate::solver::system::{ClusterSystem, ParamSource};
use crate::store::{EntityId, EntityStore, WriteBatch};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub(crate) type Lookup<'c> = HashMap<ConstraintId, &'c Constraint>;

/// Cooperative cancellation for a background solve, checked between clusters.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Read-only context shared by every cluster of one solve.
pub(crate) struct SolveContext<'a> {
    pub lookup: &'a Lookup<'a>,
    pub curves: &'a dyn CurveEvaluator,
    pub config: &'a SolverConfig,
    pub settings: LmSettings,
}

pub(crate) struct ClusterOutcome {
    pub report: ClusterReport,
    /// Present only for successful clusters.
    pub batch: Option<WriteBatch>,
}

pub(crate) fn cluster_constraints<'c>(cluster: &Cluster, lookup: &Lookup<'c>) -> Result<Vec<&'c Constraint>> {
    cluster
        .constraints
        .iter()
        .map(|id| lookup.get(id).copied().ok_or(SolverError::StaleConstraint(*id)))
        .collect()
}

/// Solve one cluster against `source` without touching the store.
pub(crate) fn solve_cluster(source: &ParamSource<'_>, cluster: &Cluster, ctx: &SolveContext<'_>) -> Result<ClusterOutcome> {
    let config = ctx.config;
    let report = |status: ClusterStatus, iterations: usize, max_residual: f64| ClusterReport {
        cluster: cluster.id,
        status,
        entities: cluster.entities.clone(),
        constraints: cluster.constraints.clone(),
        inputs: cluster.inputs.clone(),
        iterations,
        max_residual,
    };

    if cluster.constraints.is_empty() {
        let remaining_dof = cluster
            .entities
            .iter()
            .map(|e| source.kind(*e).map(|k| k.dof()))
            .sum::<Result<usize>>()?;
        let status = ClusterStatus::Underconstrained { remaining_dof, free_entities: cluster.entities.clone() };
        return Ok(ClusterOutcome { report: report(status, 0, 0.0), batch: None });
    }

    let constraints = cluster_constraints(cluster, ctx.lookup)?;
    let mut system = ClusterSystem::new(source, &cluster.entities, &constraints, ctx.curves, config.finite_difference_step)?;

    let out_of_limits: Vec<ConstraintId> = constraints
        .iter()
        .filter(|c| matches!(c.kind.joint_target(), Some((target, Some(limits))) if !limits.contains(target)))
        .map(|c| c.id)
        .collect();
    if !out_of_limits.is_empty() {
        match config.joint_limit_policy {
            JointLimitPolicy::Reject => {
                warn!(cluster = %cluster.id, joints = ?out_of_limits, "joint target outside its limits");
                let status = ClusterStatus::Conflicting { incompatible: out_of_limits };
                return Ok(ClusterOutcome { report: report(status, 0, 0.0), batch: None });
            }
            JointLimitPolicy::Clamp => {
                debug!(cluster = %cluster.id, joints = ?out_of_limits, "clamping joint targets");
                system.clamp_joint_targets();
            }
        }
    }

    let x0 = system.initial().to_vec();
    let analysis = dof::analyze(&system, &x0, config.rank_tolerance);
    if analysis.is_overconstrained() {
        let mut redundant = analysis.redundant;
        if redundant.is_empty() {
            redundant = constraints.iter().max_by_key(|c| c.seq).map(|c| vec![c.id]).unwrap_or_default();
        }
        warn!(cluster = %cluster.id, structural = analysis.dof as i64 - analysis.removed as i64, ?redundant, "cluster is overconstrained");
        let status = ClusterStatus::Overconstrained { redundant };
        return Ok(ClusterOutcome { report: report(status, 0, 0.0), batch: None });
    }

    let result = lm::solve(&system, &x0, &ctx.settings);
    let status = match result.outcome {
        LmOutcome::Converged => {
            let after = dof::analyze(&system, &result.x, config.rank_tolerance);
            if after.remaining_dof() > 0 {
                ClusterStatus::Underconstrained {
                    remaining_dof: after.remaining_dof(),
                    free_entities: after.free_entities,
                }
            } else {
                ClusterStatus::Solved
            }
        }
        LmOutcome::Stationary => ClusterStatus::Conflicting {
            incompatible: unsatisfied(&system, &result.x, config.residual_tolerance),
        },
        LmOutcome::NoConvergence => ClusterStatus::NumericalFailure(FailureReason::NoConvergence),
        LmOutcome::Singular => ClusterStatus::NumericalFailure(FailureReason::SingularConfiguration),
        LmOutcome::NonFinite => ClusterStatus::NumericalFailure(FailureReason::NonFinite),
        LmOutcome::Eval(EvalFailure::Curve(curve)) => {
            ClusterStatus::NumericalFailure(FailureReason::CurveEvaluation(curve))
        }
        LmOutcome::Eval(_) => ClusterStatus::NumericalFailure(FailureReason::SingularConfiguration),
    };

    if status.is_success() {
        debug!(
            cluster = %cluster.id,
            iterations = result.iterations,
            max_residual = result.max_residual,
            status = status.label(),
            "cluster solved"
        );
    } else {
        warn!(
            cluster = %cluster.id,
            iterations = result.iterations,
            max_residual = result.max_residual,
            status = status.label(),
            "cluster failed"
        );
    }

    let batch = status.is_success().then(|| system.write_batch(&result.x));
    Ok(ClusterOutcome { report: report(status, result.iterations, result.max_residual), batch })
}

/// Constraints whose residual exceeds `tolerance` at `x`, in creation order.
fn unsatisfied(system: &ClusterSystem<'_>, x: &[f64], tolerance: f64) -> Vec<ConstraintId> {
    let ids: Vec<ConstraintId> = match system.constraint_residuals(x) {
        Ok(residuals) => residuals.into_iter().filter(|(_, r)| *r >= tolerance).map(|(id, _)| id).collect(),
        Err(_) => Vec::new(),
    };
    if ids.is_empty() {
        system.constraint_ids()
    } else {
        ids
    }
}

/// Solve the clusters of one component in order. Values solved upstream are
/// passed downstream through an overlay; nothing is written to `store`.
pub(crate) fn run_component(
    store: &EntityStore,
    seed: &HashMap<EntityId, Vec<f64>>,
    decomposition: &Decomposition,
    component: &Component,
    ctx: &SolveContext<'_>,
    cancel: Option<&CancelToken>,
) -> Result<Vec<ClusterOutcome>> {
    let mut overlay = seed.clone();
    let mut failed: HashSet<ClusterId> = HashSet::new();
    let mut outcomes = Vec::with_capacity(component.clusters.len());

    for &id in &component.clusters {
        let Some(cluster) = decomposition.cluster(id) else {
            continue;
        };
        let unsolved = |status| ClusterOutcome {
            report: ClusterReport::unsolved(
                cluster.id,
                status,
                cluster.entities.clone(),
                cluster.constraints.clone(),
                cluster.inputs.clone(),
            ),
            batch: None,
        };

        if cancel.is_some_and(CancelToken::is_cancelled) {
            failed.insert(id);
            outcomes.push(unsolved(ClusterStatus::Cancelled));
            continue;
        }
        let upstream: Vec<ClusterId> = cluster.depends_on.iter().copied().filter(|d| failed.contains(d)).collect();
        if !upstream.is_empty() {
            failed.insert(id);
            outcomes.push(unsolved(ClusterStatus::Blocked { upstream }));
            continue;
        }

        let outcome = {
            let source = ParamSource::with_overlay(store, &overlay);
            solve_cluster(&source, cluster, ctx)?
        };
        if let Some(batch) = &outcome.batch {
            for (entity, params) in batch.iter() {
                overlay.insert(*entity, params.clone());
            }
        }
        if !outcome.report.status.is_success() {
            failed.insert(id);
        }
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

/// Split constraints over fixed entities into satisfied and violated.
pub(crate) fn check_fixed_only(
    source: &ParamSource<'_>,
    ids: &[ConstraintId],
    ctx: &SolveContext<'_>,
) -> Result<(Vec<ConstraintId>, Vec<ConstraintId>)> {
    let mut satisfied = Vec::new();
    let mut violated = Vec::new();
    for id in ids {
        let constraint = ctx.lookup.get(id).copied().ok_or(SolverError::StaleConstraint(*id))?;
        let system = ClusterSystem::new(source, &[], &[constraint], ctx.curves, ctx.config.finite_difference_step)?;
        match system.constraint_residuals(&[]) {
            Ok(r) if r.iter().all(|(_, v)| *v < ctx.config.residual_tolerance) => satisfied.push(*id),
            _ => violated.push(*id),
        }
    }
    Ok((satisfied, violated))
}

#[derive(Debug, Clone, Default)]
pub struct Solver {
    config: SolverConfig,
}

impl Solver {
    pub fn new(config: SolverConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Solve every active constraint, committing successful clusters to `store`.
    pub fn solve(&self, store: &mut EntityStore, constraints: &ConstraintSet) -> Result<SolveReport> {
        self.solve_with(store, constraints, &NoCurves, None)
    }

    /// Like [`Solver::solve`], with a kernel curve evaluator and an optional cancellation token.
    #[instrument(level = "debug", skip_all, fields(entities = store.len(), constraints = constraints.len()))]
    pub fn solve_with(
        &self,
        store: &mut EntityStore,
        constraints: &ConstraintSet,
        curves: &dyn CurveEvaluator,
        cancel: Option<&CancelToken>,
    ) -> Result<SolveReport> {
        constraints.validate(store)?;
        let active = constraints.active();
        let lookup: Lookup<'_> = active.iter().map(|c| (c.id, *c)).collect();
        let ctx = SolveContext { lookup: &lookup, curves, config: &self.config, settings: LmSettings::from_config(&self.config) };

        let snapshot: &EntityStore = store;
        let source = ParamSource::new(snapshot);
        let decomposition = Decomposer::new(&self.config, curves).decompose(&source, &active, |e| !e.fixed)?;
        let (trivially_satisfied, violated) = check_fixed_only(&source, &decomposition.fixed_only, &ctx)?;
        let total_dof = snapshot.iter().filter(|e| !e.fixed).map(|e| e.kind().dof()).sum();

        let empty = HashMap::new();
        let run = |component: &Component| run_component(snapshot, &empty, &decomposition, component, &ctx, cancel);
        let per_component: Vec<Vec<ClusterOutcome>> =
            if self.config.parallel && decomposition.components.len() >= self.config.parallel_min_components {
                decomposition.components.par_iter().map(run).collect::<Result<_>>()?
            } else {
                decomposition.components.iter().map(run).collect::<Result<_>>()?
            };

        let mut clusters = Vec::with_capacity(decomposition.clusters.len() + 1);
        for outcome in per_component.into_iter().flatten() {
            if let Some(batch) = &outcome.batch {
                store.apply_batch(batch)?;
            }
            clusters.push(outcome.report);
        }
        clusters.sort_by_key(|c| c.cluster);

        if !violated.is_empty() {
            warn!(constraints = ?violated, "constraints between fixed entities are violated");
            clusters.push(fixed_conflict(ClusterId(decomposition.clusters.len()), violated, &lookup, store));
        }

        let mut diagnostics_out = Vec::new();
        if self.config.diagnose_failures {
            let source = ParamSource::new(store);
            for report in clusters.iter().filter(|c| c.status.needs_diagnosis()) {
                diagnostics_out.push(match decomposition.cluster(report.cluster) {
                    Some(cluster) => diagnostics::diagnose(&source, cluster, &report.status, &ctx)?,
                    None => diagnostics::relax_all(report, &lookup, &source),
                });
            }
        }

        let report = SolveReport {
            cancelled: clusters.iter().any(|c| c.status == ClusterStatus::Cancelled),
            clusters,
            trivially_satisfied,
            diagnostics: diagnostics_out,
            total_dof,
        };
        info!(summary = %report.summary(), "solve finished");
        Ok(report)
    }

    /// Decomposition of the active constraints at the current configuration.
    pub fn decompose(
        &self,
        store: &EntityStore,
        constraints: &ConstraintSet,
        curves: &dyn CurveEvaluator,
    ) -> Result<Decomposition> {
        constraints.validate(store)?;
        let active = constraints.active();
        Decomposer::new(&self.config, curves).decompose(&ParamSource::new(store), &active, |e| !e.fixed)
    }

    /// DOF analysis of every cluster with constraints, without solving.
    pub fn analyze(
        &self,
        store: &EntityStore,
        constraints: &ConstraintSet,
        curves: &dyn CurveEvaluator,
    ) -> Result<Vec<(ClusterId, DofAnalysis)>> {
        let decomposition = self.decompose(store, constraints, curves)?;
        let active = constraints.active();
        let lookup: Lookup<'_> = active.iter().map(|c| (c.id, *c)).collect();
        let source = ParamSource::new(store);
        let mut out = Vec::new();
        for cluster in decomposition.clusters.iter().filter(|c| !c.constraints.is_empty()) {
            let members = cluster_constraints(cluster, &lookup)?;
            let system =
                ClusterSystem::new(&source, &cluster.entities, &members, curves, self.config.finite_difference_step)?;
            out.push((cluster.id, dof::analyze(&system, system.initial(), self.config.rank_tolerance)));
        }
        Ok(out)
    }
}

/// Report for constraints that only read fixed entities and do not hold.
pub(crate) fn fixed_conflict(id: ClusterId, violated: Vec<ConstraintId>, lookup: &Lookup<'_>, store: &EntityStore) -> ClusterReport {
    let mut inputs: Vec<EntityId> = Vec::new();
    for c in violated.iter().filter_map(|id| lookup.get(id)) {
        for e in c.entities() {
            if !inputs.contains(&e) {
                inputs.push(e);
            }
        }
    }
    inputs.sort_by_key(|e| store.get(*e).map(|entity| entity.seq).unwrap_or(u64::MAX));
    ClusterReport::unsolved(
        id,
        ClusterStatus::Conflicting { incompatible: violated.clone() },
        Vec::new(),
        violated,
        inputs,
    )
}
