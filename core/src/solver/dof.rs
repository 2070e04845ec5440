//! Degree-of-freedom analysis of a cluster before it is solved.
//!
//! Two passes run over the same cluster. The structural pass compares the
//! DOF of the free entities (`N`) with the nominal DOF removed by the
//! constraints (`M`) in O(constraints). The numerical pass adds Jacobian
//! rows constraint by constraint in creation order and flags a constraint
//! whose rows do not raise the rank. A constraint is only reported when it is
//! dependent both at the current configuration and at a fixed perturbation
//! of it, so an accidental alignment of the sketch is not mistaken for
//! redundancy.

use crate::constraint::ConstraintId;
use crate::solver::lm::LeastSquares;
use crate::solver::system::ClusterSystem;
use crate::store::EntityId;
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Offsets applied to the unknowns for the second rank test.
const PERTURBATION: [f64; 8] = [0.61, -0.37, 0.83, -0.29, 0.47, -0.71, 0.19, -0.53];
const PERTURBATION_SCALE: f64 = 1e-3;

/// Null-space components below this are treated as zero when attributing freedom to an entity.
const FREEDOM_THRESHOLD: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DofAnalysis {
    /// `N`: sum of the DOF of the free entities.
    pub dof: usize,
    /// `M`: sum of `dof_removed` over the constraints.
    pub removed: usize,
    /// Rank of the constraint Jacobian.
    pub rank: usize,
    /// Redundant constraints, newest first.
    pub redundant: Vec<ConstraintId>,
    /// Entities that keep some freedom, in creation order.
    pub free_entities: Vec<EntityId>,
}

impl DofAnalysis {
    /// `N - M`: negative when structurally overconstrained.
    pub fn structural(&self) -> i64 {
        self.dof as i64 - self.removed as i64
    }

    pub fn remaining_dof(&self) -> usize {
        self.dof.saturating_sub(self.rank)
    }

    pub fn is_overconstrained(&self) -> bool {
        self.structural() < 0 || !self.redundant.is_empty()
    }

    pub fn is_well_constrained(&self) -> bool {
        !self.is_overconstrained() && self.remaining_dof() == 0
    }
}

/// Structural check only: the constraints that find no spare capacity on
/// their entities when walked in creation order, newest first.
pub fn structural_redundancy(system: &ClusterSystem<'_>) -> Vec<ConstraintId> {
    let mut capacity: HashMap<EntityId, usize> =
        system.unknowns().iter().map(|u| (u.entity, u.kind.dof())).collect();
    let mut candidates = Vec::new();
    for term in system.terms() {
        let mut need = term.rows.len();
        let available: usize = term.unknowns.iter().map(|e| capacity.get(e).copied().unwrap_or(0)).sum();
        if available == 0 {
            candidates.push((term.seq, term.id));
            continue;
        }
        for entity in &term.unknowns {
            if let Some(cap) = capacity.get_mut(entity) {
                let used = need.min(*cap);
                *cap -= used;
                need -= used;
            }
        }
    }
    candidates.sort_by(|a, b| b.0.cmp(&a.0));
    candidates.into_iter().map(|(_, id)| id).collect()
}

/// Rank and per-constraint dependence of the Jacobian rows, by modified
/// Gram-Schmidt in creation order.
fn rank_pass(system: &ClusterSystem<'_>, jac: &DMatrix<f64>, tolerance: f64) -> (usize, Vec<bool>) {
    let mut basis: Vec<DVector<f64>> = Vec::new();
    let mut dependent = Vec::with_capacity(system.terms().len());
    for term in system.terms() {
        let mut all_raise = true;
        for row in term.rows.clone() {
            let mut v: DVector<f64> = jac.row(row).transpose();
            let norm0 = v.norm();
            for _ in 0..2 {
                for b in &basis {
                    let proj = b.dot(&v);
                    v -= b * proj;
                }
            }
            let norm = v.norm();
            if norm0 > 0.0 && norm > tolerance * norm0 {
                basis.push(v / norm);
            } else {
                all_raise = false;
            }
        }
        dependent.push(!all_raise);
    }
    (basis.len(), dependent)
}

fn perturbed(x: &[f64]) -> Vec<f64> {
    x.iter()
        .enumerate()
        .map(|(k, v)| v + PERTURBATION_SCALE * (1.0 + v.abs()) * PERTURBATION[k % PERTURBATION.len()])
        .collect()
}

/// Full analysis at `x`.
pub fn analyze(system: &ClusterSystem<'_>, x: &[f64], rank_tolerance: f64) -> DofAnalysis {
    let dof: usize = system.unknowns().iter().map(|u| u.kind.dof()).sum();
    let removed: usize = system.terms().iter().map(|t| t.rows.len()).sum();

    let at_x = system.linearize(x).ok();
    let x_p = perturbed(x);
    let at_p = system.linearize(&x_p).ok();

    let pass_x = at_x.as_ref().map(|(_, j)| rank_pass(system, j, rank_tolerance));
    let pass_p = at_p.as_ref().map(|(_, j)| rank_pass(system, j, rank_tolerance));

    let (rank, redundant) = match (&pass_x, &pass_p) {
        (Some((rx, dx)), Some((rp, dp))) => {
            let mut redundant: Vec<(u64, ConstraintId)> = system
                .terms()
                .iter()
                .enumerate()
                .filter(|(i, _)| dx[*i] && dp[*i])
                .map(|(_, t)| (t.seq, t.id))
                .collect();
            redundant.sort_by(|a, b| b.0.cmp(&a.0));
            ((*rx).max(*rp), redundant.into_iter().map(|(_, id)| id).collect())
        }
        // One configuration could not be evaluated; trust the other for the rank only.
        (Some((r, _)), None) | (None, Some((r, _))) => (*r, Vec::new()),
        (None, None) => (removed.min(dof), Vec::new()),
    };

    let redundant = if redundant.is_empty() && dof < removed {
        structural_redundancy(system)
    } else {
        redundant
    };

    let free_entities = match at_x.as_ref().or(at_p.as_ref()) {
        Some((_, jac)) if rank < dof => {
            let point = if at_x.is_some() { x } else { x_p.as_slice() };
            free_entities(system, jac, point, rank)
        }
        _ => Vec::new(),
    };

    DofAnalysis { dof, removed, rank, redundant, free_entities }
}

/// Entities whose non-gauge parameters carry a component of the Jacobian's null space.
fn free_entities(system: &ClusterSystem<'_>, jac: &DMatrix<f64>, x: &[f64], rank: usize) -> Vec<EntityId> {
    let n = jac.ncols();
    if n == 0 {
        return Vec::new();
    }
    let eigen = SymmetricEigen::new(jac.transpose() * jac);
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));
    let nullity = n.saturating_sub(rank);

    let mut free = HashSet::new();
    for &k in order.iter().take(nullity) {
        let mut v: DVector<f64> = eigen.eigenvectors.column(k).into_owned();
        // Scaling a stored direction changes nothing; drop that component.
        for u in system.unknowns() {
            if let Some(range) = u.kind.direction_range() {
                let start = u.offset + range.start;
                let dir = DVector::from_iterator(range.len(), (0..range.len()).map(|i| x[start + i]));
                let len = dir.norm();
                if len > 0.0 {
                    let unit = dir / len;
                    let radial = (0..range.len()).map(|i| v[start + i] * unit[i]).sum::<f64>();
                    for i in 0..range.len() {
                        v[start + i] -= radial * unit[i];
                    }
                }
            }
        }
        for u in system.unknowns() {
            let block = (u.offset..u.offset + u.kind.param_count()).map(|i| v[i] * v[i]).sum::<f64>().sqrt();
            if block > FREEDOM_THRESHOLD {
                free.insert(u.entity);
            }
        }
    }
    system.unknowns().iter().map(|u| u.entity).filter(|e| free.contains(e)).collect()
}
