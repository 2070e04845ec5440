//! Stacked residual system for one cluster.
//!
//! The unknown vector concatenates the parameters of the cluster's free
//! entities. Every other entity a constraint reads (fixed entities, entities
//! frozen by an upstream cluster, a dragged entity) is a constant input taken
//! from a [`ParamSource`].

use crate::constraint::eval::{self, EvalContext, EvalFailure, LocalLayout};
use crate::constraint::{Constraint, ConstraintId, ConstraintKind, CurveEvaluator};
use crate::error::{Result, SolverError};
use crate::solver::lm::LeastSquares;
use crate::store::{EntityId, EntityKind, EntityStore, WriteBatch};
use nalgebra::{DMatrix, DVector};
use std::borrow::Cow;
use std::collections::HashMap;
use std::ops::Range;

/// Parameter values seen by a solve: overlay entries shadow the store.
#[derive(Clone, Copy)]
pub struct ParamSource<'s> {
    store: &'s EntityStore,
    overlay: Option<&'s HashMap<EntityId, Vec<f64>>>,
}

impl<'s> ParamSource<'s> {
    pub fn new(store: &'s EntityStore) -> Self {
        Self { store, overlay: None }
    }

    pub fn with_overlay(store: &'s EntityStore, overlay: &'s HashMap<EntityId, Vec<f64>>) -> Self {
        Self { store, overlay: Some(overlay) }
    }

    pub fn store(&self) -> &'s EntityStore {
        self.store
    }

    pub fn params(&self, id: EntityId) -> Result<Vec<f64>> {
        if let Some(values) = self.overlay.and_then(|o| o.get(&id)) {
            return Ok(values.clone());
        }
        self.store.params(id)
    }

    pub fn kind(&self, id: EntityId) -> Result<EntityKind> {
        self.store.kind(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Unknown {
    pub entity: EntityId,
    pub kind: EntityKind,
    pub offset: usize,
}

pub(crate) struct Term<'a> {
    pub id: ConstraintId,
    pub seq: u64,
    pub kind: Cow<'a, ConstraintKind>,
    pub rows: Range<usize>,
    /// Unknown entities this constraint reads.
    pub unknowns: Vec<EntityId>,
    layout: LocalLayout,
    base: Vec<f64>,
    /// Local parameter index -> column of the unknown vector.
    columns: Vec<Option<usize>>,
}

pub struct ClusterSystem<'a> {
    unknowns: Vec<Unknown>,
    terms: Vec<Term<'a>>,
    x0: Vec<f64>,
    m: usize,
    curves: &'a dyn CurveEvaluator,
    fd_step: f64,
}

impl<'a> ClusterSystem<'a> {
    /// `unknowns` and `constraints` are expected in creation order.
    pub fn new(
        source: &ParamSource<'_>,
        unknowns: &[EntityId],
        constraints: &[&'a Constraint],
        curves: &'a dyn CurveEvaluator,
        fd_step: f64,
    ) -> Result<Self> {
        let mut slots = Vec::with_capacity(unknowns.len());
        let mut column_of = HashMap::new();
        let mut x0 = Vec::new();
        for &entity in unknowns {
            let kind = source.kind(entity)?;
            column_of.insert(entity, x0.len());
            slots.push(Unknown { entity, kind, offset: x0.len() });
            x0.extend(source.params(entity)?);
        }

        let mut terms = Vec::with_capacity(constraints.len());
        let mut m = 0;
        for constraint in constraints {
            let layout = LocalLayout::for_constraint(&constraint.kind, |id| source.kind(id).ok())
                .ok_or_else(|| stale_reference(constraint, source))?;
            let mut base = Vec::with_capacity(layout.len());
            let mut columns = Vec::with_capacity(layout.len());
            let mut term_unknowns = Vec::new();
            for slot in layout.slots() {
                let params = source.params(slot.entity)?;
                match column_of.get(&slot.entity) {
                    Some(&col) => {
                        term_unknowns.push(slot.entity);
                        columns.extend((0..params.len()).map(|k| Some(col + k)));
                    }
                    None => columns.extend(std::iter::repeat(None).take(params.len())),
                }
                base.extend(params);
            }
            let rows = m..m + constraint.dof_removed();
            m = rows.end;
            terms.push(Term {
                id: constraint.id,
                seq: constraint.seq,
                kind: Cow::Borrowed(&constraint.kind),
                rows,
                unknowns: term_unknowns,
                layout,
                base,
                columns,
            });
        }

        Ok(Self { unknowns: slots, terms, x0, m, curves, fd_step })
    }

    /// Replace every joint target with its value clamped into the joint limits.
    pub fn clamp_joint_targets(&mut self) {
        for term in &mut self.terms {
            if term.kind.joint_target().is_some() {
                term.kind = Cow::Owned(term.kind.clamped());
            }
        }
    }

    pub(crate) fn unknowns(&self) -> &[Unknown] {
        &self.unknowns
    }

    pub(crate) fn terms(&self) -> &[Term<'a>] {
        &self.terms
    }

    /// Current values of the unknowns.
    pub fn initial(&self) -> &[f64] {
        &self.x0
    }

    pub fn constraint_ids(&self) -> Vec<ConstraintId> {
        self.terms.iter().map(|t| t.id).collect()
    }

    fn context(&self) -> EvalContext<'_> {
        EvalContext { curves: self.curves, fd_step: self.fd_step }
    }

    fn local(&self, term: &Term<'_>, x: &[f64]) -> Vec<f64> {
        let mut v = term.base.clone();
        for (k, col) in term.columns.iter().enumerate() {
            if let Some(c) = col {
                v[k] = x[*c];
            }
        }
        v
    }

    /// Largest absolute residual of each constraint, in creation order.
    pub fn constraint_residuals(&self, x: &[f64]) -> std::result::Result<Vec<(ConstraintId, f64)>, EvalFailure> {
        let ctx = self.context();
        self.terms
            .iter()
            .map(|term| {
                let r = eval::residual(&term.kind, &term.layout, &self.local(term, x), &ctx)?;
                Ok((term.id, r.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()))))
            })
            .collect()
    }

    /// Parameter writes for the unknowns at `x`.
    pub fn write_batch(&self, x: &[f64]) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for u in &self.unknowns {
            batch.push(u.entity, x[u.offset..u.offset + u.kind.param_count()].to_vec());
        }
        batch
    }
}

fn stale_reference(constraint: &Constraint, source: &ParamSource<'_>) -> SolverError {
    constraint
        .entities()
        .into_iter()
        .find(|id| source.kind(*id).is_err())
        .map(SolverError::StaleEntity)
        .unwrap_or(SolverError::StaleConstraint(constraint.id))
}

impl LeastSquares for ClusterSystem<'_> {
    fn dimension(&self) -> usize {
        self.x0.len()
    }

    fn residual_len(&self) -> usize {
        self.m
    }

    fn residual(&self, x: &[f64]) -> std::result::Result<DVector<f64>, EvalFailure> {
        let ctx = self.context();
        let mut f = DVector::zeros(self.m);
        for term in &self.terms {
            let r = eval::residual(&term.kind, &term.layout, &self.local(term, x), &ctx)?;
            for (i, v) in r.into_iter().enumerate() {
                f[term.rows.start + i] = v;
            }
        }
        Ok(f)
    }

    fn linearize(&self, x: &[f64]) -> std::result::Result<(DVector<f64>, DMatrix<f64>), EvalFailure> {
        let ctx = self.context();
        let mut f = DVector::zeros(self.m);
        let mut jac = DMatrix::zeros(self.m, self.x0.len());
        for term in &self.terms {
            let (r, local_jac) = eval::evaluate(&term.kind, &term.layout, &self.local(term, x), &ctx)?;
            for (i, v) in r.into_iter().enumerate() {
                let row = term.rows.start + i;
                f[row] = v;
                for (k, col) in term.columns.iter().enumerate() {
                    if let Some(c) = col {
                        jac[(row, *c)] += local_jac[(i, k)];
                    }
                }
            }
        }
        Ok((f, jac))
    }
}
