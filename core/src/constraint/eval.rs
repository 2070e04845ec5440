//! Residuals and Jacobians for every [`ConstraintKind`].
//!
//! A constraint is evaluated over a local parameter vector: the parameters of
//! the entities it references, concatenated in the order given by a
//! [`LocalLayout`]. Most kinds have closed-form derivatives; 3D directional
//! kinds, tangency to kernel curves and joints use central finite differences.

use super::curve::{CurveEvaluator, CurveId};
use super::joint;
use super::{ConstraintKind, PointRef};
use crate::geometry::{least_aligned_axis, orthonormal_basis, wrap_angle, Vector3, DEGENERATE_LENGTH};
use crate::store::{EntityId, EntityKind};
use nalgebra::{DMatrix, RowDVector};

/// Why a constraint could not be evaluated at a parameter vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalFailure {
    /// Geometry collapsed so the residual has no defined derivative, e.g. a zero-length direction.
    Degenerate,
    /// The curve oracle returned no sample.
    Curve(CurveId),
    /// The layout does not cover an entity the constraint references.
    Layout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalSlot {
    pub entity: EntityId,
    pub kind: EntityKind,
    pub offset: usize,
}

/// Offsets of each referenced entity inside a local parameter vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalLayout {
    slots: Vec<LocalSlot>,
    len: usize,
}

impl LocalLayout {
    /// Layout over `kind.entities()`; `None` if a kind cannot be resolved.
    pub fn for_constraint(kind: &ConstraintKind, kind_of: impl Fn(EntityId) -> Option<EntityKind>) -> Option<Self> {
        let mut slots = Vec::new();
        let mut len = 0;
        for entity in kind.entities() {
            let k = kind_of(entity)?;
            slots.push(LocalSlot { entity, kind: k, offset: len });
            len += k.param_count();
        }
        Some(Self { slots, len })
    }

    pub fn slots(&self) -> &[LocalSlot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn slot(&self, entity: EntityId) -> Result<&LocalSlot, EvalFailure> {
        self.slots.iter().find(|s| s.entity == entity).ok_or(EvalFailure::Layout)
    }
}

pub struct EvalContext<'a> {
    pub curves: &'a dyn CurveEvaluator,
    /// Relative central-difference step.
    pub fd_step: f64,
}

/// A point and its 3 x n derivative over the local parameters.
struct PointEval {
    pos: Vector3,
    grad: DMatrix<f64>,
}

/// A unit direction and its 3 x n derivative.
struct DirEval {
    unit: Vector3,
    grad: DMatrix<f64>,
}

fn point(layout: &LocalLayout, x: &[f64], p: &PointRef) -> Result<PointEval, EvalFailure> {
    let slot = layout.slot(p.entity)?;
    let o = slot.offset;
    let mut grad = DMatrix::zeros(3, layout.len());
    let pos = match (slot.kind, p.index) {
        (EntityKind::Arc, 1 | 2) => {
            let ai = o + 2 + p.index as usize;
            let (s, c) = x[ai].sin_cos();
            let r = x[o + 2];
            grad[(0, o)] = 1.0;
            grad[(1, o + 1)] = 1.0;
            grad[(0, o + 2)] = c;
            grad[(1, o + 2)] = s;
            grad[(0, ai)] = -r * s;
            grad[(1, ai)] = r * c;
            Vector3::new(x[o] + r * c, x[o + 1] + r * s, 0.0)
        }
        (kind, 0) if kind.dimension() == 2 => {
            grad[(0, o)] = 1.0;
            grad[(1, o + 1)] = 1.0;
            Vector3::new(x[o], x[o + 1], 0.0)
        }
        (kind, 0) if kind.dimension() == 3 => {
            for k in 0..3 {
                grad[(k, o + k)] = 1.0;
            }
            Vector3::new(x[o], x[o + 1], x[o + 2])
        }
        _ => return Err(EvalFailure::Layout),
    };
    Ok(PointEval { pos, grad })
}

fn direction(layout: &LocalLayout, x: &[f64], entity: EntityId) -> Result<DirEval, EvalFailure> {
    let slot = layout.slot(entity)?;
    let range = slot.kind.direction_range().ok_or(EvalFailure::Layout)?;
    let start = slot.offset + range.start;
    let dim = range.len();
    let mut v = Vector3::zeros();
    for k in 0..dim {
        v[k] = x[start + k];
    }
    let len = v.norm();
    if len < DEGENERATE_LENGTH {
        return Err(EvalFailure::Degenerate);
    }
    let unit = v / len;
    // d(v/|v|)/dv = (I - u u^T) / |v|
    let mut grad = DMatrix::zeros(3, layout.len());
    for i in 0..dim {
        for k in 0..dim {
            let delta = if i == k { 1.0 } else { 0.0 };
            grad[(i, start + k)] = (delta - unit[i] * unit[k]) / len;
        }
    }
    Ok(DirEval { unit, grad })
}

/// Radius value and its local column.
fn radius(layout: &LocalLayout, x: &[f64], entity: EntityId) -> Result<(f64, usize), EvalFailure> {
    let slot = layout.slot(entity)?;
    let col = slot.offset + slot.kind.radius_index().ok_or(EvalFailure::Layout)?;
    Ok((x[col], col))
}

fn scalar(layout: &LocalLayout, x: &[f64], entity: EntityId) -> Result<(f64, usize), EvalFailure> {
    let slot = layout.slot(entity)?;
    if slot.kind != EntityKind::Scalar {
        return Err(EvalFailure::Layout);
    }
    Ok((x[slot.offset], slot.offset))
}

fn body<'x>(layout: &LocalLayout, x: &'x [f64], entity: EntityId) -> Result<&'x [f64], EvalFailure> {
    let slot = layout.slot(entity)?;
    if slot.kind != EntityKind::Body {
        return Err(EvalFailure::Layout);
    }
    Ok(&x[slot.offset..slot.offset + 6])
}

fn dimension(layout: &LocalLayout, entity: EntityId) -> Result<usize, EvalFailure> {
    layout.slot(entity).map(|s| s.kind.dimension())
}

/// `sum_k v[k] * g.row(k)`
fn dot_grad(v: &Vector3, g: &DMatrix<f64>) -> RowDVector<f64> {
    let mut out = RowDVector::zeros(g.ncols());
    for k in 0..3 {
        if v[k] != 0.0 {
            out += g.row(k) * v[k];
        }
    }
    out
}

/// Signed 2D distance of `p` from the line (`o`, `u`), scaled by |u| = 1, and its gradient.
fn signed_offset(o: &PointEval, u: &DirEval, p: &PointEval) -> (f64, RowDVector<f64>) {
    let w = p.pos - o.pos;
    let value = u.unit.x * w.y - u.unit.y * w.x;
    let gw = &p.grad - &o.grad;
    let grad = u.grad.row(0) * w.y + gw.row(1) * u.unit.x - u.grad.row(1) * w.x - gw.row(0) * u.unit.y;
    (value, grad)
}

/// Residual rows and Jacobian of `kind` at `x`.
pub fn evaluate(
    kind: &ConstraintKind,
    layout: &LocalLayout,
    x: &[f64],
    ctx: &EvalContext<'_>,
) -> Result<(Vec<f64>, DMatrix<f64>), EvalFailure> {
    if uses_finite_differences(kind, layout)? {
        // Every difference step projects onto the basis chosen at `x`
        let helper = basis_helper(kind, layout, x)?;
        let r = fd_residual(kind, layout, x, ctx, &helper)?;
        let j = finite_difference(|shifted| fd_residual(kind, layout, shifted, ctx, &helper), x, r.len(), ctx.fd_step)?;
        Ok((r, j))
    } else {
        closed_form(kind, layout, x, ctx)
    }
}

/// Residual rows of `kind` at `x`, without the Jacobian.
pub fn residual(
    kind: &ConstraintKind,
    layout: &LocalLayout,
    x: &[f64],
    ctx: &EvalContext<'_>,
) -> Result<Vec<f64>, EvalFailure> {
    if uses_finite_differences(kind, layout)? {
        fd_residual(kind, layout, x, ctx, &basis_helper(kind, layout, x)?)
    } else {
        closed_form(kind, layout, x, ctx).map(|(r, _)| r)
    }
}

fn uses_finite_differences(kind: &ConstraintKind, layout: &LocalLayout) -> Result<bool, EvalFailure> {
    Ok(match kind {
        ConstraintKind::Parallel { a, .. } | ConstraintKind::Angle { a, .. } => dimension(layout, *a)? == 3,
        ConstraintKind::TangentToCurve { .. }
        | ConstraintKind::Revolute { .. }
        | ConstraintKind::Prismatic { .. }
        | ConstraintKind::Cylindrical { .. } => true,
        _ => false,
    })
}

/// Helper axis for the orthogonal basis of a 3D directional residual, read at `x`.
/// Kinds without such a basis get an unused placeholder.
fn basis_helper(kind: &ConstraintKind, layout: &LocalLayout, x: &[f64]) -> Result<Vector3, EvalFailure> {
    Ok(match kind {
        ConstraintKind::Parallel { a, .. } => least_aligned_axis(&direction(layout, x, *a)?.unit),
        ConstraintKind::Revolute { a, frame_a, .. }
        | ConstraintKind::Prismatic { a, frame_a, .. }
        | ConstraintKind::Cylindrical { a, frame_a, .. } => joint::axis_helper(body(layout, x, *a)?, frame_a),
        _ => Vector3::z(),
    })
}

fn finite_difference<F>(f: F, x: &[f64], rows: usize, step: f64) -> Result<DMatrix<f64>, EvalFailure>
where
    F: Fn(&[f64]) -> Result<Vec<f64>, EvalFailure>,
{
    let mut jac = DMatrix::zeros(rows, x.len());
    let mut shifted = x.to_vec();
    for j in 0..x.len() {
        let h = step * x[j].abs().max(1.0);
        shifted[j] = x[j] + h;
        let fp = f(&shifted)?;
        shifted[j] = x[j] - h;
        let fm = f(&shifted)?;
        shifted[j] = x[j];
        for i in 0..rows {
            jac[(i, j)] = (fp[i] - fm[i]) / (2.0 * h);
        }
    }
    Ok(jac)
}

fn closed_form(
    kind: &ConstraintKind,
    layout: &LocalLayout,
    x: &[f64],
    ctx: &EvalContext<'_>,
) -> Result<(Vec<f64>, DMatrix<f64>), EvalFailure> {
    let n = layout.len();
    let mut rows: Vec<(f64, RowDVector<f64>)> = Vec::with_capacity(3);

    match kind {
        ConstraintKind::Coincident { a, b } => {
            let pa = point(layout, x, a)?;
            let pb = point(layout, x, b)?;
            for k in 0..dimension(layout, a.entity)? {
                rows.push((pa.pos[k] - pb.pos[k], pa.grad.row(k) - pb.grad.row(k)));
            }
        }
        ConstraintKind::Distance { a, b, value } => {
            let pa = point(layout, x, a)?;
            let pb = point(layout, x, b)?;
            let d = pa.pos - pb.pos;
            let len = d.norm();
            let r = len - value;
            let grad = if len > DEGENERATE_LENGTH {
                dot_grad(&(d / len), &(&pa.grad - &pb.grad))
            } else if r.abs() > DEGENERATE_LENGTH {
                return Err(EvalFailure::Degenerate);
            } else {
                RowDVector::zeros(n)
            };
            rows.push((r, grad));
        }
        ConstraintKind::HorizontalDistance { a, b, value } | ConstraintKind::VerticalDistance { a, b, value } => {
            let k = usize::from(matches!(kind, ConstraintKind::VerticalDistance { .. }));
            let pa = point(layout, x, a)?;
            let pb = point(layout, x, b)?;
            rows.push((pb.pos[k] - pa.pos[k] - value, pb.grad.row(k) - pa.grad.row(k)));
        }
        ConstraintKind::Horizontal { line } => {
            let u = direction(layout, x, *line)?;
            rows.push((u.unit.y, u.grad.row(1).into_owned()));
        }
        ConstraintKind::Vertical { line } => {
            let u = direction(layout, x, *line)?;
            rows.push((u.unit.x, u.grad.row(0).into_owned()));
        }
        ConstraintKind::Parallel { a, b } => {
            let ua = direction(layout, x, *a)?;
            let ub = direction(layout, x, *b)?;
            let r = ua.unit.x * ub.unit.y - ua.unit.y * ub.unit.x;
            let g = ua.grad.row(0) * ub.unit.y - ua.grad.row(1) * ub.unit.x + ub.grad.row(1) * ua.unit.x
                - ub.grad.row(0) * ua.unit.y;
            rows.push((r, g));
        }
        ConstraintKind::Perpendicular { a, b } => {
            let ua = direction(layout, x, *a)?;
            let ub = direction(layout, x, *b)?;
            rows.push((ua.unit.dot(&ub.unit), dot_grad(&ub.unit, &ua.grad) + dot_grad(&ua.unit, &ub.grad)));
        }
        ConstraintKind::Angle { a, b, value } => {
            let ua = direction(layout, x, *a)?;
            let ub = direction(layout, x, *b)?;
            let c = ua.unit.x * ub.unit.x + ua.unit.y * ub.unit.y;
            let s = ua.unit.x * ub.unit.y - ua.unit.y * ub.unit.x;
            let dc = dot_grad(&ub.unit, &ua.grad) + dot_grad(&ua.unit, &ub.grad);
            let ds = ua.grad.row(0) * ub.unit.y - ua.grad.row(1) * ub.unit.x + ub.grad.row(1) * ua.unit.x
                - ub.grad.row(0) * ua.unit.y;
            // d atan2(s, c) = (c ds - s dc) / (s^2 + c^2), and s^2 + c^2 = 1 for unit vectors.
            rows.push((wrap_angle(s.atan2(c) - value), ds * c - dc * s));
        }
        ConstraintKind::Tangent { a, b } => {
            let ka = layout.slot(*a)?.kind;
            let kb = layout.slot(*b)?.kind;
            rows.push(match (ka, kb) {
                (EntityKind::Line, _) => line_circle_tangent(layout, x, *a, *b)?,
                (_, EntityKind::Line) => line_circle_tangent(layout, x, *b, *a)?,
                _ => circle_circle_tangent(layout, x, *a, *b)?,
            });
        }
        ConstraintKind::PointOnLine { point: p, line } => {
            let o = point(layout, x, &PointRef::from(*line))?;
            let u = direction(layout, x, *line)?;
            let pe = point(layout, x, p)?;
            rows.push(signed_offset(&o, &u, &pe));
        }
        ConstraintKind::DistancePointLine { point: p, line, value } => {
            let o = point(layout, x, &PointRef::from(*line))?;
            let u = direction(layout, x, *line)?;
            let pe = point(layout, x, p)?;
            let (sd, g) = signed_offset(&o, &u, &pe);
            let sign = if sd < 0.0 { -1.0 } else { 1.0 };
            rows.push((sd.abs() - value, g * sign));
        }
        ConstraintKind::Radius { entity, value } => {
            let (r, col) = radius(layout, x, *entity)?;
            let mut g = RowDVector::zeros(n);
            g[col] = 1.0;
            rows.push((r - value, g));
        }
        ConstraintKind::EqualRadius { a, b } => {
            let (ra, ca) = radius(layout, x, *a)?;
            let (rb, cb) = radius(layout, x, *b)?;
            let mut g = RowDVector::zeros(n);
            g[ca] += 1.0;
            g[cb] -= 1.0;
            rows.push((ra - rb, g));
        }
        ConstraintKind::Fix { point: p, position } => {
            let pe = point(layout, x, p)?;
            for k in 0..dimension(layout, p.entity)? {
                rows.push((pe.pos[k] - position[k], pe.grad.row(k).into_owned()));
            }
        }
        ConstraintKind::Symmetric { a, b, axis } => {
            let pa = point(layout, x, a)?;
            let pb = point(layout, x, b)?;
            let o = point(layout, x, &PointRef::from(*axis))?;
            let u = direction(layout, x, *axis)?;
            let mid = PointEval { pos: (pa.pos + pb.pos) * 0.5, grad: (&pa.grad + &pb.grad) * 0.5 };
            rows.push(signed_offset(&o, &u, &mid));
            let d = pb.pos - pa.pos;
            let gd = &pb.grad - &pa.grad;
            rows.push((u.unit.dot(&d), dot_grad(&d, &u.grad) + dot_grad(&u.unit, &gd)));
        }
        ConstraintKind::PointOnCurve { point: p, curve, param } => {
            let pe = point(layout, x, p)?;
            let (t, col) = scalar(layout, x, *param)?;
            let sample = ctx.curves.evaluate(*curve, t).ok_or(EvalFailure::Curve(*curve))?;
            for k in 0..dimension(layout, p.entity)? {
                let mut g = pe.grad.row(k).into_owned();
                g[col] -= sample.tangent[k];
                rows.push((pe.pos[k] - sample.point[k], g));
            }
        }
        _ => return Err(EvalFailure::Layout),
    }

    let mut residual = Vec::with_capacity(rows.len());
    let mut jac = DMatrix::zeros(rows.len(), n);
    for (i, (r, g)) in rows.into_iter().enumerate() {
        residual.push(r);
        jac.set_row(i, &g);
    }
    Ok((residual, jac))
}

/// `|cross(u, c - o)| - R`: the circle's center sits one radius away from the line.
fn line_circle_tangent(
    layout: &LocalLayout,
    x: &[f64],
    line: EntityId,
    circle: EntityId,
) -> Result<(f64, RowDVector<f64>), EvalFailure> {
    let o = point(layout, x, &PointRef::from(line))?;
    let u = direction(layout, x, line)?;
    let c = point(layout, x, &PointRef::from(circle))?;
    let (r, col) = radius(layout, x, circle)?;
    let (sd, g) = signed_offset(&o, &u, &c);
    let sign = if sd < 0.0 { -1.0 } else { 1.0 };
    let mut g = g * sign;
    g[col] -= 1.0;
    Ok((sd.abs() - r, g))
}

/// External tangency (`d = Ra + Rb`) when the centers are farther apart than
/// the larger radius, internal (`d = |Ra - Rb|`) otherwise.
fn circle_circle_tangent(
    layout: &LocalLayout,
    x: &[f64],
    a: EntityId,
    b: EntityId,
) -> Result<(f64, RowDVector<f64>), EvalFailure> {
    let ca = point(layout, x, &PointRef::from(a))?;
    let cb = point(layout, x, &PointRef::from(b))?;
    let (ra, col_a) = radius(layout, x, a)?;
    let (rb, col_b) = radius(layout, x, b)?;
    let d = ca.pos - cb.pos;
    let len = d.norm();
    if len < DEGENERATE_LENGTH {
        return Err(EvalFailure::Degenerate);
    }
    let mut g = dot_grad(&(d / len), &(&ca.grad - &cb.grad));
    if len > ra.max(rb) {
        g[col_a] -= 1.0;
        g[col_b] -= 1.0;
        Ok((len - (ra + rb), g))
    } else {
        let sign = if ra >= rb { 1.0 } else { -1.0 };
        g[col_a] -= sign;
        g[col_b] += sign;
        Ok((len - (ra - rb).abs(), g))
    }
}

/// Residuals of the kinds whose Jacobian is taken by finite differences.
fn fd_residual(
    kind: &ConstraintKind,
    layout: &LocalLayout,
    x: &[f64],
    ctx: &EvalContext<'_>,
    helper: &Vector3,
) -> Result<Vec<f64>, EvalFailure> {
    match kind {
        ConstraintKind::Parallel { a, b } => {
            let ua = direction(layout, x, *a)?.unit;
            let ub = direction(layout, x, *b)?.unit;
            let (t1, t2) = orthonormal_basis(&ua, helper);
            Ok(vec![ub.dot(&t1), ub.dot(&t2)])
        }
        ConstraintKind::Angle { a, b, value } => {
            let ua = direction(layout, x, *a)?.unit;
            let ub = direction(layout, x, *b)?.unit;
            let theta = ua.cross(&ub).norm().atan2(ua.dot(&ub));
            Ok(vec![theta - value])
        }
        ConstraintKind::TangentToCurve { line, curve, param } => {
            let o = point(layout, x, &PointRef::from(*line))?.pos;
            let u = direction(layout, x, *line)?.unit;
            let (t, _) = scalar(layout, x, *param)?;
            let sample = ctx.curves.evaluate(*curve, t).ok_or(EvalFailure::Curve(*curve))?;
            let w = Vector3::new(sample.point[0] - o.x, sample.point[1] - o.y, 0.0);
            let tangent = Vector3::new(sample.tangent[0], sample.tangent[1], 0.0);
            let tlen = tangent.norm();
            if tlen < DEGENERATE_LENGTH {
                return Err(EvalFailure::Degenerate);
            }
            let tn = tangent / tlen;
            Ok(vec![u.x * w.y - u.y * w.x, u.x * tn.y - u.y * tn.x])
        }
        ConstraintKind::Revolute { a, b, frame_a, frame_b, target, .. } => Ok(joint::revolute_residual(
            body(layout, x, *a)?,
            body(layout, x, *b)?,
            frame_a,
            frame_b,
            *target,
            helper,
        )),
        ConstraintKind::Prismatic { a, b, frame_a, frame_b, target, .. } => Ok(joint::prismatic_residual(
            body(layout, x, *a)?,
            body(layout, x, *b)?,
            frame_a,
            frame_b,
            *target,
            helper,
        )),
        ConstraintKind::Cylindrical { a, b, frame_a, frame_b } => Ok(joint::cylindrical_residual(
            body(layout, x, *a)?,
            body(layout, x, *b)?,
            frame_a,
            frame_b,
            helper,
        )),
        _ => Err(EvalFailure::Layout),
    }
}
