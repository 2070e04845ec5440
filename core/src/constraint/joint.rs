//! Assembly joints between rigid bodies.
//!
//! A body's six parameters are its origin and a rotation vector. A joint
//! attaches a [`JointFrame`] to each body in body-local coordinates and
//! constrains the two frames once mapped to world space.

use crate::error::{Result, SolverError};
use crate::geometry::{least_aligned_axis, orthonormal_basis, rotation_from_vector, wrap_angle, Rotation3, Vector3, DEGENERATE_LENGTH};
use serde::{Deserialize, Serialize};

/// Anchor point, joint axis and a reference direction orthogonal to the axis,
/// all in body-local coordinates. The reference direction measures rotation
/// about the axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointFrame {
    anchor: [f64; 3],
    axis: [f64; 3],
    reference: [f64; 3],
}

impl JointFrame {
    /// Normalizes `axis` and projects `reference` onto the plane orthogonal to it.
    pub fn new(anchor: [f64; 3], axis: [f64; 3], reference: [f64; 3]) -> Result<Self> {
        if anchor.iter().chain(&axis).chain(&reference).any(|v| !v.is_finite()) {
            return Err(SolverError::InvalidJointFrame("non-finite component".to_string()));
        }
        let a = Vector3::from(axis);
        let len = a.norm();
        if len < DEGENERATE_LENGTH {
            return Err(SolverError::InvalidJointFrame("zero-length axis".to_string()));
        }
        let a = a / len;
        let r = Vector3::from(reference);
        let r = r - a * r.dot(&a);
        let rlen = r.norm();
        if rlen < DEGENERATE_LENGTH {
            return Err(SolverError::InvalidJointFrame("reference direction is parallel to the axis".to_string()));
        }
        let r = r / rlen;
        Ok(Self { anchor, axis: [a.x, a.y, a.z], reference: [r.x, r.y, r.z] })
    }

    /// Frame at `anchor` with its axis along local z and reference along local x.
    pub fn at(anchor: [f64; 3]) -> Self {
        Self { anchor, axis: [0.0, 0.0, 1.0], reference: [1.0, 0.0, 0.0] }
    }

    pub fn anchor(&self) -> Vector3 {
        Vector3::from(self.anchor)
    }

    pub fn axis(&self) -> Vector3 {
        Vector3::from(self.axis)
    }

    pub fn reference(&self) -> Vector3 {
        Vector3::from(self.reference)
    }
}

impl Default for JointFrame {
    fn default() -> Self {
        Self::at([0.0; 3])
    }
}

/// Inclusive range for a joint target, in radians (revolute) or document units (prismatic).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointLimits {
    pub min: f64,
    pub max: f64,
}

impl JointLimits {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn degrees(min: f64, max: f64) -> Self {
        Self { min: min.to_radians(), max: max.to_radians() }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.max(self.min).min(self.max)
    }
}

/// A body pose read from its six parameters.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Pose {
    origin: Vector3,
    rotation: Rotation3,
}

impl Pose {
    pub(crate) fn from_params(p: &[f64]) -> Self {
        Self {
            origin: Vector3::new(p[0], p[1], p[2]),
            rotation: rotation_from_vector(&Vector3::new(p[3], p[4], p[5])),
        }
    }

    fn frame(&self, frame: &JointFrame) -> WorldFrame {
        WorldFrame {
            anchor: self.origin + self.rotation * frame.anchor(),
            axis: self.rotation * frame.axis(),
            reference: self.rotation * frame.reference(),
        }
    }
}

struct WorldFrame {
    anchor: Vector3,
    axis: Vector3,
    reference: Vector3,
}

/// Rotation of frame b about frame a's axis, measured between the reference directions.
fn relative_angle(fa: &WorldFrame, fb: &WorldFrame) -> f64 {
    let sin = fa.axis.dot(&fa.reference.cross(&fb.reference));
    let cos = fa.reference.dot(&fb.reference);
    sin.atan2(cos)
}

/// Two rows that vanish when `b` is parallel to the unit vector `a`.
fn parallel_rows(a: &Vector3, b: &Vector3, helper: &Vector3) -> [f64; 2] {
    let (t1, t2) = orthonormal_basis(a, helper);
    [b.dot(&t1), b.dot(&t2)]
}

/// Helper axis for the basis orthogonal to frame a's world axis at body pose `a`.
pub(crate) fn axis_helper(a: &[f64], frame_a: &JointFrame) -> Vector3 {
    least_aligned_axis(&Pose::from_params(a).frame(frame_a).axis)
}

pub(crate) fn revolute_residual(
    a: &[f64],
    b: &[f64],
    frame_a: &JointFrame,
    frame_b: &JointFrame,
    target: Option<f64>,
    helper: &Vector3,
) -> Vec<f64> {
    let fa = Pose::from_params(a).frame(frame_a);
    let fb = Pose::from_params(b).frame(frame_b);
    let d = fa.anchor - fb.anchor;
    let mut r = vec![d.x, d.y, d.z];
    r.extend(parallel_rows(&fa.axis, &fb.axis, helper));
    if let Some(t) = target {
        r.push(wrap_angle(relative_angle(&fa, &fb) - t));
    }
    r
}

pub(crate) fn prismatic_residual(
    a: &[f64],
    b: &[f64],
    frame_a: &JointFrame,
    frame_b: &JointFrame,
    target: Option<f64>,
    helper: &Vector3,
) -> Vec<f64> {
    let fa = Pose::from_params(a).frame(frame_a);
    let fb = Pose::from_params(b).frame(frame_b);
    let (t1, t2) = orthonormal_basis(&fa.axis, helper);
    let d = fb.anchor - fa.anchor;
    let mut r = parallel_rows(&fa.axis, &fb.axis, helper).to_vec();
    r.push(fa.axis.dot(&fa.reference.cross(&fb.reference)));
    r.extend([d.dot(&t1), d.dot(&t2)]);
    if let Some(t) = target {
        r.push(d.dot(&fa.axis) - t);
    }
    r
}

pub(crate) fn cylindrical_residual(
    a: &[f64],
    b: &[f64],
    frame_a: &JointFrame,
    frame_b: &JointFrame,
    helper: &Vector3,
) -> Vec<f64> {
    let fa = Pose::from_params(a).frame(frame_a);
    let fb = Pose::from_params(b).frame(frame_b);
    let (t1, t2) = orthonormal_basis(&fa.axis, helper);
    let d = fb.anchor - fa.anchor;
    let mut r = parallel_rows(&fa.axis, &fb.axis, helper).to_vec();
    r.extend([d.dot(&t1), d.dot(&t2)]);
    r
}

/// Current rotation of a revolute joint in radians, given both bodies' parameters.
pub fn revolute_angle(a: &[f64], b: &[f64], frame_a: &JointFrame, frame_b: &JointFrame) -> f64 {
    let fa = Pose::from_params(a).frame(frame_a);
    let fb = Pose::from_params(b).frame(frame_b);
    relative_angle(&fa, &fb)
}

/// Current offset of a prismatic joint along frame a's axis.
pub fn prismatic_offset(a: &[f64], b: &[f64], frame_a: &JointFrame, frame_b: &JointFrame) -> f64 {
    let fa = Pose::from_params(a).frame(frame_a);
    let fb = Pose::from_params(b).frame(frame_b);
    (fb.anchor - fa.anchor).dot(&fa.axis)
}
