//! Read-only evaluation service for curves owned by the geometry kernel.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CurveId(pub u64);

impl fmt::Display for CurveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "curve{}", self.0)
    }
}

/// Point and first derivative of a curve at one parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurveSample {
    pub point: [f64; 3],
    /// dC/du, not normalized.
    pub tangent: [f64; 3],
}

/// Oracle the solver calls from residual functions. It must not mutate kernel
/// state; it may be called from several worker threads at once.
pub trait CurveEvaluator: Send + Sync {
    /// `None` when the curve is unknown or `u` is outside its domain.
    fn evaluate(&self, curve: CurveId, u: f64) -> Option<CurveSample>;
}

/// Evaluator for sketches without kernel curves.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCurves;

impl CurveEvaluator for NoCurves {
    fn evaluate(&self, _curve: CurveId, _u: f64) -> Option<CurveSample> {
        None
    }
}
