use crate::constraint::{CurveEvaluator, CurveId, CurveSample};
use std::sync::Once;

static TRACING: Once = Once::new();

/// Route solver logs to the test harness; `RUST_LOG=cad_solver=trace` shows LM iterations.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Kernel stand-in: curve `n` is the circle of radius `n` about the origin, `C(u) = n (cos u, sin u)`.
pub struct CircleCurves;

impl CurveEvaluator for CircleCurves {
    fn evaluate(&self, curve: CurveId, u: f64) -> Option<CurveSample> {
        if curve.0 == 0 {
            return None;
        }
        let r = curve.0 as f64;
        let (s, c) = u.sin_cos();
        Some(CurveSample { point: [r * c, r * s, 0.0], tangent: [-r * s, r * c, 0.0] })
    }
}
