use crate::error::{Result, SolverError};
use serde::{Deserialize, Serialize};

/// What to do when a joint's target value lies outside its declared limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JointLimitPolicy {
    /// Report the joint as conflicting and leave the cluster untouched.
    #[default]
    Reject,
    /// Clamp the target into the limits and solve.
    Clamp,
}

/// Tolerances and limits for one solver instance.
///
/// Tolerances are in document units (lengths) and radians (angles).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Levenberg-Marquardt iteration cap for a full solve.
    pub max_iterations: usize,
    /// Iteration cap for an interactive drag, kept small so a frame has bounded cost.
    pub drag_max_iterations: usize,
    /// Converged when every residual is below this...
    pub residual_tolerance: f64,
    /// ...and the last step moved no parameter by more than this.
    pub step_tolerance: f64,
    /// A residual is stationary when `|J^T F| <= gradient_tolerance * |F|`.
    pub gradient_tolerance: f64,
    pub lambda_initial: f64,
    pub lambda_min: f64,
    pub lambda_max: f64,
    /// Damping grows by this factor on a rejected step and shrinks by it on an accepted one.
    pub lambda_factor: f64,
    /// Jacobian rows with a smaller max-norm are treated as zero pivots.
    pub pivot_tolerance: f64,
    /// Relative tolerance for the incremental rank test of the DOF analyzer.
    pub rank_tolerance: f64,
    /// Relative step for finite-difference Jacobians.
    pub finite_difference_step: f64,
    /// Solve independent components on the rayon thread pool.
    pub parallel: bool,
    /// Below this many components the solve stays on the calling thread.
    pub parallel_min_components: usize,
    /// Largest seed set grown while searching for rigid subsets.
    pub max_seed_entities: usize,
    pub joint_limit_policy: JointLimitPolicy,
    /// Attach a relax list to every over-constrained or conflicting cluster.
    pub diagnose_failures: bool,
    pub max_diagnostic_steps: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            drag_max_iterations: 25,
            residual_tolerance: 1e-9,
            step_tolerance: 1e-9,
            gradient_tolerance: 1e-10,
            lambda_initial: 1e-3,
            lambda_min: 1e-12,
            lambda_max: 1e12,
            lambda_factor: 10.0,
            pivot_tolerance: 1e-12,
            rank_tolerance: 1e-8,
            finite_difference_step: 1e-7,
            parallel: true,
            parallel_min_components: 2,
            max_seed_entities: 32,
            joint_limit_policy: JointLimitPolicy::Reject,
            diagnose_failures: true,
            max_diagnostic_steps: 16,
        }
    }
}

impl SolverConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        fn positive(name: &str, value: f64) -> Result<()> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(SolverError::InvalidConfig(format!("{name} must be positive, got {value}")))
            }
        }

        if self.max_iterations == 0 || self.drag_max_iterations == 0 {
            return Err(SolverError::InvalidConfig("iteration caps must be at least 1".to_string()));
        }
        positive("residual_tolerance", self.residual_tolerance)?;
        positive("step_tolerance", self.step_tolerance)?;
        positive("gradient_tolerance", self.gradient_tolerance)?;
        positive("lambda_min", self.lambda_min)?;
        positive("pivot_tolerance", self.pivot_tolerance)?;
        positive("rank_tolerance", self.rank_tolerance)?;
        positive("finite_difference_step", self.finite_difference_step)?;
        if !(self.lambda_min <= self.lambda_initial && self.lambda_initial <= self.lambda_max) {
            return Err(SolverError::InvalidConfig(format!(
                "lambda bounds must satisfy min <= initial <= max, got {} / {} / {}",
                self.lambda_min, self.lambda_initial, self.lambda_max
            )));
        }
        if !(self.lambda_factor > 1.0) {
            return Err(SolverError::InvalidConfig(format!(
                "lambda_factor must exceed 1, got {}",
                self.lambda_factor
            )));
        }
        if self.max_seed_entities == 0 {
            return Err(SolverError::InvalidConfig("max_seed_entities must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_drag_max_iterations(mut self, max_iterations: usize) -> Self {
        self.drag_max_iterations = max_iterations;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_joint_limit_policy(mut self, policy: JointLimitPolicy) -> Self {
        self.joint_limit_policy = policy;
        self
    }

    pub fn with_diagnostics(mut self, enabled: bool) -> Self {
        self.diagnose_failures = enabled;
        self
    }
}
