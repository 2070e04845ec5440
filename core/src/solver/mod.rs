//! Solving pipeline: constraint graph, cluster decomposition, DOF analysis,
//! Levenberg-Marquardt per cluster, interactive drags and diagnostics.

pub mod decompose;
pub mod diagnostics;
pub mod dof;
pub mod engine;
pub mod graph;
pub mod incremental;
pub mod lm;
pub mod report;
pub mod system;

#[cfg(test)]
mod tests_dof;

pub use decompose::{Cluster, ClusterId, Component, Decomposer, Decomposition, Substitution};
pub use diagnostics::Diagnosis;
pub use dof::DofAnalysis;
pub use engine::{CancelToken, Solver};
pub use incremental::{DragAttempt, DragReport, IncrementalSolver};
pub use lm::{LeastSquares, LmOutcome, LmResult, LmSettings};
pub use report::{ClusterReport, ClusterStatus, FailureReason, SolveReport};
pub use system::{ClusterSystem, ParamSource};
