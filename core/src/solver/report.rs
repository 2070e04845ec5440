use crate::constraint::{ConstraintId, CurveId};
use crate::solver::decompose::ClusterId;
use crate::solver::diagnostics::Diagnosis;
use crate::store::EntityId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why the numerical stage gave up on a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Iteration cap reached without meeting the convergence test.
    NoConvergence,
    /// A residual row lost its derivative (e.g. coincident points under a
    /// Distance constraint, concentric circles under Tangent).
    SingularConfiguration,
    /// A residual or parameter became NaN or infinite.
    NonFinite,
    /// The kernel could not evaluate a curve at the requested parameter.
    CurveEvaluation(CurveId),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoConvergence => write!(f, "no convergence"),
            Self::SingularConfiguration => write!(f, "singular configuration"),
            Self::NonFinite => write!(f, "non-finite value"),
            Self::CurveEvaluation(curve) => write!(f, "curve {curve} could not be evaluated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterStatus {
    /// Every residual is within tolerance and no freedom is left.
    Solved,
    /// Residuals are within tolerance but the cluster can still move.
    Underconstrained {
        remaining_dof: usize,
        /// Entities that retain freedom, in creation order.
        free_entities: Vec<EntityId>,
    },
    /// Some constraints are implied by others; the cluster was not solved.
    Overconstrained {
        /// Newest first.
        redundant: Vec<ConstraintId>,
    },
    /// The solver reached a point it cannot improve with residuals still above tolerance.
    Conflicting {
        /// Constraints left unsatisfied, in creation order.
        incompatible: Vec<ConstraintId>,
    },
    NumericalFailure(FailureReason),
    /// Not attempted because a cluster it reads from failed.
    Blocked { upstream: Vec<ClusterId> },
    /// Not attempted because the solve was cancelled.
    Cancelled,
}

impl ClusterStatus {
    /// Solved and underconstrained clusters have their parameters committed.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Solved | Self::Underconstrained { .. })
    }

    /// Overconstrained and conflicting clusters get a relax list from the diagnostics pass.
    pub fn needs_diagnosis(&self) -> bool {
        matches!(self, Self::Overconstrained { .. } | Self::Conflicting { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Solved => "solved",
            Self::Underconstrained { .. } => "underconstrained",
            Self::Overconstrained { .. } => "overconstrained",
            Self::Conflicting { .. } => "conflicting",
            Self::NumericalFailure(_) => "numerical failure",
            Self::Blocked { .. } => "blocked",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterReport {
    pub cluster: ClusterId,
    pub status: ClusterStatus,
    /// Free entities solved by this cluster.
    pub entities: Vec<EntityId>,
    pub constraints: Vec<ConstraintId>,
    /// Fixed entities and entities solved upstream that this cluster reads.
    pub inputs: Vec<EntityId>,
    /// Levenberg-Marquardt iterations; zero when the cluster was not solved numerically.
    pub iterations: usize,
    /// Largest absolute residual at termination.
    pub max_residual: f64,
}

impl ClusterReport {
    pub(crate) fn unsolved(
        cluster: ClusterId,
        status: ClusterStatus,
        entities: Vec<EntityId>,
        constraints: Vec<ConstraintId>,
        inputs: Vec<EntityId>,
    ) -> Self {
        Self { cluster, status, entities, constraints, inputs, iterations: 0, max_residual: 0.0 }
    }
}

/// Outcome of a full solve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolveReport {
    /// One report per cluster, in decomposition order.
    pub clusters: Vec<ClusterReport>,
    /// Constraints over fixed entities only that already hold.
    pub trivially_satisfied: Vec<ConstraintId>,
    /// Relax suggestions for overconstrained and conflicting clusters.
    pub diagnostics: Vec<Diagnosis>,
    /// Sum of the DOF of every free entity before solving.
    pub total_dof: usize,
    pub cancelled: bool,
}

impl SolveReport {
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.clusters.iter().all(|c| c.status.is_success())
    }

    /// True when every cluster solved with no freedom left.
    pub fn is_fully_constrained(&self) -> bool {
        !self.cancelled && self.clusters.iter().all(|c| c.status == ClusterStatus::Solved)
    }

    pub fn failed(&self) -> Vec<&ClusterReport> {
        self.clusters.iter().filter(|c| !c.status.is_success()).collect()
    }

    pub fn cluster_of(&self, entity: EntityId) -> Option<&ClusterReport> {
        self.clusters.iter().find(|c| c.entities.contains(&entity))
    }

    pub fn diagnosis(&self, cluster: ClusterId) -> Option<&Diagnosis> {
        self.diagnostics.iter().find(|d| d.cluster == cluster)
    }

    /// One-line summary for logs and status bars.
    pub fn summary(&self) -> String {
        let solved = self.clusters.iter().filter(|c| c.status.is_success()).count();
        let mut msg = format!("{solved}/{} clusters solved, {} DOF", self.clusters.len(), self.total_dof);
        let failed = self.failed();
        if !failed.is_empty() {
            let labels: Vec<String> =
                failed.iter().map(|c| format!("{} {}", c.cluster, c.status.label())).collect();
            msg.push_str(&format!("; failed: {}", labels.join(", ")));
        }
        if self.cancelled {
            msg.push_str("; cancelled");
        }
        msg
    }
}
