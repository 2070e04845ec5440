pub mod config;
pub mod constraint;
pub mod error;
pub mod geometry;
pub mod sketch;
pub mod solver;
pub mod store;
pub mod units;

#[cfg(test)]
mod test_support;

pub use config::{JointLimitPolicy, SolverConfig};
pub use constraint::{Constraint, ConstraintId, ConstraintKind, ConstraintSet, PointRef};
pub use error::{Result, SolverError};
pub use sketch::Sketch;
pub use solver::{IncrementalSolver, SolveReport, Solver};
pub use store::{Entity, EntityId, EntityKind, EntityStore, Geometry, WriteBatch};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
