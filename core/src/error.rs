use crate::constraint::ConstraintId;
use crate::store::{EntityId, EntityKind};
use thiserror::Error;

/// Errors raised when the caller hands the solver inconsistent input.
///
/// Unsolvable configurations are not errors; they are reported per cluster
/// in a [`crate::solver::SolveReport`].
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("entity {0} does not exist or has been removed")]
    StaleEntity(EntityId),

    #[error("constraint {0} does not exist or has been removed")]
    StaleConstraint(ConstraintId),

    #[error("entity {0} is fixed and cannot be moved")]
    FixedEntity(EntityId),

    #[error("{kind} takes {expected} parameters, got {actual}")]
    ParamCount {
        kind: EntityKind,
        expected: usize,
        actual: usize,
    },

    #[error("non-finite parameter value for {0}")]
    NonFinite(EntityKind),

    #[error("{constraint} cannot reference entity {entity} of kind {found}")]
    IncompatibleEntity {
        constraint: &'static str,
        entity: EntityId,
        found: EntityKind,
    },

    #[error("point index {index} is not defined on entity {entity}")]
    InvalidPointRef { entity: EntityId, index: u8 },

    #[error("{constraint} mixes {left}D and {right}D geometry")]
    DimensionMismatch {
        constraint: &'static str,
        left: usize,
        right: usize,
    },

    #[error("{0} has a non-finite constant")]
    NonFiniteConstant(&'static str),

    #[error("invalid joint frame: {0}")]
    InvalidJointFrame(String),

    #[error("entity {0} is still referenced by constraints")]
    EntityInUse(EntityId),

    #[error("invalid solver configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse solver configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SolverError>;
