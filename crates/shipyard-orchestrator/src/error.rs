//! Orchestrator error types.

use shipyard_bus::BusError;
use shipyard_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("store error: {0}")]
    Store(DbError),

    /// The store refused the values of this one message.
    #[error("store rejected data: {0}")]
    StoreRejected(DbError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

impl From<DbError> for OrchestratorError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => OrchestratorError::NotFound(what),
            other if other.is_data_error() => OrchestratorError::StoreRejected(other),
            other => OrchestratorError::Store(other),
        }
    }
}

impl From<shipyard_core::Error> for OrchestratorError {
    fn from(err: shipyard_core::Error) -> Self {
        match err {
            shipyard_core::Error::NotFound(what) => OrchestratorError::NotFound(what),
            shipyard_core::Error::InvalidInput(msg) => OrchestratorError::InvalidInput(msg),
            other => OrchestratorError::InvalidInput(other.to_string()),
        }
    }
}

impl OrchestratorError {
    /// Whether the failure lies in shared infrastructure rather than in the
    /// message being processed.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, OrchestratorError::Store(_) | OrchestratorError::Bus(_))
    }
}

pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_failures_are_infrastructure() {
        let err = OrchestratorError::from(DbError::Database(sqlx::Error::PoolTimedOut));
        assert!(err.is_infrastructure());
    }

    #[test]
    fn test_bad_stored_data_is_not_infrastructure() {
        let err = OrchestratorError::from(DbError::InvalidData("unknown phase: paused".into()));
        assert!(matches!(err, OrchestratorError::StoreRejected(_)));
        assert!(!err.is_infrastructure());
    }

    #[test]
    fn test_missing_record_is_not_found() {
        let err = OrchestratorError::from(DbError::NotFound("build".into()));
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }
}
