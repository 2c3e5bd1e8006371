//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid stored data: {0}")]
    InvalidData(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl DbError {
    /// Whether the failure is caused by the values being written or read
    /// rather than by the database itself. Retrying the same data fails the
    /// same way.
    ///
    /// PostgreSQL reports such failures as SQLSTATE class 22 (data
    /// exception), e.g. `22021` for a NUL byte in a text column.
    pub fn is_data_error(&self) -> bool {
        match self {
            DbError::InvalidData(_) => true,
            DbError::Database(sqlx::Error::Database(db)) => {
                db.code().is_some_and(|code| code.starts_with("22"))
            }
            _ => false,
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use std::fmt;

    #[derive(Debug)]
    struct SqlState(&'static str);

    impl fmt::Display for SqlState {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "sqlstate {}", self.0)
        }
    }

    impl std::error::Error for SqlState {}

    impl sqlx::error::DatabaseError for SqlState {
        fn message(&self) -> &str {
            self.0
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed(self.0))
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::Other
        }
    }

    fn database(code: &'static str) -> DbError {
        DbError::Database(sqlx::Error::Database(Box::new(SqlState(code))))
    }

    #[test]
    fn test_nul_byte_is_a_data_error() {
        assert!(database("22021").is_data_error());
        assert!(database("22P02").is_data_error());
        assert!(DbError::InvalidData("phase".into()).is_data_error());
    }

    #[test]
    fn test_connection_failures_are_not_data_errors() {
        assert!(!database("57P01").is_data_error());
        assert!(!database("08006").is_data_error());
        assert!(!DbError::Database(sqlx::Error::PoolTimedOut).is_data_error());
    }
}
