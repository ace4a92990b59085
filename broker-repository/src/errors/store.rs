use thiserror::Error;

/// SQLSTATE codes reported when a concurrent unit of work touched the same rows.
const CONFLICT_CODES: [&str; 4] = [
    "23505", // unique_violation
    "23503", // foreign_key_violation
    "40001", // serialization_failure
    "40P01", // deadlock_detected
];

/// Represents errors that can occur within the relationship store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(sqlx::Error),

    /// A row changed since it was read, or a unique key was taken concurrently.
    /// The changeset was not applied.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The changeset would break a store-level integrity rule.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db_err) = err.as_database_error() {
            if let Some(code) = db_err.code() {
                if CONFLICT_CODES.contains(&code.as_ref()) {
                    return StoreError::Conflict(db_err.message().to_string());
                }
            }
        }
        StoreError::DatabaseError(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_database_errors_are_not_conflicts() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StoreError::DatabaseError(_)));
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            StoreError::conflict("group 1 changed").to_string(),
            "Conflict: group 1 changed"
        );
        assert_eq!(
            StoreError::validation("empty").to_string(),
            "Validation error: empty"
        );
    }
}
