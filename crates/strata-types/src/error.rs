use thiserror::Error;

/// Errors from repository operations (used by trait definitions in strata-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    /// A uniqueness rule or compare-and-set check rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");

        let err = RepositoryError::Conflict("revision 3 != 4".to_string());
        assert!(err.to_string().starts_with("conflict"));
    }
}
