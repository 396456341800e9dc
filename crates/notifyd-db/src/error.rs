//! `StoreError` lets callers (`notifyd-pipeline`) decide retryability per the
//! §7 error taxonomy without inspecting `sqlx::Error` themselves.

use std::fmt;

#[derive(Debug)]
pub enum StoreError {
    /// Connection drop, timeout, deadlock-detected — safe to retry with backoff.
    Transient(anyhow::Error),
    /// Check/unique/foreign-key violation — retrying without fixing the input
    /// would fail identically, so the caller should not retry blindly.
    Constraint(anyhow::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Transient(e) => write!(f, "transient store error: {e}"),
            StoreError::Constraint(e) => write!(f, "constraint store error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                StoreError::Constraint(anyhow::anyhow!(err))
            }
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                StoreError::Constraint(anyhow::anyhow!(err))
            }
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                StoreError::Constraint(anyhow::anyhow!(err))
            }
            _ => StoreError::Transient(anyhow::anyhow!(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retryable_constraint_is_not() {
        let transient = StoreError::Transient(anyhow::anyhow!("connection reset"));
        let constraint = StoreError::Constraint(anyhow::anyhow!("unique violation"));
        assert!(transient.is_retryable());
        assert!(!constraint.is_retryable());
    }
}
