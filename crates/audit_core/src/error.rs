use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("stale rollback: {0}")]
    StaleRollback(String),

    #[error("validation failed: {} reason(s)", .0.len())]
    ValidationFailed(Vec<String>),

    #[error("critical impact: {0}")]
    CriticalImpact(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("transaction failed: {0}")]
    Transaction(String),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AuditError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::StaleRollback(_) => 409,
            Self::ValidationFailed(_) => 422,
            Self::CriticalImpact(_) => 422,
            Self::InvalidInput(_) => 400,
            Self::Unavailable(_) => 503,
            Self::Transaction(_) => 500,
            Self::Internal(_) => 500,
        }
    }

    /// Flatten the error into the reason strings carried back to callers.
    /// Rollback failures are always reported as structured results, so the
    /// individual reasons matter more than the variant.
    pub fn reasons(&self) -> Vec<String> {
        match self {
            Self::ValidationFailed(reasons) => reasons.clone(),
            other => vec![other.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_not_found() {
        assert_eq!(AuditError::NotFound("x".into()).http_status(), 404);
    }

    #[test]
    fn http_status_stale_rollback() {
        assert_eq!(AuditError::StaleRollback("x".into()).http_status(), 409);
    }

    #[test]
    fn http_status_validation_failed() {
        assert_eq!(AuditError::ValidationFailed(vec![]).http_status(), 422);
    }

    #[test]
    fn http_status_unavailable() {
        assert_eq!(AuditError::Unavailable("x".into()).http_status(), 503);
    }

    #[test]
    fn display_validation_failed_counts_reasons() {
        let e = AuditError::ValidationFailed(vec!["a".into(), "b".into()]);
        assert_eq!(e.to_string(), "validation failed: 2 reason(s)");
    }

    #[test]
    fn reasons_unpacks_validation_failures() {
        let e = AuditError::ValidationFailed(vec!["a".into(), "b".into()]);
        assert_eq!(e.reasons(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn reasons_wraps_other_variants() {
        let e = AuditError::StaleRollback("later change exists".into());
        assert_eq!(e.reasons(), vec!["stale rollback: later change exists"]);
    }

    #[test]
    fn display_internal() {
        let e = AuditError::Internal(anyhow::anyhow!("boom"));
        assert_eq!(e.to_string(), "internal: boom");
    }
}
