use thiserror::Error;

use bizhub_core::DomainError;
use bizhub_infra::UnitOfWorkError;

/// Use case failure, as reported to callers.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// Uniqueness rule or stale version token. Reload and retry.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cancelled")]
    Cancelled,

    /// The change was saved; some subscribers have not seen it yet. The outbox
    /// relay will redeliver.
    #[error("saved, but event delivery is pending: {0}")]
    DeliveryPending(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::InvariantViolation(_) => "invariant_violation",
            AppError::Conflict(_) => "conflict",
            AppError::NotFound(_) => "not_found",
            AppError::Cancelled => "cancelled",
            AppError::DeliveryPending(_) => "delivery_pending",
            AppError::Internal(_) => "internal_error",
        }
    }
}

impl From<DomainError> for AppError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => AppError::Validation(msg),
            DomainError::InvariantViolation(msg) => AppError::InvariantViolation(msg),
            DomainError::Conflict(msg) => AppError::Conflict(msg),
            DomainError::NotFound(msg) => AppError::NotFound(msg),
        }
    }
}

impl From<UnitOfWorkError> for AppError {
    fn from(value: UnitOfWorkError) -> Self {
        match value {
            UnitOfWorkError::Conflict(msg) => AppError::Conflict(msg),
            UnitOfWorkError::NotFound(msg) => AppError::NotFound(msg),
            UnitOfWorkError::Domain(err) => err.into(),
            UnitOfWorkError::Cancelled => AppError::Cancelled,
            err @ UnitOfWorkError::DispatchFailure { .. } => AppError::DeliveryPending(err.to_string()),
            err @ (UnitOfWorkError::Store(_) | UnitOfWorkError::TransactionAborted) => {
                AppError::Internal(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bizhub_infra::store::StoreError;

    #[test]
    fn unit_of_work_errors_map_to_codes() {
        assert_eq!(AppError::from(UnitOfWorkError::Conflict("x".into())).code(), "conflict");
        assert_eq!(AppError::from(UnitOfWorkError::Cancelled).code(), "cancelled");
        assert_eq!(
            AppError::from(UnitOfWorkError::Store(StoreError::Backend("down".into()))).code(),
            "internal_error"
        );
        assert_eq!(
            AppError::from(UnitOfWorkError::Domain(DomainError::validation("bad"))).code(),
            "validation_error"
        );
    }
}
