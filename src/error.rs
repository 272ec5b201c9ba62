use thiserror::Error;
use tonic::{Code, Status};
use tonic_types::{ErrorDetails, StatusExt};

use crate::validation::StructViolation;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("{0}")]
    Validation(StructViolation),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: u32 },

    #[error("Circuit breaker open for: {0}")]
    CircuitOpen(String),

    #[error("Max concurrency reached for: {0}")]
    MaxConcurrency(String),

    #[error("Timeout reached: {0}")]
    Timeout(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Task {0} is not successful")]
    TaskNotSuccessful(String),

    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

impl ServiceError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::Database(_)
                | ServiceError::Pool(_)
                | ServiceError::Broker(_)
                | ServiceError::Timeout(_)
        )
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceError::Database(_) => "DATABASE_ERROR",
            ServiceError::Pool(_) => "POOL_ERROR",
            ServiceError::Validation(_) => "VALIDATION_ERROR",
            ServiceError::NotFound { .. } => "NOT_FOUND",
            ServiceError::CircuitOpen(_) => "CIRCUIT_OPEN",
            ServiceError::MaxConcurrency(_) => "MAX_CONCURRENCY",
            ServiceError::Timeout(_) => "TIMEOUT",
            ServiceError::Broker(_) => "BROKER_ERROR",
            ServiceError::TaskNotSuccessful(_) => "TASK_NOT_SUCCESSFUL",
            ServiceError::TaskFailed(_) => "TASK_FAILED",
            ServiceError::Configuration(_) => "CONFIG_ERROR",
            ServiceError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn grpc_code(&self) -> Code {
        match self {
            ServiceError::Validation(_) => Code::InvalidArgument,
            ServiceError::NotFound { .. } => Code::NotFound,
            ServiceError::CircuitOpen(_) | ServiceError::MaxConcurrency(_) => Code::Unavailable,
            ServiceError::Timeout(_) => Code::DeadlineExceeded,
            ServiceError::Internal(_) => Code::Unknown,
            _ => Code::Internal,
        }
    }
}

impl From<ServiceError> for Status {
    fn from(error: ServiceError) -> Self {
        let code = error.grpc_code();
        match error {
            ServiceError::Validation(violation) => {
                let mut details = ErrorDetails::new();
                for field in &violation.violations {
                    details.add_bad_request_violation(field.field.clone(), field.description.clone());
                }
                Status::with_error_details(code, violation.description, details)
            }
            other => Status::new(code, other.to_string()),
        }
    }
}
