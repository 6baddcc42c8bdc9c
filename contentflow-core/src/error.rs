//! Error taxonomy for the orchestration engine

use crate::models::workflow::{StepFailure, StepKind};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Errors returned to callers of the orchestrator
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Capacity exceeded, estimated wait {estimated_wait_ms}ms")]
    CapacityExceeded { estimated_wait_ms: u64 },

    #[error("Request is not authenticated")]
    Unauthenticated,

    #[error("Session {0} not found")]
    NotFound(Uuid),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Session storage failure")]
    Storage(#[from] anyhow::Error),
}

impl WorkflowError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::InvalidInput(_) => "invalid_input",
            WorkflowError::CapacityExceeded { .. } => "capacity_exceeded",
            WorkflowError::Unauthenticated => "unauthenticated",
            WorkflowError::NotFound(_) => "not_found",
            WorkflowError::InvalidState(_) => "invalid_state",
            WorkflowError::Storage(_) => "storage_error",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            WorkflowError::InvalidInput(_) => 400,
            WorkflowError::CapacityExceeded { .. } => 429,
            WorkflowError::Unauthenticated => 401,
            WorkflowError::NotFound(_) => 404,
            WorkflowError::InvalidState(_) => 409,
            WorkflowError::Storage(_) => 500,
        }
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkflowError::CapacityExceeded { .. } | WorkflowError::Storage(_)
        )
    }

    pub fn estimated_wait_ms(&self) -> Option<u64> {
        match self {
            WorkflowError::CapacityExceeded { estimated_wait_ms } => Some(*estimated_wait_ms),
            _ => None,
        }
    }
}

pub type WorkflowResult<T> = std::result::Result<T, WorkflowError>;

/// Failure reported by an external capability
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("Capability call timed out")]
    Timeout,

    #[error("Capability rate limited: {0}")]
    RateLimited(String),

    #[error("Capability service error: {0}")]
    ServiceError(String),

    #[error("Capability rejected payload: {0}")]
    InvalidPayload(String),
}

impl CapabilityError {
    /// Invalid payloads fail the same way on every attempt
    pub fn is_transient(&self) -> bool {
        !matches!(self, CapabilityError::InvalidPayload(_))
    }

    pub fn kind(&self) -> StepErrorKind {
        match self {
            CapabilityError::Timeout => StepErrorKind::Timeout,
            CapabilityError::RateLimited(_) => StepErrorKind::RateLimited,
            CapabilityError::ServiceError(_) => StepErrorKind::ServiceError,
            CapabilityError::InvalidPayload(_) => StepErrorKind::InvalidPayload,
        }
    }
}

/// Category of a step execution failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepErrorKind {
    CircuitOpen,
    Timeout,
    RateLimited,
    ServiceError,
    InvalidPayload,
    Cancelled,
}

impl StepErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            StepErrorKind::CircuitOpen => "circuit_open",
            StepErrorKind::Timeout => "timeout",
            StepErrorKind::RateLimited => "rate_limited",
            StepErrorKind::ServiceError => "service_error",
            StepErrorKind::InvalidPayload => "invalid_payload",
            StepErrorKind::Cancelled => "cancelled",
        }
    }

    fn user_message(&self) -> &'static str {
        match self {
            StepErrorKind::CircuitOpen => "The service for this step is temporarily unavailable",
            StepErrorKind::Timeout => "The service for this step did not respond in time",
            StepErrorKind::RateLimited => "The service for this step is receiving too many requests",
            StepErrorKind::ServiceError => "The service for this step reported an error",
            StepErrorKind::InvalidPayload => "The service for this step could not process the request",
            StepErrorKind::Cancelled => "The step was cancelled",
        }
    }
}

impl fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Outcome of a step execution that produced no result
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{step} failed after {attempts} attempt(s) ({kind}): {detail}")]
pub struct StepError {
    pub step: StepKind,
    pub kind: StepErrorKind,
    pub attempts: u32,
    /// Whether running the step again later could succeed
    pub retryable: bool,
    /// Internal detail for logs; never shown to end users
    pub detail: String,
}

impl StepError {
    pub fn circuit_open(step: StepKind, attempts: u32) -> Self {
        Self {
            step,
            kind: StepErrorKind::CircuitOpen,
            attempts,
            retryable: true,
            detail: format!("circuit open for {}", step),
        }
    }

    pub fn cancelled(step: StepKind, attempts: u32) -> Self {
        Self {
            step,
            kind: StepErrorKind::Cancelled,
            attempts,
            retryable: false,
            detail: "session cancelled".to_string(),
        }
    }

    /// User-safe record stored on the step
    pub fn to_failure(&self) -> StepFailure {
        StepFailure {
            code: self.kind.code().to_string(),
            message: self.kind.user_message().to_string(),
            retryable: self.retryable,
            attempts: self.attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_error_codes() {
        let err = WorkflowError::CapacityExceeded {
            estimated_wait_ms: 1500,
        };
        assert_eq!(err.code(), "capacity_exceeded");
        assert_eq!(err.http_status(), 429);
        assert_eq!(err.estimated_wait_ms(), Some(1500));
        assert!(err.is_retryable());

        let err = WorkflowError::InvalidState("terminal".to_string());
        assert_eq!(err.http_status(), 409);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_step_failure_hides_detail() {
        let err = StepError {
            step: StepKind::ContentGeneration,
            kind: StepErrorKind::ServiceError,
            attempts: 3,
            retryable: false,
            detail: "upstream 502 at 10.0.0.7".to_string(),
        };
        let failure = err.to_failure();

        assert_eq!(failure.code, "service_error");
        assert_eq!(failure.attempts, 3);
        assert!(!failure.message.contains("10.0.0.7"));
    }

    #[test]
    fn test_invalid_payload_is_permanent() {
        assert!(CapabilityError::Timeout.is_transient());
        assert!(!CapabilityError::InvalidPayload("bad".to_string()).is_transient());
    }
}
