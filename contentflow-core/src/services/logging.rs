//! Logging service

use crate::error::{CapabilityError, WorkflowError};
use crate::models::workflow::StepKind;
use crate::models::LogLevel;
use chrono::Utc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Initialize logging with the specified level
///
/// `RUST_LOG` takes precedence when set.
pub fn init_logging(level: LogLevel) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let level = match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("contentflow_core={level},contentflow={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
}

/// Log a failed capability call
pub fn log_dependency_error(session_id: Uuid, step: StepKind, attempt: u32, error: &CapabilityError) {
    tracing::error!(
        session_id = %session_id,
        step = %step,
        attempt = attempt,
        at = %Utc::now().to_rfc3339(),
        error = %error,
        "Capability call failed"
    );
}

/// Log a rejected state transition or lookup
///
/// Input errors are caller mistakes and are only traced at debug level.
pub fn log_state_error(session_id: Uuid, step: Option<StepKind>, error: &WorkflowError) {
    let step = step.map(|s| s.as_str()).unwrap_or("");
    match error {
        WorkflowError::InvalidInput(_) => {
            tracing::debug!(session_id = %session_id, step = step, error = %error, "Input rejected");
        }
        _ => {
            tracing::error!(
                session_id = %session_id,
                step = step,
                at = %Utc::now().to_rfc3339(),
                code = error.code(),
                error = %error,
                "Workflow request rejected"
            );
        }
    }
}
