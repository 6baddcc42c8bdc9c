//! Bash command capability adapter

use crate::capability::Capability;
use crate::error::CapabilityError;
use crate::models::workflow::{StepOutput, StepPayload};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// Exit code a command uses to report rate limiting (EX_TEMPFAIL)
const EXIT_RATE_LIMITED: i32 = 75;

/// Runs a bash command per invocation
///
/// The JSON payload is written to stdin and a JSON `StepOutput` is read from
/// stdout. The process is killed if the caller stops waiting for it.
pub struct CommandCapability {
    command: String,
}

impl CommandCapability {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Map a non-zero exit code to a capability error
    ///
    /// Exit codes 1-10 and SIGTERM are transient; anything else means the
    /// command rejected its input.
    fn classify_exit(exit_code: Option<i32>, stderr: &str) -> CapabilityError {
        let detail = format!("exit code {:?}: {}", exit_code, stderr.trim());
        match exit_code {
            Some(EXIT_RATE_LIMITED) => CapabilityError::RateLimited(detail),
            Some(code) if (1..=10).contains(&code) => CapabilityError::ServiceError(detail),
            Some(143) | None => CapabilityError::ServiceError(detail),
            _ => CapabilityError::InvalidPayload(detail),
        }
    }
}

#[async_trait]
impl Capability for CommandCapability {
    async fn invoke(&self, payload: &StepPayload) -> Result<StepOutput, CapabilityError> {
        let input = serde_json::to_vec(payload)
            .map_err(|e| CapabilityError::InvalidPayload(e.to_string()))?;

        let mut child = Command::new("bash")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CapabilityError::ServiceError(format!("spawn failed: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CapabilityError::ServiceError("stdin unavailable".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| CapabilityError::ServiceError("stdout unavailable".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| CapabilityError::ServiceError("stderr unavailable".to_string()))?;

        let writer = async move {
            // The command may exit without reading its input
            let _ = stdin.write_all(&input).await;
            let _ = stdin.shutdown().await;
        };
        let mut out = Vec::new();
        let mut err = String::new();
        let (_, out_result, err_result) = tokio::join!(
            writer,
            stdout.read_to_end(&mut out),
            stderr.read_to_string(&mut err)
        );
        out_result.map_err(|e| CapabilityError::ServiceError(e.to_string()))?;
        err_result.map_err(|e| CapabilityError::ServiceError(e.to_string()))?;

        let status = child
            .wait()
            .await
            .map_err(|e| CapabilityError::ServiceError(e.to_string()))?;

        for line in err.lines() {
            tracing::debug!(step = %payload.step, "stderr: {}", line);
        }

        if !status.success() {
            return Err(Self::classify_exit(status.code(), &err));
        }

        serde_json::from_slice(&out).map_err(|e| {
            CapabilityError::ServiceError(format!("command produced malformed output: {}", e))
        })
    }
}
