//! Workflow session data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Overall status of a workflow session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, waiting for an admission slot
    Pending,
    /// Admitted and advancing steps
    Running,
    /// Every step completed or fell back
    Completed,
    /// A step without fallback failed
    Failed,
    /// Cancelled by the user
    Cancelled,
}

impl SessionStatus {
    /// Terminal sessions accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

/// The four fixed pipeline stages, in execution order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    ContentGeneration,
    VisualGeneration,
    Optimization,
    Packaging,
}

impl StepKind {
    /// Pipeline order
    pub const ALL: [StepKind; 4] = [
        StepKind::ContentGeneration,
        StepKind::VisualGeneration,
        StepKind::Optimization,
        StepKind::Packaging,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::ContentGeneration => "content-generation",
            StepKind::VisualGeneration => "visual-generation",
            StepKind::Optimization => "optimization",
            StepKind::Packaging => "packaging",
        }
    }

    /// What happens once this step has exhausted its retries
    pub fn fallback(&self) -> FallbackPolicy {
        match self {
            StepKind::ContentGeneration | StepKind::Packaging => FallbackPolicy::FailSession,
            StepKind::VisualGeneration => FallbackPolicy::TextOnly,
            StepKind::Optimization => FallbackPolicy::SubstituteOriginal,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("Unknown step '{}'", s))
    }
}

/// Degraded outcome applied when a step cannot produce a result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// No substitute exists; the session fails
    FailSession,
    /// Continue without a visual
    TextOnly,
    /// Pass the unoptimized media through
    SubstituteOriginal,
}

/// Per-step status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    FallenBack,
}

impl StepStatus {
    /// Completed or FallenBack: later steps may start
    pub fn is_settled(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::FallenBack)
    }
}

/// Generated text
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub body: String,
}

/// Reference to a generated image
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageRef {
    pub uri: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Result of media optimization
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizedMedia {
    /// Media the optimizer started from, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
    /// Media to ship; equals `source_uri` when nothing was optimized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimized_bytes: Option<u64>,
    /// False when the original media was substituted
    pub optimized: bool,
}

impl OptimizedMedia {
    /// Pass-through descriptor used when optimization falls back
    pub fn unoptimized(source: Option<&ImageRef>) -> Self {
        let uri = source.map(|image| image.uri.clone());
        Self {
            source_uri: uri.clone(),
            uri,
            original_bytes: None,
            optimized_bytes: None,
            optimized: false,
        }
    }
}

/// Distribution package descriptor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageDescriptor {
    pub package_uri: String,
    pub format: String,
    /// Whether a visual made it into the package
    pub includes_visual: bool,
}

/// Typed result of a step, tagged by the step that produced it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "step", content = "data", rename_all = "kebab-case")]
pub enum StepOutput {
    ContentGeneration(TextContent),
    VisualGeneration(ImageRef),
    Optimization(OptimizedMedia),
    Packaging(PackageDescriptor),
}

impl StepOutput {
    pub fn kind(&self) -> StepKind {
        match self {
            StepOutput::ContentGeneration(_) => StepKind::ContentGeneration,
            StepOutput::VisualGeneration(_) => StepKind::VisualGeneration,
            StepOutput::Optimization(_) => StepKind::Optimization,
            StepOutput::Packaging(_) => StepKind::Packaging,
        }
    }
}

/// User-safe failure record: stable code, no dependency internals
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepFailure {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub attempts: u32,
}

/// One stage of a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    pub kind: StepKind,
    pub status: StepStatus,
    /// Attempts made by the most recent execution
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StepOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StepFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowStep {
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind,
            status: StepStatus::Pending,
            attempts: 0,
            result: None,
            warning: None,
            last_error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Back to a fresh Pending step
    pub fn reset(&mut self) {
        *self = WorkflowStep::new(self.kind);
    }
}

/// Runtime record of one pipeline run for one user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSession {
    pub id: Uuid,
    pub user_id: String,
    pub prompt: String,
    pub status: SessionStatus,
    pub steps: Vec<WorkflowStep>,
    /// Number of leading steps that have settled at least once; never decreases
    pub current_step_index: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
}

impl WorkflowSession {
    /// New Pending session with the four fixed steps
    pub fn new(user_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            prompt: prompt.into(),
            status: SessionStatus::Pending,
            steps: StepKind::ALL.into_iter().map(WorkflowStep::new).collect(),
            current_step_index: 0,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn step(&self, kind: StepKind) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.kind == kind)
    }

    pub fn step_index(&self, kind: StepKind) -> Option<usize> {
        self.steps.iter().position(|step| step.kind == kind)
    }

    /// Step currently being executed, if any
    pub fn in_flight_step(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|step| step.status == StepStatus::InProgress)
    }

    /// Index of the next step allowed to run
    ///
    /// Only returns a Pending step whose predecessors have all settled.
    pub fn next_runnable_step(&self) -> Option<usize> {
        let index = self
            .steps
            .iter()
            .position(|step| step.status == StepStatus::Pending)?;
        self.steps[..index]
            .iter()
            .all(|step| step.status.is_settled())
            .then_some(index)
    }

    /// Results of the settled steps before `index`
    pub fn upstream_outputs(&self, index: usize) -> Vec<StepOutput> {
        self.steps[..index]
            .iter()
            .filter_map(|step| step.result.clone())
            .collect()
    }

    pub fn settled_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| step.status.is_settled())
            .count()
    }

    /// `100 × settled / total`
    pub fn progress_percent(&self) -> u8 {
        if self.steps.is_empty() {
            return 0;
        }
        ((100 * self.settled_steps()) / self.steps.len()) as u8
    }

    /// Move the cursor past any newly settled leading steps
    pub fn sync_cursor(&mut self) {
        let leading = self
            .steps
            .iter()
            .take_while(|step| step.status.is_settled())
            .count();
        self.current_step_index = self.current_step_index.max(leading);
    }

    pub fn all_settled(&self) -> bool {
        self.steps.iter().all(|step| step.status.is_settled())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Read-only projection returned to callers
    pub fn status_view(&self) -> WorkflowStatus {
        let current_step = self
            .steps
            .iter()
            .find(|step| !step.status.is_settled())
            .map(|step| step.kind);

        WorkflowStatus {
            session_id: self.id,
            user_id: self.user_id.clone(),
            status: self.status,
            current_step,
            current_step_index: self.current_step_index,
            progress_percent: self.progress_percent(),
            is_complete: self.status == SessionStatus::Completed,
            error: self.error.clone(),
            steps: self
                .steps
                .iter()
                .map(|step| StepSummary {
                    name: step.kind,
                    status: step.status,
                    attempts: step.attempts,
                    warning: step.warning.clone(),
                    result: step.result.clone(),
                })
                .collect(),
            updated_at: self.updated_at,
        }
    }
}

/// Status view of a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStatus {
    pub session_id: Uuid,
    pub user_id: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<StepKind>,
    pub current_step_index: usize,
    pub progress_percent: u8,
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
    pub steps: Vec<StepSummary>,
    pub updated_at: DateTime<Utc>,
}

/// Per-step line of a status view
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSummary {
    pub name: StepKind,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StepOutput>,
}

/// Input handed to a capability for one step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepPayload {
    pub session_id: Uuid,
    pub step: StepKind,
    pub prompt: String,
    /// Results of the earlier steps, in pipeline order
    pub upstream: Vec<StepOutput>,
}

impl StepPayload {
    pub fn content(&self) -> Option<&TextContent> {
        self.upstream.iter().find_map(|output| match output {
            StepOutput::ContentGeneration(text) => Some(text),
            _ => None,
        })
    }

    pub fn visual(&self) -> Option<&ImageRef> {
        self.upstream.iter().find_map(|output| match output {
            StepOutput::VisualGeneration(image) => Some(image),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_status_serialization() {
        let json = serde_json::to_string(&SessionStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(!SessionStatus::Pending.is_terminal());
    }

    #[test]
    fn test_new_session_has_four_pending_steps() {
        let session = WorkflowSession::new("user-1", "write about rust");

        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.steps.len(), 4);
        assert!(session
            .steps
            .iter()
            .all(|step| step.status == StepStatus::Pending));
        assert_eq!(session.next_runnable_step(), Some(0));
        assert_eq!(session.progress_percent(), 0);
    }

    #[test]
    fn test_step_kind_parsing() {
        assert_eq!(
            "visual-generation".parse::<StepKind>().unwrap(),
            StepKind::VisualGeneration
        );
        assert!("thumbnail".parse::<StepKind>().is_err());
        assert_eq!(StepKind::Packaging.fallback(), FallbackPolicy::FailSession);
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let mut session = WorkflowSession::new("user-1", "prompt");
        session.steps[0].status = StepStatus::Completed;
        session.steps[1].status = StepStatus::FallenBack;
        session.sync_cursor();
        assert_eq!(session.current_step_index, 2);
        assert_eq!(session.progress_percent(), 50);

        session.steps[0].reset();
        session.sync_cursor();
        assert_eq!(session.current_step_index, 2);
        assert_eq!(session.next_runnable_step(), Some(0));
    }

    #[test]
    fn test_next_step_requires_settled_predecessors() {
        let mut session = WorkflowSession::new("user-1", "prompt");
        session.steps[0].status = StepStatus::Failed;
        assert_eq!(session.next_runnable_step(), None);
    }

    #[test]
    fn test_step_output_is_tagged_by_step() {
        let output = StepOutput::ContentGeneration(TextContent {
            title: None,
            body: "hello".to_string(),
        });
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["step"], "content-generation");
        assert_eq!(json["data"]["body"], "hello");
        assert_eq!(output.kind(), StepKind::ContentGeneration);
    }
}
