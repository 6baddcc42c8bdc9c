//! Admission data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Admission lane
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Work a user is actively waiting on
    UserInteractive,
    /// Maintenance and batch work
    Background,
}

/// Receipt for a request to run work under the concurrency budget
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdmissionTicket {
    pub ticket_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
    pub priority: Priority,
    /// Advisory; 0 when granted at enqueue time
    pub estimated_wait_ms: u64,
    /// Whether the slot was granted immediately
    pub granted: bool,
}

/// Snapshot of the controller's counters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdmissionStats {
    pub budget: usize,
    pub active: usize,
    pub queued_interactive: usize,
    pub queued_background: usize,
    pub average_step_ms: u64,
}
