//! Task state machine and requester-facing views.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskFailure;
use crate::protocol::CapabilityType;

/// State of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in its capability queue.
    Pending,
    /// Handed to a worker, no status heard yet.
    Assigned,
    /// Worker has reported at least one status update.
    Running,
    /// Terminal: worker reported success.
    Completed,
    /// Terminal: scrape error, worker lost, timeout, or cancellation.
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One unit of scrape work. Owned by the dispatcher; everything the
/// requester may see goes through [`TaskView`].
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: Uuid,
    pub capability: CapabilityType,
    /// Opaque job description. The orchestrator never looks inside.
    pub payload: serde_json::Value,
    pub state: TaskState,
    pub assigned_worker: Option<Uuid>,
    /// Incremented exactly once per requeue.
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_status: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskFailure>,
    /// Last assignment/status/result activity, for the stale-task sweep.
    pub last_activity: Instant,
    /// Set when a requester cancels an in-flight task; the eventual
    /// terminal report from the worker still wins.
    pub cancel_requested: bool,
}

impl Task {
    pub fn new(capability: CapabilityType, payload: serde_json::Value) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            capability,
            payload,
            state: TaskState::Pending,
            assigned_worker: None,
            attempt_count: 0,
            created_at: Utc::now(),
            last_status: None,
            result: None,
            error: None,
            last_activity: Instant::now(),
            cancel_requested: false,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn view(&self) -> TaskView {
        TaskView {
            task_id: self.task_id,
            capability: self.capability,
            state: self.state,
            assigned_worker: self.assigned_worker,
            attempt_count: self.attempt_count,
            created_at: self.created_at,
            last_status: self.last_status.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
            cancel_requested: self.cancel_requested,
        }
    }
}

/// Serializable snapshot of a task, returned from the requester API and
/// sent on relay subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: Uuid,
    pub capability: CapabilityType,
    pub state: TaskState,
    pub assigned_worker: Option<Uuid>,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_status: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskFailure>,
    pub cancel_requested: bool,
}
