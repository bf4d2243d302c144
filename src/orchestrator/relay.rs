//! Status relay — fan-out of task events to requester subscribers.
//!
//! One broadcast channel carries every task event; subscribers filter by
//! task id. Events for a single task are published in emission order from
//! under the dispatcher lock, so per-task ordering holds across both hops.
//! Late subscribers get no replay — the pull API serves the current view.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::TaskFailure;
use crate::orchestrator::task::TaskState;

const BROADCAST_CAPACITY: usize = 1024;

/// One observable change to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEventKind {
    /// State machine transition (Pending→Assigned, requeue, etc).
    StateChanged { state: TaskState },
    /// Worker-originated progress payload.
    Status { status: serde_json::Value },
    /// Terminal success, with the scraped result.
    Completed { result: Option<serde_json::Value> },
    /// Terminal failure.
    Failed { error: TaskFailure },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: Uuid,
    #[serde(flatten)]
    pub kind: TaskEventKind,
}

/// Routes task events from the dispatcher to whoever subscribed.
#[derive(Debug)]
pub struct StatusRelay {
    tx: broadcast::Sender<TaskEvent>,
}

impl StatusRelay {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Fine if nobody is listening — the task's own
    /// state remains queryable as the pull fallback.
    pub fn publish(&self, task_id: Uuid, kind: TaskEventKind) {
        let _ = self.tx.send(TaskEvent { task_id, kind });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }
}

impl Default for StatusRelay {
    fn default() -> Self {
        Self::new()
    }
}
