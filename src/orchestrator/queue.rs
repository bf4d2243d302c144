//! Per-capability FIFO queues of pending task ids.

use std::collections::{HashMap, VecDeque};

use uuid::Uuid;

use crate::protocol::CapabilityType;

/// One ordered queue of Pending task ids per capability type. Submission
/// order is assignment order, except requeued tasks which jump the line.
#[derive(Debug, Default)]
pub struct CapabilityQueues {
    queues: HashMap<CapabilityType, VecDeque<Uuid>>,
}

impl CapabilityQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a freshly submitted task.
    pub fn push_back(&mut self, capability: CapabilityType, task_id: Uuid) {
        self.queues.entry(capability).or_default().push_back(task_id);
    }

    /// Prioritized redelivery: a requeued task already waited once, so it
    /// goes ahead of later submissions of the same type.
    pub fn push_front(&mut self, capability: CapabilityType, task_id: Uuid) {
        self.queues.entry(capability).or_default().push_front(task_id);
    }

    /// Pop the oldest pending task id for a capability.
    pub fn pop(&mut self, capability: CapabilityType) -> Option<Uuid> {
        self.queues.get_mut(&capability)?.pop_front()
    }

    /// Remove a specific task id wherever it sits (cancellation of a
    /// Pending task). Returns true if it was queued.
    pub fn remove(&mut self, capability: CapabilityType, task_id: Uuid) -> bool {
        if let Some(queue) = self.queues.get_mut(&capability) {
            if let Some(pos) = queue.iter().position(|id| *id == task_id) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }
}
