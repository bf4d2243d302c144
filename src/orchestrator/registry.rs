//! Registry of authenticated worker connections.
//!
//! The registry is plain data — it is only ever touched under the
//! dispatcher's lock, which is what makes state changes and idle-pool
//! membership a single atomic step.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{CapabilityType, ServerMessage};

/// State of one authenticated connection. The Connecting/Authenticating
/// phases live in the socket handler before a registry record exists;
/// Disconnected is the record's removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy { task_id: Uuid },
}

/// One authenticated remote agent. The socket task owns the actual
/// WebSocket; the registry holds only the outbox half.
#[derive(Debug)]
pub struct WorkerConnection {
    pub worker_id: Uuid,
    pub capability: CapabilityType,
    pub display_name: String,
    pub state: WorkerState,
    pub last_heartbeat: Instant,
    pub connected_at: DateTime<Utc>,
    /// Frames queued here are written to the socket by the connection's
    /// writer task. Dropping all senders closes the connection.
    pub outbox: mpsc::Sender<ServerMessage>,
}

/// Serializable snapshot of a worker, for the requester API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerView {
    pub worker_id: Uuid,
    pub capability: CapabilityType,
    pub display_name: String,
    pub busy: bool,
    pub current_task: Option<Uuid>,
    pub connected_at: DateTime<Utc>,
}

/// All live connections plus per-capability idle pools.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<Uuid, WorkerConnection>,
    /// Oldest-idle-first per capability, so assignment is fair over time.
    idle: HashMap<CapabilityType, VecDeque<Uuid>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a freshly authenticated worker in the Idle state.
    pub fn insert(&mut self, worker: WorkerConnection) {
        debug_assert_eq!(worker.state, WorkerState::Idle);
        self.idle
            .entry(worker.capability)
            .or_default()
            .push_back(worker.worker_id);
        self.workers.insert(worker.worker_id, worker);
    }

    /// Remove a worker entirely. Returns the record so the caller can
    /// requeue an in-flight task.
    pub fn remove(&mut self, worker_id: Uuid) -> Option<WorkerConnection> {
        let worker = self.workers.remove(&worker_id)?;
        if let Some(pool) = self.idle.get_mut(&worker.capability) {
            pool.retain(|id| *id != worker_id);
        }
        Some(worker)
    }

    pub fn get(&self, worker_id: Uuid) -> Option<&WorkerConnection> {
        self.workers.get(&worker_id)
    }

    /// Claim the longest-idle worker of a capability and mark it Busy.
    /// State change and pool removal happen together. Returns the worker
    /// id plus its outbox so the caller can write the assignment.
    pub fn claim_idle(
        &mut self,
        capability: CapabilityType,
        task_id: Uuid,
    ) -> Option<(Uuid, mpsc::Sender<ServerMessage>)> {
        let pool = self.idle.get_mut(&capability)?;
        let worker_id = pool.pop_front()?;
        // The pool only ever holds live workers, but stay on the safe
        // side of the invariant rather than panicking mid-dispatch.
        match self.workers.get_mut(&worker_id) {
            Some(worker) => {
                worker.state = WorkerState::Busy { task_id };
                Some((worker_id, worker.outbox.clone()))
            }
            None => None,
        }
    }

    /// Return a Busy worker to the back of its idle pool.
    pub fn release(&mut self, worker_id: Uuid) {
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            if matches!(worker.state, WorkerState::Busy { .. }) {
                worker.state = WorkerState::Idle;
                self.idle
                    .entry(worker.capability)
                    .or_default()
                    .push_back(worker_id);
            }
        }
    }

    pub fn record_heartbeat(&mut self, worker_id: Uuid) -> bool {
        match self.workers.get_mut(&worker_id) {
            Some(worker) => {
                worker.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Workers whose last heartbeat is older than `deadline`.
    pub fn silent_workers(&self, deadline: Duration) -> Vec<Uuid> {
        let now = Instant::now();
        self.workers
            .values()
            .filter(|w| now.duration_since(w.last_heartbeat) > deadline)
            .map(|w| w.worker_id)
            .collect()
    }

    pub fn has_idle(&self, capability: CapabilityType) -> bool {
        self.idle.get(&capability).is_some_and(|p| !p.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn views(&self) -> Vec<WorkerView> {
        self.workers
            .values()
            .map(|w| WorkerView {
                worker_id: w.worker_id,
                capability: w.capability,
                display_name: w.display_name.clone(),
                busy: matches!(w.state, WorkerState::Busy { .. }),
                current_task: match w.state {
                    WorkerState::Busy { task_id } => Some(task_id),
                    WorkerState::Idle => None,
                },
                connected_at: w.connected_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_worker(capability: CapabilityType) -> (WorkerConnection, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(8);
        let worker = WorkerConnection {
            worker_id: Uuid::new_v4(),
            capability,
            display_name: "test-worker".into(),
            state: WorkerState::Idle,
            last_heartbeat: Instant::now(),
            connected_at: Utc::now(),
            outbox: tx,
        };
        (worker, rx)
    }

    #[test]
    fn claim_is_oldest_idle_first() {
        let mut registry = WorkerRegistry::new();
        let (w1, _rx1) = make_worker(CapabilityType::Tracxn);
        let (w2, _rx2) = make_worker(CapabilityType::Tracxn);
        let (id1, id2) = (w1.worker_id, w2.worker_id);
        registry.insert(w1);
        registry.insert(w2);

        let task = Uuid::new_v4();
        let (claimed, _) = registry.claim_idle(CapabilityType::Tracxn, task).unwrap();
        assert_eq!(claimed, id1);
        // Release puts it at the back, so the next claim is the other worker.
        registry.release(id1);
        let (claimed, _) = registry.claim_idle(CapabilityType::Tracxn, task).unwrap();
        assert_eq!(claimed, id2);
    }

    #[test]
    fn claim_respects_capability() {
        let mut registry = WorkerRegistry::new();
        let (w, _rx) = make_worker(CapabilityType::Crunchbase);
        registry.insert(w);
        assert!(registry.claim_idle(CapabilityType::Social, Uuid::new_v4()).is_none());
    }

    #[test]
    fn remove_clears_idle_pool() {
        let mut registry = WorkerRegistry::new();
        let (w, _rx) = make_worker(CapabilityType::Linkedin);
        let id = w.worker_id;
        registry.insert(w);
        assert!(registry.remove(id).is_some());
        assert!(!registry.has_idle(CapabilityType::Linkedin));
        assert!(registry.is_empty());
    }

    #[test]
    fn silent_workers_by_deadline() {
        let mut registry = WorkerRegistry::new();
        let (mut w, _rx) = make_worker(CapabilityType::Tracxn);
        w.last_heartbeat = Instant::now() - Duration::from_secs(60);
        let id = w.worker_id;
        registry.insert(w);

        assert_eq!(registry.silent_workers(Duration::from_secs(30)), vec![id]);
        assert!(registry.silent_workers(Duration::from_secs(120)).is_empty());
    }
}
