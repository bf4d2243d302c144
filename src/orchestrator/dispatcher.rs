//! Dispatcher — the single owner of all shared orchestrator state.
//!
//! Registry, queues and the task table live behind one lock, so every
//! read-modify-write sequence (assign, requeue, status report) is a single
//! critical section. Two concurrent dispatch attempts can never hand the
//! same task out twice or double-book a worker, and no caller ever sees a
//! half-updated view. Socket writes happen outside the lock; a failed
//! write is treated as the worker disconnecting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use secrecy::ExposeSecret;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{TaskError, TaskFailure};
use crate::orchestrator::queue::CapabilityQueues;
use crate::orchestrator::registry::{WorkerConnection, WorkerRegistry, WorkerState, WorkerView};
use crate::orchestrator::relay::{StatusRelay, TaskEventKind};
use crate::orchestrator::task::{Task, TaskState, TaskView};
use crate::protocol::{CapabilityType, ServerMessage};

/// Everything mutable, behind the dispatcher lock.
struct DispatchState {
    registry: WorkerRegistry,
    queues: CapabilityQueues,
    tasks: HashMap<Uuid, Task>,
}

/// Matches idle workers to queued tasks and tracks in-flight assignments.
pub struct Dispatcher {
    config: OrchestratorConfig,
    relay: StatusRelay,
    state: Mutex<DispatchState>,
}

impl Dispatcher {
    pub fn new(config: OrchestratorConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            relay: StatusRelay::new(),
            state: Mutex::new(DispatchState {
                registry: WorkerRegistry::new(),
                queues: CapabilityQueues::new(),
                tasks: HashMap::new(),
            }),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn relay(&self) -> &StatusRelay {
        &self.relay
    }

    /// Check a registration token against the configured token for its
    /// capability. A capability with no token configured accepts nobody.
    pub fn authorize(&self, capability: CapabilityType, token: &str) -> bool {
        self.config
            .tokens
            .get(&capability)
            .is_some_and(|expected| expected.expose_secret() == token)
    }

    // ── Worker lifecycle ────────────────────────────────────────────────

    /// Register an authenticated worker. It enters the idle pool and may
    /// immediately be handed queued work.
    pub async fn register_worker(
        &self,
        capability: CapabilityType,
        display_name: String,
        outbox: mpsc::Sender<ServerMessage>,
    ) -> Uuid {
        self.register_with_id(Uuid::new_v4(), capability, display_name, outbox)
            .await
    }

    /// Register under a caller-chosen id, so the socket handler can put
    /// the id in `register_ack` before any assignment can race it.
    pub async fn register_with_id(
        &self,
        worker_id: Uuid,
        capability: CapabilityType,
        display_name: String,
        outbox: mpsc::Sender<ServerMessage>,
    ) -> Uuid {
        {
            let mut state = self.state.lock().await;
            state.registry.insert(WorkerConnection {
                worker_id,
                capability,
                display_name: display_name.clone(),
                state: WorkerState::Idle,
                last_heartbeat: Instant::now(),
                connected_at: Utc::now(),
                outbox,
            });
        }
        info!(%worker_id, %capability, display_name, "Worker registered");
        self.dispatch(capability).await;
        worker_id
    }

    /// Remove a worker (socket closed, socket error, heartbeat timeout or
    /// stale-task force-disconnect). An in-flight task is requeued with
    /// the given failure cause charged against its attempt budget.
    pub async fn disconnect_worker(&self, worker_id: Uuid, cause: TaskFailure) {
        let capability = {
            let mut state = self.state.lock().await;
            let Some(worker) = state.registry.remove(worker_id) else {
                return;
            };
            info!(%worker_id, capability = %worker.capability, "Worker disconnected");
            if let WorkerState::Busy { task_id } = worker.state {
                self.requeue_locked(&mut state, task_id, cause);
                Some(worker.capability)
            } else {
                None
            }
        };
        if let Some(capability) = capability {
            self.dispatch(capability).await;
        }
    }

    /// Record a heartbeat. Returns false for unknown workers (already
    /// swept), which the socket handler treats as a cue to shut down.
    pub async fn heartbeat(&self, worker_id: Uuid) -> bool {
        self.state.lock().await.registry.record_heartbeat(worker_id)
    }

    // ── Requester operations ────────────────────────────────────────────

    /// Create a Pending task, enqueue it, and try to dispatch right away.
    pub async fn submit(&self, capability: CapabilityType, payload: serde_json::Value) -> TaskView {
        let view = {
            let mut state = self.state.lock().await;
            let task = Task::new(capability, payload);
            let view = task.view();
            state.queues.push_back(capability, task.task_id);
            state.tasks.insert(task.task_id, task);
            view
        };
        info!(task_id = %view.task_id, %capability, "Task submitted");
        self.dispatch(capability).await;
        view
    }

    pub async fn get_task(&self, task_id: Uuid) -> Option<TaskView> {
        self.state.lock().await.tasks.get(&task_id).map(Task::view)
    }

    pub async fn list_tasks(&self) -> Vec<TaskView> {
        self.state.lock().await.tasks.values().map(Task::view).collect()
    }

    pub async fn list_workers(&self) -> Vec<WorkerView> {
        self.state.lock().await.registry.views()
    }

    /// Cancel a task. Pending tasks die immediately; Assigned/Running
    /// tasks get a best-effort `task_cancel` forward, and whatever
    /// terminal result the worker eventually reports still wins.
    pub async fn cancel(&self, task_id: Uuid) -> Result<TaskView, TaskError> {
        let forward = {
            let mut state = self.state.lock().await;
            let (task_state, capability, assigned_worker) = {
                let task = state
                    .tasks
                    .get(&task_id)
                    .ok_or(TaskError::NotFound { id: task_id })?;
                (task.state, task.capability, task.assigned_worker)
            };

            match task_state {
                TaskState::Pending => {
                    state.queues.remove(capability, task_id);
                    if let Some(task) = state.tasks.get_mut(&task_id) {
                        task.state = TaskState::Failed;
                        task.error = Some(TaskFailure::Cancelled);
                    }
                    self.relay
                        .publish(task_id, TaskEventKind::Failed { error: TaskFailure::Cancelled });
                    info!(%task_id, "Pending task cancelled");
                    None
                }
                TaskState::Assigned | TaskState::Running => {
                    if let Some(task) = state.tasks.get_mut(&task_id) {
                        task.cancel_requested = true;
                    }
                    assigned_worker
                        .and_then(|id| state.registry.get(id))
                        .map(|w| w.outbox.clone())
                }
                TaskState::Completed | TaskState::Failed => {
                    return Err(TaskError::AlreadyTerminal {
                        id: task_id,
                        state: task_state.to_string(),
                    });
                }
            }
        };

        if let Some(outbox) = forward {
            info!(%task_id, "Forwarding cancellation to worker");
            if outbox.send(ServerMessage::TaskCancel { task_id }).await.is_err() {
                debug!(%task_id, "Cancel forward failed, worker already gone");
            }
        }

        self.get_task(task_id)
            .await
            .ok_or(TaskError::NotFound { id: task_id })
    }

    // ── Worker reports ──────────────────────────────────────────────────

    /// Progress update from a worker. Rejected unless the task is really
    /// assigned to that worker — stale and spoofed reports are dropped.
    pub async fn report_status(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        status: serde_json::Value,
    ) -> Result<(), TaskError> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(TaskError::NotFound { id: task_id })?;

        if task.assigned_worker != Some(worker_id) || task.state.is_terminal() {
            return Err(TaskError::StaleReport { task_id, worker_id });
        }

        if task.state == TaskState::Assigned {
            task.state = TaskState::Running;
            self.relay
                .publish(task_id, TaskEventKind::StateChanged { state: TaskState::Running });
        }
        task.last_status = Some(status.clone());
        task.touch();
        self.relay.publish(task_id, TaskEventKind::Status { status });
        Ok(())
    }

    /// Terminal report from a worker. Frees the worker and immediately
    /// tries to hand it the next queued task of its type.
    pub async fn report_result(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        success: bool,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), TaskError> {
        let capability = {
            let mut state = self.state.lock().await;
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or(TaskError::NotFound { id: task_id })?;

            if task.assigned_worker != Some(worker_id) || task.state.is_terminal() {
                return Err(TaskError::StaleReport { task_id, worker_id });
            }

            task.assigned_worker = None;
            task.touch();
            if success {
                task.state = TaskState::Completed;
                task.result = result.clone();
                info!(%task_id, %worker_id, "Task completed");
                self.relay.publish(task_id, TaskEventKind::Completed { result });
            } else {
                let failure = TaskFailure::ScrapeError {
                    message: error.unwrap_or_else(|| "unspecified scrape error".to_string()),
                };
                task.state = TaskState::Failed;
                task.error = Some(failure.clone());
                warn!(%task_id, %worker_id, error = %failure, "Task failed");
                self.relay.publish(task_id, TaskEventKind::Failed { error: failure });
            }

            let capability = task.capability;
            state.registry.release(worker_id);
            capability
        };

        self.dispatch(capability).await;
        Ok(())
    }

    // ── Sweeps ──────────────────────────────────────────────────────────

    /// Force-disconnect every connection past the missed-heartbeat
    /// deadline. Their in-flight tasks are requeued.
    pub async fn sweep_heartbeats(&self) {
        let deadline = self.config.heartbeat_deadline();
        let silent = { self.state.lock().await.registry.silent_workers(deadline) };
        for worker_id in silent {
            warn!(%worker_id, ?deadline, "Worker heartbeat-silent, disconnecting");
            self.disconnect_worker(worker_id, TaskFailure::WorkerLost).await;
        }
    }

    /// Requeue Running/Assigned tasks with no activity inside the stale
    /// window, treating the owning worker as lost. Guards against
    /// worker-side hangs that keep heartbeating.
    pub async fn sweep_stale_tasks(&self) {
        let window = self.config.stale_task_window;
        let now = Instant::now();
        let stale_workers: Vec<Uuid> = {
            let state = self.state.lock().await;
            state
                .tasks
                .values()
                .filter(|t| {
                    matches!(t.state, TaskState::Assigned | TaskState::Running)
                        && now.duration_since(t.last_activity) > window
                })
                .filter_map(|t| t.assigned_worker)
                .collect()
        };
        for worker_id in stale_workers {
            warn!(%worker_id, ?window, "Task stale past window, disconnecting worker");
            self.disconnect_worker(worker_id, TaskFailure::TaskTimeout).await;
        }
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    /// Assign queued tasks to idle workers of one capability until either
    /// side runs out. The pop-and-claim is one critical section; only the
    /// socket write happens outside it.
    pub async fn dispatch(&self, capability: CapabilityType) {
        loop {
            let (task_id, worker_id, payload, outbox) = {
                let mut state = self.state.lock().await;
                let Some(task_id) = state.queues.pop(capability) else {
                    break;
                };
                let still_pending = state
                    .tasks
                    .get(&task_id)
                    .is_some_and(|t| t.state == TaskState::Pending);
                if !still_pending {
                    // Queue held an id for a task no longer Pending.
                    continue;
                }
                let Some((worker_id, outbox)) = state.registry.claim_idle(capability, task_id)
                else {
                    // Head of queue goes back to the head.
                    state.queues.push_front(capability, task_id);
                    break;
                };
                let task = state.tasks.get_mut(&task_id).expect("checked pending above");
                task.state = TaskState::Assigned;
                task.assigned_worker = Some(worker_id);
                task.touch();
                let payload = task.payload.clone();
                self.relay
                    .publish(task_id, TaskEventKind::StateChanged { state: TaskState::Assigned });
                (task_id, worker_id, payload, outbox)
            };
            debug!(%task_id, %worker_id, %capability, "Task assigned");
            if outbox
                .send(ServerMessage::TaskAssign { task_id, payload })
                .await
                .is_err()
            {
                // Writer task is gone; treat as a lost worker, which
                // requeues the task and keeps this loop going.
                warn!(%worker_id, "Assignment write failed, dropping worker");
                self.remove_lost_worker(worker_id).await;
            }
        }
    }

    /// Like `disconnect_worker` but without re-entering `dispatch` — used
    /// from inside the dispatch loop itself.
    async fn remove_lost_worker(&self, worker_id: Uuid) {
        let mut state = self.state.lock().await;
        if let Some(worker) = state.registry.remove(worker_id) {
            if let WorkerState::Busy { task_id } = worker.state {
                self.requeue_locked(&mut state, task_id, TaskFailure::WorkerLost);
            }
        }
    }

    /// Requeue a lost in-flight task, or fail it once attempts exhaust.
    /// Caller holds the dispatcher lock.
    fn requeue_locked(&self, state: &mut DispatchState, task_id: Uuid, cause: TaskFailure) {
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return;
        };
        if task.state.is_terminal() {
            return;
        }

        task.assigned_worker = None;
        // The requester already asked for this task to die; losing the
        // worker must not resurrect it.
        if task.cancel_requested {
            task.state = TaskState::Failed;
            task.error = Some(TaskFailure::Cancelled);
            info!(%task_id, %cause, "Cancelled task dropped on worker loss");
            self.relay
                .publish(task_id, TaskEventKind::Failed { error: TaskFailure::Cancelled });
            return;
        }
        if task.attempt_count < self.config.max_attempts {
            task.attempt_count += 1;
            task.state = TaskState::Pending;
            task.touch();
            let capability = task.capability;
            info!(%task_id, attempt = task.attempt_count, %cause, "Task requeued");
            state.queues.push_front(capability, task_id);
            self.relay
                .publish(task_id, TaskEventKind::StateChanged { state: TaskState::Pending });
        } else {
            task.state = TaskState::Failed;
            task.error = Some(cause.clone());
            warn!(%task_id, attempts = task.attempt_count, %cause, "Task attempts exhausted");
            self.relay.publish(task_id, TaskEventKind::Failed { error: cause });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;

    use secrecy::SecretString;

    fn test_config(max_attempts: u32) -> OrchestratorConfig {
        let mut tokens = StdHashMap::new();
        tokens.insert(CapabilityType::Tracxn, SecretString::from("tracxn-secret"));
        tokens.insert(CapabilityType::Crunchbase, SecretString::from("cb-secret"));
        OrchestratorConfig {
            bind_addr: "127.0.0.1:0".into(),
            tokens,
            heartbeat_interval: Duration::from_secs(10),
            missed_threshold: 3,
            max_attempts,
            stale_task_window: Duration::from_secs(300),
            register_timeout: Duration::from_secs(10),
            dispatch_sweep_interval: Duration::from_secs(30),
        }
    }

    async fn connect_worker(
        dispatcher: &Dispatcher,
        capability: CapabilityType,
    ) -> (Uuid, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let id = dispatcher
            .register_worker(capability, "test".into(), tx)
            .await;
        (id, rx)
    }

    #[test]
    fn authorize_checks_token_per_capability() {
        let dispatcher = Dispatcher::new(test_config(3));
        assert!(dispatcher.authorize(CapabilityType::Tracxn, "tracxn-secret"));
        assert!(!dispatcher.authorize(CapabilityType::Tracxn, "cb-secret"));
        // No token configured for social at all.
        assert!(!dispatcher.authorize(CapabilityType::Social, "anything"));
    }

    #[tokio::test]
    async fn submit_with_idle_worker_assigns_immediately() {
        let dispatcher = Dispatcher::new(test_config(3));
        let (worker_id, mut rx) = connect_worker(&dispatcher, CapabilityType::Tracxn).await;

        let view = dispatcher
            .submit(CapabilityType::Tracxn, serde_json::json!({"company": "Acme"}))
            .await;

        match rx.recv().await.unwrap() {
            ServerMessage::TaskAssign { task_id, payload } => {
                assert_eq!(task_id, view.task_id);
                assert_eq!(payload["company"], "Acme");
            }
            other => panic!("expected task_assign, got {other:?}"),
        }

        let task = dispatcher.get_task(view.task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Assigned);
        assert_eq!(task.assigned_worker, Some(worker_id));
    }

    #[tokio::test]
    async fn second_task_waits_until_first_terminal() {
        let dispatcher = Dispatcher::new(test_config(3));
        let (worker_id, mut rx) = connect_worker(&dispatcher, CapabilityType::Crunchbase).await;

        let first = dispatcher
            .submit(CapabilityType::Crunchbase, serde_json::json!({"n": 1}))
            .await;
        let second = dispatcher
            .submit(CapabilityType::Crunchbase, serde_json::json!({"n": 2}))
            .await;

        // One assignment only.
        assert!(matches!(rx.recv().await.unwrap(), ServerMessage::TaskAssign { .. }));
        assert_eq!(
            dispatcher.get_task(second.task_id).await.unwrap().state,
            TaskState::Pending
        );

        dispatcher
            .report_result(first.task_id, worker_id, true, Some(serde_json::json!({})), None)
            .await
            .unwrap();

        // Worker freed, second task assigned, FIFO preserved.
        match rx.recv().await.unwrap() {
            ServerMessage::TaskAssign { task_id, .. } => assert_eq!(task_id, second.task_id),
            other => panic!("expected task_assign, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tasks_only_go_to_matching_capability() {
        let dispatcher = Dispatcher::new(test_config(3));
        let (_worker, mut rx) = connect_worker(&dispatcher, CapabilityType::Crunchbase).await;

        let view = dispatcher
            .submit(CapabilityType::Tracxn, serde_json::json!({}))
            .await;

        assert_eq!(
            dispatcher.get_task(view.task_id).await.unwrap().state,
            TaskState::Pending
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn status_report_moves_task_to_running() {
        let dispatcher = Dispatcher::new(test_config(3));
        let (worker_id, _rx) = connect_worker(&dispatcher, CapabilityType::Tracxn).await;
        let view = dispatcher
            .submit(CapabilityType::Tracxn, serde_json::json!({}))
            .await;

        dispatcher
            .report_status(view.task_id, worker_id, serde_json::json!({"pct": 40}))
            .await
            .unwrap();

        let task = dispatcher.get_task(view.task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Running);
        assert_eq!(task.last_status.unwrap()["pct"], 40);
    }

    #[tokio::test]
    async fn stale_report_from_wrong_worker_is_rejected() {
        let dispatcher = Dispatcher::new(test_config(3));
        let (_worker, _rx) = connect_worker(&dispatcher, CapabilityType::Tracxn).await;
        let view = dispatcher
            .submit(CapabilityType::Tracxn, serde_json::json!({}))
            .await;

        let imposter = Uuid::new_v4();
        let err = dispatcher
            .report_status(view.task_id, imposter, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::StaleReport { .. }));

        let err = dispatcher
            .report_result(view.task_id, imposter, true, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::StaleReport { .. }));
    }

    #[tokio::test]
    async fn duplicate_terminal_report_is_rejected() {
        let dispatcher = Dispatcher::new(test_config(3));
        let (worker_id, _rx) = connect_worker(&dispatcher, CapabilityType::Tracxn).await;
        let view = dispatcher
            .submit(CapabilityType::Tracxn, serde_json::json!({}))
            .await;

        dispatcher
            .report_result(view.task_id, worker_id, true, None, None)
            .await
            .unwrap();
        let err = dispatcher
            .report_result(view.task_id, worker_id, false, None, Some("late".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::StaleReport { .. }));

        // First write won.
        assert_eq!(
            dispatcher.get_task(view.task_id).await.unwrap().state,
            TaskState::Completed
        );
    }

    #[tokio::test]
    async fn failed_result_carries_scrape_error() {
        let dispatcher = Dispatcher::new(test_config(3));
        let (worker_id, _rx) = connect_worker(&dispatcher, CapabilityType::Tracxn).await;
        let view = dispatcher
            .submit(CapabilityType::Tracxn, serde_json::json!({}))
            .await;

        dispatcher
            .report_result(view.task_id, worker_id, false, None, Some("blocked by captcha".into()))
            .await
            .unwrap();

        let task = dispatcher.get_task(view.task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(
            task.error,
            Some(TaskFailure::ScrapeError { message: "blocked by captcha".into() })
        );
    }

    #[tokio::test]
    async fn busy_worker_loss_requeues_to_front_and_reassigns() {
        let dispatcher = Dispatcher::new(test_config(3));
        let (first_worker, mut rx1) = connect_worker(&dispatcher, CapabilityType::Tracxn).await;

        let first = dispatcher
            .submit(CapabilityType::Tracxn, serde_json::json!({"n": 1}))
            .await;
        let second = dispatcher
            .submit(CapabilityType::Tracxn, serde_json::json!({"n": 2}))
            .await;
        assert!(matches!(rx1.recv().await.unwrap(), ServerMessage::TaskAssign { .. }));

        dispatcher
            .disconnect_worker(first_worker, TaskFailure::WorkerLost)
            .await;

        // Requeued task jumps ahead of the second submission.
        let (_second_worker, mut rx2) = connect_worker(&dispatcher, CapabilityType::Tracxn).await;
        match rx2.recv().await.unwrap() {
            ServerMessage::TaskAssign { task_id, .. } => assert_eq!(task_id, first.task_id),
            other => panic!("expected task_assign, got {other:?}"),
        }

        let requeued = dispatcher.get_task(first.task_id).await.unwrap();
        assert_eq!(requeued.attempt_count, 1);
        assert_eq!(
            dispatcher.get_task(second.task_id).await.unwrap().state,
            TaskState::Pending
        );
    }

    #[tokio::test]
    async fn requeue_bound_fails_task_with_worker_lost() {
        let dispatcher = Dispatcher::new(test_config(1));
        let view = dispatcher
            .submit(CapabilityType::Tracxn, serde_json::json!({}))
            .await;

        // Attempt 1: worker takes the task and dies.
        let (w1, mut rx1) = connect_worker(&dispatcher, CapabilityType::Tracxn).await;
        assert!(matches!(rx1.recv().await.unwrap(), ServerMessage::TaskAssign { .. }));
        dispatcher.disconnect_worker(w1, TaskFailure::WorkerLost).await;
        assert_eq!(
            dispatcher.get_task(view.task_id).await.unwrap().attempt_count,
            1
        );

        // Attempt budget exhausted: the next loss is terminal.
        let (w2, mut rx2) = connect_worker(&dispatcher, CapabilityType::Tracxn).await;
        assert!(matches!(rx2.recv().await.unwrap(), ServerMessage::TaskAssign { .. }));
        dispatcher.disconnect_worker(w2, TaskFailure::WorkerLost).await;

        let task = dispatcher.get_task(view.task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.error, Some(TaskFailure::WorkerLost));

        // A fresh worker gets nothing.
        let (_w3, mut rx3) = connect_worker(&dispatcher, CapabilityType::Tracxn).await;
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_pending_task_removes_it_from_queue() {
        let dispatcher = Dispatcher::new(test_config(3));
        let view = dispatcher
            .submit(CapabilityType::Crunchbase, serde_json::json!({}))
            .await;

        let cancelled = dispatcher.cancel(view.task_id).await.unwrap();
        assert_eq!(cancelled.state, TaskState::Failed);
        assert_eq!(cancelled.error, Some(TaskFailure::Cancelled));

        // A worker connecting later never sees it.
        let (_w, mut rx) = connect_worker(&dispatcher, CapabilityType::Crunchbase).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_running_task_forwards_and_result_still_wins() {
        let dispatcher = Dispatcher::new(test_config(3));
        let (worker_id, mut rx) = connect_worker(&dispatcher, CapabilityType::Tracxn).await;
        let view = dispatcher
            .submit(CapabilityType::Tracxn, serde_json::json!({}))
            .await;
        assert!(matches!(rx.recv().await.unwrap(), ServerMessage::TaskAssign { .. }));

        let cancelled = dispatcher.cancel(view.task_id).await.unwrap();
        assert!(cancelled.cancel_requested);
        match rx.recv().await.unwrap() {
            ServerMessage::TaskCancel { task_id } => assert_eq!(task_id, view.task_id),
            other => panic!("expected task_cancel, got {other:?}"),
        }

        // Worker finished anyway; last write wins.
        dispatcher
            .report_result(view.task_id, worker_id, true, Some(serde_json::json!({"ok": 1})), None)
            .await
            .unwrap();
        assert_eq!(
            dispatcher.get_task(view.task_id).await.unwrap().state,
            TaskState::Completed
        );
    }

    #[tokio::test]
    async fn cancelled_task_is_not_requeued_on_worker_loss() {
        let dispatcher = Dispatcher::new(test_config(3));
        let (worker_id, mut rx) = connect_worker(&dispatcher, CapabilityType::Tracxn).await;
        let view = dispatcher
            .submit(CapabilityType::Tracxn, serde_json::json!({}))
            .await;
        assert!(matches!(rx.recv().await.unwrap(), ServerMessage::TaskAssign { .. }));

        dispatcher.cancel(view.task_id).await.unwrap();
        // The worker dies before honoring the cancel.
        dispatcher.disconnect_worker(worker_id, TaskFailure::WorkerLost).await;

        let task = dispatcher.get_task(view.task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.error, Some(TaskFailure::Cancelled));

        // The cancelled task never reaches a fresh worker.
        let (_w2, mut rx2) = connect_worker(&dispatcher, CapabilityType::Tracxn).await;
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_terminal_task_is_an_error() {
        let dispatcher = Dispatcher::new(test_config(3));
        let (worker_id, _rx) = connect_worker(&dispatcher, CapabilityType::Tracxn).await;
        let view = dispatcher
            .submit(CapabilityType::Tracxn, serde_json::json!({}))
            .await;
        dispatcher
            .report_result(view.task_id, worker_id, true, None, None)
            .await
            .unwrap();

        let err = dispatcher.cancel(view.task_id).await.unwrap_err();
        assert!(matches!(err, TaskError::AlreadyTerminal { .. }));
    }

    #[tokio::test]
    async fn fair_rotation_between_idle_workers() {
        let dispatcher = Dispatcher::new(test_config(3));
        let (w1, mut rx1) = connect_worker(&dispatcher, CapabilityType::Tracxn).await;
        let (_w2, mut rx2) = connect_worker(&dispatcher, CapabilityType::Tracxn).await;

        let first = dispatcher
            .submit(CapabilityType::Tracxn, serde_json::json!({}))
            .await;
        // Oldest-idle worker gets it.
        match rx1.recv().await.unwrap() {
            ServerMessage::TaskAssign { task_id, .. } => assert_eq!(task_id, first.task_id),
            other => panic!("expected task_assign, got {other:?}"),
        }

        dispatcher
            .report_result(first.task_id, w1, true, None, None)
            .await
            .unwrap();

        // w1 rejoined at the back of the pool, so w2 is next.
        let second = dispatcher
            .submit(CapabilityType::Tracxn, serde_json::json!({}))
            .await;
        match rx2.recv().await.unwrap() {
            ServerMessage::TaskAssign { task_id, .. } => assert_eq!(task_id, second.task_id),
            other => panic!("expected task_assign, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_task_sweep_requeues_and_drops_worker() {
        let mut config = test_config(3);
        config.stale_task_window = Duration::from_millis(0);
        let dispatcher = Dispatcher::new(config);

        let (worker_id, mut rx) = connect_worker(&dispatcher, CapabilityType::Tracxn).await;
        let view = dispatcher
            .submit(CapabilityType::Tracxn, serde_json::json!({}))
            .await;
        assert!(matches!(rx.recv().await.unwrap(), ServerMessage::TaskAssign { .. }));

        tokio::time::sleep(Duration::from_millis(5)).await;
        dispatcher.sweep_stale_tasks().await;

        let task = dispatcher.get_task(view.task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempt_count, 1);
        assert!(dispatcher.get_task(view.task_id).await.unwrap().assigned_worker.is_none());
        assert!(!dispatcher.heartbeat(worker_id).await);
    }

    #[tokio::test]
    async fn heartbeat_sweep_disconnects_silent_workers() {
        let mut config = test_config(3);
        config.heartbeat_interval = Duration::from_millis(0);
        let dispatcher = Dispatcher::new(config);

        let (worker_id, _rx) = connect_worker(&dispatcher, CapabilityType::Tracxn).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        dispatcher.sweep_heartbeats().await;
        assert!(!dispatcher.heartbeat(worker_id).await);
        assert!(dispatcher.list_workers().await.is_empty());
    }
}
