//! Periodic background sweeps.
//!
//! Three independent schedules, none of which can be blocked by a slow
//! connection: the heartbeat sweep bounds dead-connection detection to a
//! small multiple of the heartbeat interval, the stale-task sweep catches
//! worker-side hangs that keep heartbeating, and the dispatch sweep is a
//! safety net behind the event-driven dispatch triggers.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::orchestrator::dispatcher::Dispatcher;
use crate::protocol::CapabilityType;

/// Sweep for heartbeat-silent connections every half heartbeat interval.
pub fn spawn_heartbeat_sweep(dispatcher: Arc<Dispatcher>) -> JoinHandle<()> {
    let period = (dispatcher.config().heartbeat_interval / 2).max(std::time::Duration::from_millis(100));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            dispatcher.sweep_heartbeats().await;
        }
    })
}

/// Sweep for Running tasks silent past the stale window.
pub fn spawn_stale_task_sweep(dispatcher: Arc<Dispatcher>) -> JoinHandle<()> {
    let period = (dispatcher.config().stale_task_window / 2).max(std::time::Duration::from_secs(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            dispatcher.sweep_stale_tasks().await;
        }
    })
}

/// Safety-net dispatch attempt across every capability type.
pub fn spawn_dispatch_sweep(dispatcher: Arc<Dispatcher>) -> JoinHandle<()> {
    let period = dispatcher.config().dispatch_sweep_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            for capability in CapabilityType::ALL {
                dispatcher.dispatch(capability).await;
            }
        }
    })
}
