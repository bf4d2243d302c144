//! The job orchestrator: registry, queues, dispatcher, relay and the
//! WS/REST surface.

pub mod dispatcher;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod sweep;
pub mod task;
pub mod ws;
