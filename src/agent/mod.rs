//! The worker agent: orchestrator connection plus the local scraper bridge.

pub mod runtime;
pub mod scraper;

pub use runtime::AgentRuntime;
