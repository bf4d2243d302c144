//! Error types for the scrape fleet.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("No worker tokens configured — set at least one FLEET_TOKEN_<CAPABILITY>")]
    NoTokens,
}

/// Errors at the connection/protocol boundary. Handled locally at the
/// socket and never fatal to the orchestrator process; the Display
/// strings double as `register_reject` reasons on the wire.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("expected register as first frame, got {got}")]
    NotRegistered { got: String },

    #[error("no register frame within the handshake window")]
    RegisterTimeout,

    #[error("malformed register frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("connection closed before registration")]
    ConnectionClosed,
}

/// Task-level errors surfaced to requesters.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Unknown capability type: {0}")]
    InvalidCapability(String),

    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} is already {state}, cannot cancel")]
    AlreadyTerminal { id: Uuid, state: String },

    #[error("Stale or mismatched report for task {task_id} from worker {worker_id}")]
    StaleReport { task_id: Uuid, worker_id: Uuid },
}

/// Why a task ended in the Failed state. Carried on the task itself and
/// in relay events, so it is serializable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskFailure {
    /// The assigned worker disconnected or went heartbeat-silent, and
    /// retry attempts are exhausted.
    WorkerLost,
    /// A running task produced no status or result within the stale window.
    TaskTimeout,
    /// The worker's local scraping capability reported a failure. Not
    /// retried by the orchestrator; resubmission is the requester's call.
    ScrapeError { message: String },
    /// Explicit cancellation by the requester.
    Cancelled,
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WorkerLost => write!(f, "worker lost"),
            Self::TaskTimeout => write!(f, "task timeout"),
            Self::ScrapeError { message } => write!(f, "scrape error: {message}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Errors on the agent side.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Orchestrator rejected registration: {reason}")]
    Rejected { reason: String },

    #[error("Connection to orchestrator lost: {0}")]
    ConnectionLost(String),

    #[error("Local scraper call failed: {0}")]
    Scraper(String),

    #[error("Local scraper timed out after {seconds}s")]
    ScraperTimeout { seconds: u64 },
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
