//! Wire protocol between worker agents and the orchestrator.
//!
//! All frames are JSON text over a persistent WebSocket, internally tagged
//! on `type`. The orchestrator never interprets task payloads — they are
//! opaque blobs handed through to the capable worker.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The category of scrape work a worker can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityType {
    Crunchbase,
    Tracxn,
    Social,
    Linkedin,
}

impl CapabilityType {
    /// All known capability types, in a fixed order.
    pub const ALL: [CapabilityType; 4] = [
        Self::Crunchbase,
        Self::Tracxn,
        Self::Social,
        Self::Linkedin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crunchbase => "crunchbase",
            Self::Tracxn => "tracxn",
            Self::Social => "social",
            Self::Linkedin => "linkedin",
        }
    }
}

impl fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crunchbase" => Ok(Self::Crunchbase),
            "tracxn" => Ok(Self::Tracxn),
            "social" => Ok(Self::Social),
            "linkedin" => Ok(Self::Linkedin),
            other => Err(format!("unknown capability type: {other}")),
        }
    }
}

/// Frames sent by a worker agent to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// First frame on every connection: authenticate and advertise capability.
    Register {
        capability: CapabilityType,
        token: String,
        display_name: String,
    },
    /// Periodic liveness signal, independent of task activity.
    Heartbeat { timestamp: DateTime<Utc> },
    /// Progress update for an in-flight task. Payload shape is scraper-defined.
    TaskStatus {
        task_id: Uuid,
        status: serde_json::Value,
    },
    /// Terminal report — exactly one per assignment.
    TaskResult {
        task_id: Uuid,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Frames sent by the orchestrator to a worker agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Registration accepted; `worker_id` identifies this connection.
    RegisterAck { worker_id: Uuid },
    /// Registration refused; the connection is closed right after.
    RegisterReject { reason: String },
    /// A task for this worker to execute.
    TaskAssign {
        task_id: Uuid,
        payload: serde_json::Value,
    },
    /// Best-effort cancellation of an in-flight task.
    TaskCancel { task_id: Uuid },
}
