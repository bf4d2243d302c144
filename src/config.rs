//! Configuration types.
//!
//! Both binaries read their configuration from the environment. Anything
//! with a sensible default gets one; anything without is a hard startup
//! error with a `ConfigError` naming the variable.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::protocol::CapabilityType;

fn env_duration_secs(key: &str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

fn env_u32(key: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|e: std::num::ParseIntError| {
            ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }
        }),
        Err(_) => Ok(default),
    }
}

fn env_required(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Orchestrator (`fleetd`) configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Address the WS + REST server binds to.
    pub bind_addr: String,
    /// Bearer token accepted per capability type. A capability with no
    /// token configured accepts no workers at all.
    pub tokens: HashMap<CapabilityType, SecretString>,
    /// Expected heartbeat cadence from agents.
    pub heartbeat_interval: Duration,
    /// Heartbeats missed before a connection is declared dead.
    pub missed_threshold: u32,
    /// Requeues allowed before a lost task becomes terminally Failed.
    pub max_attempts: u32,
    /// A Running task silent for longer than this is treated as lost.
    pub stale_task_window: Duration,
    /// How long a fresh connection may sit without sending `register`.
    pub register_timeout: Duration,
    /// Safety-net dispatch sweep cadence.
    pub dispatch_sweep_interval: Duration,
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut tokens = HashMap::new();
        for cap in CapabilityType::ALL {
            let key = format!("FLEET_TOKEN_{}", cap.as_str().to_uppercase());
            if let Ok(token) = std::env::var(&key) {
                tokens.insert(cap, SecretString::from(token));
            }
        }
        if tokens.is_empty() {
            return Err(ConfigError::NoTokens);
        }

        Ok(Self {
            bind_addr: std::env::var("FLEET_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8090".to_string()),
            tokens,
            heartbeat_interval: env_duration_secs("FLEET_HEARTBEAT_INTERVAL_SECS", 10)?,
            missed_threshold: env_u32("FLEET_MISSED_THRESHOLD", 3)?,
            max_attempts: env_u32("FLEET_MAX_ATTEMPTS", 3)?,
            stale_task_window: env_duration_secs("FLEET_STALE_TASK_SECS", 300)?,
            register_timeout: env_duration_secs("FLEET_REGISTER_TIMEOUT_SECS", 10)?,
            dispatch_sweep_interval: env_duration_secs("FLEET_DISPATCH_SWEEP_SECS", 30)?,
        })
    }

    /// Connections silent for longer than this are force-disconnected.
    pub fn heartbeat_deadline(&self) -> Duration {
        self.heartbeat_interval * self.missed_threshold
    }
}

/// Worker agent (`fleet-agent`) configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Orchestrator WebSocket URL, e.g. `ws://fleet.internal:8090/ws`.
    pub orchestrator_url: String,
    /// The one capability this agent advertises.
    pub capability: CapabilityType,
    /// Bearer token for that capability.
    pub token: SecretString,
    /// Human-readable name shown in worker listings. Not unique.
    pub display_name: String,
    /// Base URL of the co-located scraper process.
    pub scraper_url: String,
    /// Where the local status-callback listener binds. The scraper pushes
    /// progress here without knowing anything about the WS protocol.
    pub callback_addr: String,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    /// Hard ceiling on one scrape invocation.
    pub scrape_timeout: Duration,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let capability_raw = env_required("FLEET_CAPABILITY")?;
        let capability =
            CapabilityType::from_str(&capability_raw).map_err(|message| {
                ConfigError::InvalidValue {
                    key: "FLEET_CAPABILITY".to_string(),
                    message,
                }
            })?;

        let display_name = std::env::var("FLEET_DISPLAY_NAME")
            .unwrap_or_else(|_| format!("{capability}-agent"));

        Ok(Self {
            orchestrator_url: env_required("FLEET_ORCHESTRATOR_URL")?,
            capability,
            token: SecretString::from(env_required("FLEET_TOKEN")?),
            display_name,
            scraper_url: env_required("FLEET_SCRAPER_URL")?,
            callback_addr: std::env::var("FLEET_CALLBACK_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8091".to_string()),
            heartbeat_interval: env_duration_secs("FLEET_HEARTBEAT_INTERVAL_SECS", 10)?,
            reconnect_delay: env_duration_secs("FLEET_RECONNECT_DELAY_SECS", 5)?,
            scrape_timeout: env_duration_secs("FLEET_SCRAPE_TIMEOUT_SECS", 600)?,
        })
    }
}
