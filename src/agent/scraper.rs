//! Bridge to the co-located scraper process.
//!
//! The scraping logic itself lives in a separate local process with a
//! plain HTTP API. The agent invokes it with a callback URL; the scraper
//! pushes progress to the callback listener here without ever knowing
//! about the orchestrator's WebSocket protocol.

use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AgentError;

/// Progress pushed by the local scraper for one task.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub task_id: Uuid,
    pub status: serde_json::Value,
}

/// HTTP client for the local scraping capability.
#[derive(Debug, Clone)]
pub struct ScraperClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl ScraperClient {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// Run one scrape job to completion. The response body is the final
    /// result; progress arrives separately via the callback listener.
    pub async fn run(
        &self,
        task_id: Uuid,
        payload: serde_json::Value,
        callback_url: String,
    ) -> Result<serde_json::Value, AgentError> {
        let url = format!("{}/scrape", self.base_url);
        let body = serde_json::json!({
            "task_id": task_id,
            "payload": payload,
            "callback_url": callback_url,
        });

        let request = self.http.post(&url).json(&body).send();
        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| AgentError::ScraperTimeout {
                seconds: self.timeout.as_secs(),
            })?
            .map_err(|e| AgentError::Scraper(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(AgentError::Scraper(format!(
                "scraper returned {status}: {detail}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AgentError::Scraper(format!("unparseable scraper response: {e}")))
    }
}

// ── Local status-callback listener ─────────────────────────────────────

#[derive(Clone)]
struct CallbackState {
    tx: mpsc::Sender<StatusUpdate>,
}

/// Router for the local callback listener.
pub fn callback_routes(tx: mpsc::Sender<StatusUpdate>) -> Router {
    Router::new()
        .route("/callback/{task_id}", post(receive_callback))
        .with_state(CallbackState { tx })
}

async fn receive_callback(
    State(state): State<CallbackState>,
    Path(task_id): Path<String>,
    Json(status): Json<serde_json::Value>,
) -> impl IntoResponse {
    let Ok(task_id) = Uuid::parse_str(&task_id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid task ID"})),
        );
    };

    debug!(%task_id, "Scraper progress callback");
    if state.tx.send(StatusUpdate { task_id, status }).await.is_err() {
        warn!(%task_id, "Agent runtime gone, dropping callback");
    }
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

/// Bind the callback listener. Runs for the life of the agent process,
/// across orchestrator reconnects.
pub async fn spawn_callback_listener(
    addr: &str,
    tx: mpsc::Sender<StatusUpdate>,
) -> std::io::Result<JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Status callback listener started");
    let app = callback_routes(tx);
    Ok(tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn callback_forwards_status_updates() {
        let (tx, mut rx) = mpsc::channel(8);
        let app = callback_routes(tx);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let task_id = Uuid::new_v4();
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://{addr}/callback/{task_id}"))
            .json(&serde_json::json!({"pct": 60, "note": "parsing"}))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());

        let update = rx.recv().await.unwrap();
        assert_eq!(update.task_id, task_id);
        assert_eq!(update.status["pct"], 60);
    }

    #[tokio::test]
    async fn callback_rejects_bad_task_id() {
        let (tx, _rx) = mpsc::channel(8);
        let app = callback_routes(tx);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://{addr}/callback/not-a-uuid"))
            .json(&serde_json::json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    }
}
