//! Worker agent runtime.
//!
//! Connects to the orchestrator, registers its capability, heartbeats on a
//! fixed cadence, and executes one assigned task at a time through the
//! local scraper. The connect loop retries forever with a fixed delay —
//! the agent is useless without a connection, so it never gives up.

use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::scraper::{self, ScraperClient, StatusUpdate};
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::protocol::{AgentMessage, ServerMessage};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// How long to wait for `register_ack` before tearing the connection down.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Outgoing frame queue depth (task results and busy-rejections).
const OUT_CAPACITY: usize = 64;

/// The in-flight assignment, if any. One at a time by design.
struct CurrentTask {
    task_id: Uuid,
    handle: JoinHandle<()>,
}

pub struct AgentRuntime {
    config: AgentConfig,
    scraper: ScraperClient,
}

impl AgentRuntime {
    pub fn new(config: AgentConfig) -> Self {
        let scraper = ScraperClient::new(config.scraper_url.clone(), config.scrape_timeout);
        Self { config, scraper }
    }

    /// Run the agent until the process is killed. Returns early only if
    /// the local callback listener cannot bind.
    pub async fn run(self) -> std::io::Result<()> {
        let (status_tx, mut status_rx) = mpsc::channel::<StatusUpdate>(256);
        let _listener =
            scraper::spawn_callback_listener(&self.config.callback_addr, status_tx).await?;

        loop {
            match self.run_connection(&mut status_rx).await {
                Ok(()) => info!("Connection ended cleanly"),
                Err(e) => warn!(error = %e, "Connection ended"),
            }
            info!(delay = ?self.config.reconnect_delay, "Reconnecting to orchestrator");
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }

    /// One connection lifetime: connect, register, then pump frames until
    /// something breaks.
    async fn run_connection(&self, status_rx: &mut mpsc::Receiver<StatusUpdate>) -> Result<()> {
        info!(url = %self.config.orchestrator_url, "Connecting to orchestrator");
        let (ws, _response) = connect_async(self.config.orchestrator_url.as_str())
            .await
            .map_err(|e| AgentError::ConnectionLost(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        self.register(&mut sink, &mut stream).await?;

        let mut current: Option<CurrentTask> = None;
        let result = self
            .connection_loop(&mut sink, &mut stream, status_rx, &mut current)
            .await;

        // The orchestrator requeues our in-flight task the moment it sees
        // us gone; a result we produce now has nowhere to go.
        if let Some(task) = current.take() {
            warn!(task_id = %task.task_id, "Abandoning in-flight task on disconnect");
            task.handle.abort();
        }
        result
    }

    async fn register(&self, sink: &mut WsSink, stream: &mut WsStream) -> Result<()> {
        let register = AgentMessage::Register {
            capability: self.config.capability,
            token: self.config.token.expose_secret().to_string(),
            display_name: self.config.display_name.clone(),
        };
        send_frame(sink, &register).await?;

        let frame = timeout(ACK_TIMEOUT, stream.next())
            .await
            .map_err(|_| AgentError::ConnectionLost("register_ack timed out".into()))?;

        match frame {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::RegisterAck { worker_id }) => {
                    info!(%worker_id, capability = %self.config.capability, "Registered");
                    Ok(())
                }
                Ok(ServerMessage::RegisterReject { reason }) => {
                    Err(AgentError::Rejected { reason }.into())
                }
                _ => Err(AgentError::ConnectionLost(
                    "unexpected frame before register_ack".into(),
                )
                .into()),
            },
            Some(Ok(Message::Close(_))) | None => {
                Err(AgentError::ConnectionLost("closed during registration".into()).into())
            }
            Some(Err(e)) => Err(AgentError::ConnectionLost(e.to_string()).into()),
            _ => Err(AgentError::ConnectionLost(
                "unexpected frame before register_ack".into(),
            )
            .into()),
        }
    }

    async fn connection_loop(
        &self,
        sink: &mut WsSink,
        stream: &mut WsStream,
        status_rx: &mut mpsc::Receiver<StatusUpdate>,
        current: &mut Option<CurrentTask>,
    ) -> Result<()> {
        let (out_tx, mut out_rx) = mpsc::channel::<AgentMessage>(OUT_CAPACITY);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        // Tracks the last task we sent a terminal report for, so a cancel
        // racing a finished scrape cannot put two results on the wire.
        let mut reported: Option<Uuid> = None;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    send_frame(sink, &AgentMessage::Heartbeat { timestamp: Utc::now() }).await?;
                }

                Some(msg) = out_rx.recv() => {
                    if first_terminal_report(&mut reported, &msg) {
                        send_frame(sink, &msg).await?;
                    } else {
                        debug!("Suppressing duplicate terminal report");
                    }
                }

                // Progress pushed by the local scraper.
                Some(update) = status_rx.recv() => {
                    send_frame(sink, &AgentMessage::TaskStatus {
                        task_id: update.task_id,
                        status: update.status,
                    })
                    .await?;
                }

                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_server_frame(&text, current, &out_tx).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            sink.send(Message::Pong(data))
                                .await
                                .map_err(|e| AgentError::ConnectionLost(e.to_string()))?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(AgentError::ConnectionLost(
                                "closed by orchestrator".into(),
                            )
                            .into());
                        }
                        Some(Err(e)) => {
                            return Err(AgentError::ConnectionLost(e.to_string()).into());
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn handle_server_frame(
        &self,
        text: &str,
        current: &mut Option<CurrentTask>,
        out_tx: &mpsc::Sender<AgentMessage>,
    ) {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(ServerMessage::TaskAssign { task_id, payload }) => {
                if current.as_ref().is_some_and(|t| !t.handle.is_finished()) {
                    // The orchestrator should never double-book us; refuse
                    // rather than silently dropping the assignment.
                    warn!(%task_id, "Assigned while busy, refusing");
                    let _ = out_tx
                        .send(AgentMessage::TaskResult {
                            task_id,
                            success: false,
                            result: None,
                            error: Some("agent already busy".into()),
                        })
                        .await;
                    return;
                }

                info!(%task_id, "Task assigned");
                let scraper = self.scraper.clone();
                let callback_url =
                    format!("http://{}/callback/{}", self.config.callback_addr, task_id);
                let out = out_tx.clone();
                let handle = tokio::spawn(async move {
                    let msg = match scraper.run(task_id, payload, callback_url).await {
                        Ok(result) => {
                            info!(%task_id, "Scrape finished");
                            AgentMessage::TaskResult {
                                task_id,
                                success: true,
                                result: Some(result),
                                error: None,
                            }
                        }
                        Err(e) => {
                            warn!(%task_id, error = %e, "Scrape failed");
                            AgentMessage::TaskResult {
                                task_id,
                                success: false,
                                result: None,
                                error: Some(e.to_string()),
                            }
                        }
                    };
                    let _ = out.send(msg).await;
                });
                *current = Some(CurrentTask { task_id, handle });
            }

            Ok(ServerMessage::TaskCancel { task_id }) => {
                match current.take() {
                    Some(task) if task.task_id == task_id && !task.handle.is_finished() => {
                        info!(%task_id, "Cancelling in-flight task");
                        task.handle.abort();
                        let _ = out_tx
                            .send(AgentMessage::TaskResult {
                                task_id,
                                success: false,
                                result: None,
                                error: Some("cancelled by requester".into()),
                            })
                            .await;
                    }
                    other => {
                        debug!(%task_id, "Cancel for task not in flight");
                        *current = other;
                    }
                }
            }

            Ok(other) => {
                debug!(frame = ?other, "Unexpected frame from orchestrator");
            }
            Err(e) => {
                debug!(error = %e, text, "Unrecognized frame from orchestrator");
            }
        }
    }
}

async fn send_frame(sink: &mut WsSink, msg: &AgentMessage) -> Result<()> {
    let json =
        serde_json::to_string(msg).map_err(|e| AgentError::ConnectionLost(e.to_string()))?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|e| AgentError::ConnectionLost(e.to_string()))?;
    Ok(())
}

/// True when this frame may go on the wire. The first terminal report for
/// a task wins; any later one for the same task is dropped, keeping the
/// one-result-per-assignment rule even when a cancel races completion.
fn first_terminal_report(reported: &mut Option<Uuid>, msg: &AgentMessage) -> bool {
    match msg {
        AgentMessage::TaskResult { task_id, .. } => {
            if *reported == Some(*task_id) {
                return false;
            }
            *reported = Some(*task_id);
            true
        }
        _ => true,
    }
}
