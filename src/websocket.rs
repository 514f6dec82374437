//! Delegate websocket stream
//!
//! A connected delegate receives the dispatch events addressed to it and can
//! send heartbeats, acquire requests, validation reports and task responses
//! over the same socket.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use uuid::Uuid;

use crate::delegate::ConnectionHeartbeat;
use crate::dispatch::{AcquireOutcome, DispatchEvent, PendingTaskEvent};
use crate::error::{AppError, Result};
use crate::task::{ConnectionCheck, DelegateTask, DelegateTaskResponse};
use crate::AppState;

/// WebSocket handler. Unknown delegates are rejected before the upgrade.
pub async fn handler(
    ws: WebSocketUpgrade,
    Path((account, delegate_id)): Path<(String, Uuid)>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse> {
    state.registry.get(&account, delegate_id).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, account, delegate_id)))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, account: String, delegate_id: Uuid) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = BroadcastStream::new(state.coordinator.subscribe());

    tracing::info!(%delegate_id, %account, "Delegate stream connected");
    if let Err(e) = send(&mut sender, &ServerMessage::Connected { delegate_id }).await {
        tracing::error!("Failed to send connected: {}", e);
        return;
    }

    loop {
        tokio::select! {
            msg = receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                };

                let reply = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => handle_client_message(&state, &account, delegate_id, client_msg)
                        .await
                        .unwrap_or_else(|e| ServerMessage::Error { message: e.to_string() }),
                    Err(e) => ServerMessage::Error {
                        message: format!("Invalid message: {}", e),
                    },
                };

                if let Err(e) = send(&mut sender, &reply).await {
                    tracing::error!("Failed to send reply: {}", e);
                    break;
                }
            }
            event = events.next() => {
                let event = match event {
                    Some(Ok(event)) => event,
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        tracing::warn!(%delegate_id, skipped, "Delegate stream lagged behind dispatch events");
                        continue;
                    }
                    None => break,
                };
                if !event.concerns_delegate(&account, delegate_id) {
                    continue;
                }
                if let Err(e) = send(&mut sender, &ServerMessage::Dispatch { event }).await {
                    tracing::error!("Failed to push dispatch event: {}", e);
                    break;
                }
            }
        }
    }

    tracing::info!(%delegate_id, "Delegate stream disconnected");
}

async fn handle_client_message(
    state: &AppState,
    account: &str,
    delegate_id: Uuid,
    msg: ClientMessage,
) -> Result<ServerMessage> {
    match msg {
        ClientMessage::Heartbeat {
            connection_id,
            version,
        } => {
            let connection = state
                .registry
                .register_heartbeat(
                    account,
                    delegate_id,
                    ConnectionHeartbeat {
                        connection_id,
                        version,
                    },
                )
                .await?;
            Ok(ServerMessage::HeartbeatAck {
                connection_id: connection.id,
            })
        }
        ClientMessage::Poll => {
            let tasks = state
                .coordinator
                .pending_task_events(account, delegate_id)
                .await?;
            Ok(ServerMessage::Pending { tasks })
        }
        ClientMessage::Acquire { task_id } => {
            let outcome = state
                .coordinator
                .acquire_delegate_task(account, delegate_id, task_id)
                .await?;
            Ok(ServerMessage::Acquired { task_id, outcome })
        }
        ClientMessage::Validation { task_id, results } => {
            let task = state
                .coordinator
                .report_connection_results(account, delegate_id, task_id, &results)
                .await?;
            Ok(ServerMessage::ValidationRecorded { task_id, task })
        }
        ClientMessage::Response { task_id, response } => {
            state
                .coordinator
                .process_delegate_response(account, delegate_id, task_id, response)
                .await?;
            Ok(ServerMessage::ResponseAccepted { task_id })
        }
    }
}

async fn send(sender: &mut SplitSink<WebSocket, Message>, msg: &ServerMessage) -> Result<()> {
    let text = serde_json::to_string(msg)?;
    sender
        .send(Message::Text(text))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))
}

/// Messages from delegate to server
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Heartbeat {
        connection_id: Uuid,
        #[serde(default)]
        version: String,
    },
    /// List queued tasks this delegate could take
    Poll,
    Acquire {
        task_id: Uuid,
    },
    /// Connectivity results for a task in validation
    Validation {
        task_id: Uuid,
        results: Vec<ConnectionCheck>,
    },
    Response {
        task_id: Uuid,
        response: DelegateTaskResponse,
    },
}

/// Messages from server to delegate
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        delegate_id: Uuid,
    },
    /// A dispatch event addressed to this delegate
    Dispatch {
        event: DispatchEvent,
    },
    HeartbeatAck {
        connection_id: Uuid,
    },
    Pending {
        tasks: Vec<PendingTaskEvent>,
    },
    /// `outcome` is absent when the task is no longer available
    Acquired {
        task_id: Uuid,
        outcome: Option<AcquireOutcome>,
    },
    ValidationRecorded {
        task_id: Uuid,
        task: Option<DelegateTask>,
    },
    ResponseAccepted {
        task_id: Uuid,
    },
    Error {
        message: String,
    },
}
