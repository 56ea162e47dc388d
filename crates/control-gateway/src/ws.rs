//! Agent WebSocket endpoint.
//!
//! `GET /ws?agentId=<id>` upgrades a registered agent into a duplex JSON
//! message stream. Outbound frames come from the router's connection queue;
//! inbound text frames are parsed as wire messages and handed back to the
//! router. Pongs reset the heartbeat counter; the router force-closes the
//! socket after three missed pongs.

use crate::api::AppState;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use orchestration_core::registry::HealthCheckResult;
use orchestration_core::router::OutboundFrame;
use orchestration_core::Message;
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(rename = "agentId")]
    pub agent_id: String,
}

pub async fn agent_socket(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let agent_id = params.agent_id;
    if state.orchestrator.registry().get(&agent_id).is_none() {
        return (
            StatusCode::UNAUTHORIZED,
            format!("agent {} is not registered", agent_id),
        )
            .into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, agent_id, state))
}

async fn handle_socket(socket: WebSocket, agent_id: String, state: AppState) {
    let router = state.orchestrator.router().clone();
    let mut frames = match router.connect(&agent_id) {
        Ok(frames) => frames,
        Err(e) => {
            warn!(agent_id = %agent_id, "connection rejected: {}", e);
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();

    // Outbound pump: router frames onto the socket.
    let writer_agent = agent_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let result = match frame {
                OutboundFrame::Message(message) => match serde_json::to_string(&message) {
                    Ok(json) => sink.send(WsMessage::Text(json)).await,
                    Err(e) => {
                        warn!(agent_id = %writer_agent, "outbound serialization failed: {}", e);
                        continue;
                    }
                },
                OutboundFrame::Ping => sink.send(WsMessage::Ping(Vec::new())).await,
                OutboundFrame::Close => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    // Inbound loop: wire messages and heartbeat pongs.
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                router.record_pong(&agent_id);
                match serde_json::from_str::<Message>(&text) {
                    Ok(message) => router.handle_incoming(&agent_id, message).await,
                    Err(e) => {
                        debug!(agent_id = %agent_id, "ignoring malformed frame: {}", e)
                    }
                }
            }
            Ok(WsMessage::Pong(_)) => {
                router.record_pong(&agent_id);
                // Pong cadence doubles as the health signal for agents the
                // HTTP probe loop cannot reach.
                state
                    .orchestrator
                    .registry()
                    .record_health_result(
                        &agent_id,
                        HealthCheckResult {
                            success: true,
                            response_time_ms: 0,
                            checked_at: Utc::now(),
                            error: None,
                        },
                    )
                    .await;
            }
            Ok(WsMessage::Ping(payload)) => {
                // The transport answers pings through the outbound queue to
                // keep a single writer on the socket.
                let _ = payload;
                router.record_pong(&agent_id);
            }
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(WsMessage::Binary(_)) => {
                debug!(agent_id = %agent_id, "binary frames are not part of the protocol")
            }
        }
    }

    router.disconnect(&agent_id);
    writer.abort();
    debug!(agent_id = %agent_id, "socket closed");
}
