#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{ClientMessage, ServerMessage};
use crate::metrics::ServerMetrics;
use crate::room::RoomCoordinator;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client. Messages queued beyond this are
/// stale — drop them early.
const CHANNEL_CAPACITY: usize = 64;

/// Idle timeout — close connection if no message received within this duration.
/// Prevents Slowloris-style attacks that hold semaphore permits indefinitely.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300); // 5 minutes

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

const MAX_NAME_LEN: usize = 64;
const MAX_CHAT_LEN: usize = 4096;

/// Serialize a ServerMessage and send it through the channel as pre-serialized JSON.
fn send_json(sender: &mpsc::Sender<Arc<String>>, msg: &ServerMessage) -> anyhow::Result<()> {
    let json = Arc::new(serde_json::to_string(msg)?);
    sender.try_send(json).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Handles a single WebSocket connection. The ban check already ran in the
/// upgrade path — by the time we get here the peer is admissible.
pub async fn handle_connection(
    socket: WebSocket,
    coordinator: Arc<RoomCoordinator>,
    metrics: ServerMetrics,
    addr: SocketAddr,
    device_id: String,
    _permit: OwnedSemaphorePermit,
) {
    let user_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {} from {}", user_id, addr.ip());

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let user_id_clone = user_id.clone();
    let send_metrics = metrics.clone();

    // Spawn task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_messages_sent();
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for user: {}", user_id_clone);
    });

    // Whether the join handshake has completed
    let mut joined = false;

    // Token bucket rate limiter state
    let mut tokens_us: u64 = MAX_TOKENS_US;
    let mut last_refill = Instant::now();
    let mut rate_limit_warned = false;

    loop {
        // Idle timeout: close connection if no message within IDLE_TIMEOUT
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for user {}", user_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_messages_received();

                // Token bucket rate limiting
                let now = Instant::now();
                let elapsed_us = now.duration_since(last_refill).as_micros() as u64;
                last_refill = now;
                tokens_us = (tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);

                if tokens_us >= TOKEN_US {
                    tokens_us -= TOKEN_US;
                    rate_limit_warned = false;
                } else {
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded for user {}", user_id);
                        let _ = send_json(&tx, &ServerMessage::Error {
                            message: format!("Rate limit exceeded: max {} messages/second", RATE_LIMIT_REFILL_RATE),
                        });
                    }
                    continue;
                }

                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => {
                        let start = Instant::now();
                        let result = handle_client_message(
                            &client_msg,
                            &user_id,
                            &mut joined,
                            &tx,
                            &coordinator,
                            addr,
                            &device_id,
                        )
                        .await;
                        metrics.observe_message_handling(start.elapsed());

                        if let Err(e) = result {
                            error!("Error handling message from {}: {}", user_id, e);
                            metrics.inc_errors();
                            // If channel is closed, send task has exited — break
                            if tx.is_closed() {
                                break;
                            }
                            let _ = send_json(&tx, &ServerMessage::Error { message: format!("{e}") });
                        }
                    }
                    Err(e) => {
                        warn!("Invalid message format from {}: {}", user_id, e);
                        metrics.inc_errors();
                        let _ = send_json(&tx, &ServerMessage::Error {
                            message: format!("Invalid message format: {e}"),
                        });
                    }
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", user_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            _ => {
                warn!("Unexpected message type from client {}", user_id);
            }
        }
    }

    // Disconnect cleanup runs in the same processing step: the speaking
    // slot is released and queues are purged before the handler returns.
    if joined {
        coordinator.disconnect(&user_id).await;
    }

    // _conn_guard dropped here → dec_connections_active
    // _permit dropped here → release semaphore

    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished for user: {}", user_id);
}

/// Handle a single client message
async fn handle_client_message(
    message: &ClientMessage,
    user_id: &str,
    joined: &mut bool,
    sender: &mpsc::Sender<Arc<String>>,
    coordinator: &Arc<RoomCoordinator>,
    addr: SocketAddr,
    device_id: &str,
) -> anyhow::Result<()> {
    match message {
        ClientMessage::Join { name, password, avatar } => {
            if *joined {
                anyhow::bail!("Already joined");
            }
            if name.is_empty() || name.len() > MAX_NAME_LEN {
                anyhow::bail!("Invalid name: must be 1-{MAX_NAME_LEN} characters");
            }

            let snapshot = coordinator
                .join(
                    user_id,
                    name,
                    password.as_deref(),
                    avatar.clone(),
                    addr.ip().to_string(),
                    device_id.to_string(),
                    sender.clone(),
                )
                .await?;
            *joined = true;

            send_json(sender, &ServerMessage::Joined {
                user_id: user_id.to_string(),
                snapshot,
            })?;
        }

        ClientMessage::Leave => {
            if *joined {
                coordinator.disconnect(user_id).await;
                *joined = false;
            }
        }

        ClientMessage::ChatMessage { text, reply_to } => {
            if text.is_empty() || text.len() > MAX_CHAT_LEN {
                anyhow::bail!("Invalid chat message: must be 1-{MAX_CHAT_LEN} characters");
            }
            coordinator.chat(user_id, text.clone(), reply_to.clone()).await?;
        }

        ClientMessage::RequestSpeak => {
            coordinator.request_speak(user_id).await?;
        }

        ClientMessage::ReleaseSpeak => {
            coordinator.release_speak(user_id).await?;
        }

        ClientMessage::ForceRelease { target_id } => {
            coordinator.force_release(user_id, target_id).await?;
        }

        ClientMessage::ApproveSpeak { target_id } => {
            coordinator.approve_speak(user_id, target_id).await?;
        }

        ClientMessage::RejectSpeak { target_id } => {
            coordinator.reject_speak(user_id, target_id).await?;
        }

        ClientMessage::SetRole { target_id, role } => {
            coordinator.set_role(user_id, target_id, *role).await?;
        }

        ClientMessage::SetMute { target_id, muted } => {
            coordinator.set_mute(user_id, target_id, *muted).await?;
        }

        ClientMessage::Kick { target_id } => {
            coordinator.kick(user_id, target_id).await?;
        }

        ClientMessage::Ban { target_id } => {
            coordinator.ban(user_id, target_id).await?;
        }

        ClientMessage::Unban { address, device_id } => {
            coordinator
                .unban(user_id, address.as_deref(), device_id.as_deref())
                .await?;
        }

        ClientMessage::SetRoomLock { locked } => {
            coordinator.set_room_lock(user_id, *locked).await?;
        }

        ClientMessage::SetManualApproval { enabled } => {
            coordinator.set_manual_approval(user_id, *enabled).await?;
        }

        ClientMessage::UpdateSettings { color, font_size, avatar } => {
            coordinator
                .update_settings(user_id, color.clone(), font_size.clone(), avatar.clone())
                .await?;
        }

        ClientMessage::GetPermissions => {
            coordinator.send_permissions(user_id).await;
        }

        ClientMessage::UpdatePermissions { permissions } => {
            coordinator.update_permissions(user_id, permissions.clone()).await?;
        }
    }

    Ok(())
}
