//! Control WebSocket at `/ws`
//!
//! Each socket takes over the single control channel. Inbound text frames
//! are commands. Replies and robot-state notifications go out as JSON from
//! a separate writer task, so a notification reaches the UI as soon as it
//! is emitted, even while the command that caused it is still running.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{Sink, SinkExt, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::{dispatch, ClientCommand, ServerMessage};
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Command replies queued for the writer
const REPLY_QUEUE: usize = 32;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (sender, mut receiver) = socket.split();
    let channel = state.control.attach();
    let id = channel.id;
    info!("Control client {} connected", id);

    let (reply_tx, reply_rx) = mpsc::channel(REPLY_QUEUE);
    let done = CancellationToken::new();
    let initial = ServerMessage::RobotState {
        connected: state.robot.is_connected(),
    };
    let writer = tokio::spawn(write_loop(
        sender,
        initial,
        channel.rx,
        reply_rx,
        state.shutdown_signal(),
        done.clone(),
    ));

    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => route_text(&state, &text, &reply_tx).await,
                    Some(Ok(Message::Binary(_))) => {
                        debug!("Ignoring binary frame on control socket");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Control client {} disconnected", id);
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("Control socket receive error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    done.cancel();
    if let Err(e) = writer.await {
        warn!("Control socket writer ended abnormally: {}", e);
    }
    state.control.detach(id);
    debug!("Control socket {} exiting", id);
}

/// Run one inbound command and queue its reply.
///
/// Robot lifecycle commands run on their own task: offers and candidates
/// from the same socket keep being answered while a connect is pending.
async fn route_text(state: &Arc<AppState>, text: &str, replies: &mpsc::Sender<ServerMessage>) {
    let command = match ClientCommand::parse(text) {
        Ok(command) => command,
        Err(e) => {
            debug!("Rejected control message: {}", e);
            let _ = replies.send(ServerMessage::error(&e)).await;
            return;
        }
    };

    if command.is_robot_lifecycle() {
        let state = state.clone();
        let replies = replies.clone();
        tokio::spawn(async move {
            if let Some(reply) = dispatch(&state, command).await {
                let _ = replies.send(reply).await;
            }
        });
    } else if let Some(reply) = dispatch(state, command).await {
        let _ = replies.send(reply).await;
    }
}

/// Owns the outbound half of the socket until the client goes away, the
/// channel is taken over, or the server shuts down
async fn write_loop<S>(
    mut sink: S,
    initial: ServerMessage,
    mut notifications: mpsc::Receiver<ServerMessage>,
    mut replies: mpsc::Receiver<ServerMessage>,
    mut shutdown: broadcast::Receiver<()>,
    done: CancellationToken,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    if send_message(&mut sink, &initial).await.is_ok() {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                biased;

                _ = done.cancelled() => break,

                // Drained before replies: a command's effects precede its result
                notification = notifications.recv() => {
                    match notification {
                        Some(message) => {
                            let replaced = message == ServerMessage::SessionReplaced;
                            if send_message(&mut sink, &message).await.is_err() || replaced {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                reply = replies.recv() => {
                    match reply {
                        Some(message) => {
                            if send_message(&mut sink, &message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                _ = heartbeat.tick() => {
                    if sink.send(Message::Ping(vec![])).await.is_err() {
                        warn!("Failed to send ping, disconnecting");
                        break;
                    }
                }

                _ = shutdown.recv() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    done.cancel();
}

async fn send_message<S>(sink: &mut S, message: &ServerMessage) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let json = match message.to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize control message: {}", e);
            return Ok(());
        }
    };
    sink.send(Message::Text(json)).await.map_err(|e| {
        debug!("Control socket send failed: {}", e);
    })
}
