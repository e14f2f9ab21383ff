//! Push video WebSocket at `/ws/video`
//!
//! Sends the newest JPEG as a binary frame whenever one is published. A
//! slow socket skips frames; a broken one ends only its own loop.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info};

use crate::state::AppState;

/// WebSocket upgrade handler
pub async fn video_ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_video_socket(socket, state))
}

async fn handle_video_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut subscriber = state.broadcaster.subscribe();
    let wait = state.config.get().stream.push_wait();
    let mut shutdown = state.shutdown_signal();
    let mut sent = 0u64;

    info!("Video push client connected");

    loop {
        tokio::select! {
            frame = subscriber.next_frame(wait) => {
                // Idle: nothing new, check again
                let Some(frame) = frame else { continue };
                if sender.send(Message::Binary(frame.data.to_vec())).await.is_err() {
                    debug!("Video push send failed, closing this socket");
                    break;
                }
                sent += 1;
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }

            _ = shutdown.recv() => break,
        }
    }

    info!("Video push client disconnected after {} frames", sent);
}
