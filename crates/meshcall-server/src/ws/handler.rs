use crate::relay::Relay;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use meshcall_protocol::ParticipantId;
use std::sync::Arc;
use tokio::sync::mpsc;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Runs relay cleanup for a connection exactly once.
///
/// The normal path awaits [`ConnectionGuard::release`]; if the connection
/// task unwinds instead, `Drop` schedules the same cleanup on the runtime.
struct ConnectionGuard {
    relay: Arc<Relay>,
    participant_id: Option<ParticipantId>,
}

impl ConnectionGuard {
    fn new(relay: Arc<Relay>, participant_id: ParticipantId) -> Self {
        Self {
            relay,
            participant_id: Some(participant_id),
        }
    }

    async fn release(mut self) {
        if let Some(participant_id) = self.participant_id.take() {
            self.relay.disconnect(&participant_id).await;
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let Some(participant_id) = self.participant_id.take() else {
            return;
        };
        let relay = self.relay.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    relay.disconnect(&participant_id).await;
                });
            }
            Err(_) => {
                tracing::error!("No runtime to clean up connection {}", participant_id);
            }
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Create channel for outbound messages
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Register with the relay; the greeting carrying the session id is queued first
    let participant_id = state.relay.connect(tx).await;
    let guard = ConnectionGuard::new(state.relay.clone(), participant_id.clone());

    // Spawn task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Handle incoming messages
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Err(e) = state.relay.handle_text(&participant_id, text.as_str()).await {
                    tracing::warn!("Dropped message from {}: {}", participant_id, e);
                }
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::error!("WebSocket error for {}: {}", participant_id, e);
                break;
            }
            // Pings are answered by axum itself
            _ => {}
        }
    }

    // Cleanup on disconnect
    guard.release().await;

    // Abort the send task
    send_task.abort();
}
