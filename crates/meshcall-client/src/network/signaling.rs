use futures_util::{SinkExt, Stream, StreamExt};
use meshcall_protocol::{ClientMessage, ParticipantId, ServerMessage};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const GREETING_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("invalid relay message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("relay closed the connection before greeting")]
    ClosedBeforeGreeting,

    #[error("expected a connected greeting, got {0:?}")]
    UnexpectedGreeting(ServerMessage),

    #[error("timed out waiting for the relay greeting")]
    Timeout,

    #[error("relay connection is closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for SignalingError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SignalingError::WebSocket(Box::new(e))
    }
}

/// Connection to the signaling relay.
///
/// Outbound messages go through an unbounded channel drained by a writer
/// task; inbound messages are decoded by a reader task and handed to the
/// receiver returned from [`SignalingClient::connect`]. The receiver yields
/// `None` once the relay goes away.
pub struct SignalingClient {
    id: ParticipantId,
    sender: mpsc::UnboundedSender<ClientMessage>,
    close_tx: Option<oneshot::Sender<()>>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    pinger: JoinHandle<()>,
}

impl SignalingClient {
    pub async fn connect(
        url: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerMessage>), SignalingError> {
        let (ws_stream, _) = connect_async(url).await?;

        let (mut write, mut read) = ws_stream.split();

        // The relay speaks first with our session id
        let id = tokio::time::timeout(GREETING_TIMEOUT, read_greeting(&mut read))
            .await
            .map_err(|_| SignalingError::Timeout)??;

        tracing::info!("Connected to relay at {} as {}", url, id);

        // Create channel for sending messages
        let (tx, mut rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (close_tx, mut close_rx) = oneshot::channel::<()>();

        // Spawn task to handle outgoing messages; queued messages drain before close
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    msg = rx.recv() => {
                        let Some(msg) = msg else { break };
                        let json = match serde_json::to_string(&msg) {
                            Ok(j) => j,
                            Err(e) => {
                                tracing::error!("Failed to serialize message: {}", e);
                                continue;
                            }
                        };

                        if write.send(Message::Text(json.into())).await.is_err() {
                            tracing::error!("Failed to send WebSocket message");
                            break;
                        }
                    }
                    _ = &mut close_rx => break,
                }
            }
            let _ = write.close().await;
        });

        // Spawn task to handle incoming messages
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let reader = tokio::spawn(async move {
            while let Some(result) = read.next().await {
                match result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerMessage>(text.as_str()) {
                            Ok(msg) => {
                                if inbound_tx.send(msg).is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::warn!("Ignoring relay message: {}", e),
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    // Pong is handled automatically by tungstenite
                    _ => {}
                }
            }
        });

        // Start ping task
        let tx_ping = tx.clone();
        let pinger = tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if tx_ping.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        Ok((
            Self {
                id,
                sender: tx,
                close_tx: Some(close_tx),
                writer,
                reader,
                pinger,
            },
            inbound_rx,
        ))
    }

    /// Session id the relay assigned to this connection
    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    /// A cloneable handle for sending to the relay
    pub fn sender(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.sender.clone()
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        self.sender.send(message).map_err(|_| SignalingError::Closed)
    }

    pub fn join_room(&self, room_id: &str) -> Result<(), SignalingError> {
        tracing::info!("Joining room {}", room_id);
        self.send(ClientMessage::JoinRoom(room_id.to_string()))
    }

    pub fn leave_room(&self) -> Result<(), SignalingError> {
        self.send(ClientMessage::LeaveRoom)
    }

    /// Flush queued messages, then close the websocket
    pub async fn close(mut self) {
        self.pinger.abort();
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }
        if let Err(e) = (&mut self.writer).await {
            tracing::debug!("Signaling writer ended abnormally: {}", e);
        }
        self.reader.abort();
    }
}

async fn read_greeting<S>(read: &mut S) -> Result<ParticipantId, SignalingError>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                return match serde_json::from_str::<ServerMessage>(text.as_str())? {
                    ServerMessage::Connected(id) => Ok(id),
                    other => Err(SignalingError::UnexpectedGreeting(other)),
                };
            }
            Some(Ok(Message::Close(_))) | None => return Err(SignalingError::ClosedBeforeGreeting),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.pinger.abort();
        self.writer.abort();
        self.reader.abort();
    }
}
