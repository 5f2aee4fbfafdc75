use meshcall_protocol::{ParticipantId, RawServerMessage};
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Room most recently joined on this connection
    pub current_room: Option<String>,
    pub connected_at: Instant,
}

/// Live relay connections, addressable by participant id
pub struct ConnectionManager {
    /// Map from participant ID to message sender channel
    senders: RwLock<HashMap<ParticipantId, mpsc::UnboundedSender<String>>>,
    /// Map from participant ID to connection info
    connection_info: RwLock<HashMap<ParticipantId, ConnectionInfo>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            connection_info: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_connection(
        &self,
        participant_id: ParticipantId,
        sender: mpsc::UnboundedSender<String>,
    ) {
        self.senders
            .write()
            .await
            .insert(participant_id.clone(), sender);

        self.connection_info.write().await.insert(
            participant_id.clone(),
            ConnectionInfo {
                current_room: None,
                connected_at: Instant::now(),
            },
        );

        tracing::debug!("Participant {} connected", participant_id);
    }

    pub async fn remove_connection(&self, participant_id: &ParticipantId) -> Option<ConnectionInfo> {
        let info = self.connection_info.write().await.remove(participant_id);
        self.senders.write().await.remove(participant_id);

        if let Some(info) = &info {
            tracing::debug!(
                "Participant {} disconnected after {:?}",
                participant_id,
                info.connected_at.elapsed()
            );
        }

        info
    }

    /// Record the room a connection joined. Returns false for unknown connections.
    pub async fn set_current_room(&self, participant_id: &ParticipantId, room: &str) -> bool {
        match self.connection_info.write().await.get_mut(participant_id) {
            Some(info) => {
                info.current_room = Some(room.to_string());
                true
            }
            None => false,
        }
    }

    pub async fn take_current_room(&self, participant_id: &ParticipantId) -> Option<String> {
        self.connection_info
            .write()
            .await
            .get_mut(participant_id)
            .and_then(|info| info.current_room.take())
    }

    /// Send to a single connection. Returns false if no such connection exists.
    pub async fn send_to_connection(
        &self,
        participant_id: &ParticipantId,
        message: &RawServerMessage,
    ) -> bool {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return false;
            }
        };

        let senders = self.senders.read().await;

        match senders.get(participant_id) {
            Some(sender) => {
                if let Err(e) = sender.send(json) {
                    tracing::error!("Failed to send message to {}: {}", participant_id, e);
                    return false;
                }
                true
            }
            None => false,
        }
    }

    pub async fn broadcast(&self, recipients: &[ParticipantId], message: &RawServerMessage) {
        if recipients.is_empty() {
            return;
        }

        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return;
            }
        };

        let senders = self.senders.read().await;

        tracing::debug!("Broadcasting to {} participants", recipients.len());
        for participant_id in recipients {
            if let Some(sender) = senders.get(participant_id) {
                if let Err(e) = sender.send(json.clone()) {
                    tracing::error!("Failed to send message to {}: {}", participant_id, e);
                }
            }
        }
    }

    pub async fn is_connected(&self, participant_id: &ParticipantId) -> bool {
        self.senders.read().await.contains_key(participant_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.senders.read().await.len()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
