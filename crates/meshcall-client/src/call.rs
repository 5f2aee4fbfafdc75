//! One participant's session in a room

use crate::media::{LocalMediaBootstrap, LocalMediaHandle, MediaDevices, MediaError};
use crate::network::{SignalingClient, SignalingError};
use crate::peer::{CallEvent, PeerConnector, PeerOrchestrator};
use crate::state::Settings;
use meshcall_protocol::{ParticipantId, ServerMessage};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct Call {
    room_id: String,
    signaling: SignalingClient,
    inbound: mpsc::UnboundedReceiver<ServerMessage>,
    orchestrator: PeerOrchestrator,
    events: mpsc::UnboundedReceiver<CallEvent>,
    media: Arc<LocalMediaHandle>,
}

impl Call {
    /// Open local media, connect to the relay and join `room_id`
    pub async fn start(
        settings: &Settings,
        room_id: &str,
        connector: Arc<dyn PeerConnector>,
        devices: Arc<dyn MediaDevices>,
    ) -> anyhow::Result<Self> {
        let media = Arc::new(acquire_media(devices, settings.continue_without_media).await?);

        let (signaling, inbound) = SignalingClient::connect(&settings.signaling_url).await?;
        let (orchestrator, events) = PeerOrchestrator::new(
            signaling.id().clone(),
            connector,
            media.clone(),
            signaling.sender(),
            settings.ice_restart_policy(),
        );

        signaling.join_room(room_id)?;

        Ok(Self {
            room_id: room_id.to_string(),
            signaling,
            inbound,
            orchestrator,
            events,
            media,
        })
    }

    pub fn local_id(&self) -> &ParticipantId {
        self.signaling.id()
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn media(&self) -> &LocalMediaHandle {
        &self.media
    }

    pub fn orchestrator(&self) -> &PeerOrchestrator {
        &self.orchestrator
    }

    /// Feed relay messages to the orchestrator until `shutdown` resolves.
    /// Fails if the relay connection drops first.
    pub async fn run_until<F: Future>(&mut self, shutdown: F) -> Result<(), SignalingError> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => return Ok(()),
                message = self.inbound.recv() => match message {
                    Some(message) => self.orchestrator.handle(message).await,
                    None => {
                        tracing::error!("Lost connection to the relay");
                        return Err(SignalingError::Closed);
                    }
                },
                Some(event) = self.events.recv() => log_event(&event),
            }
        }
    }

    /// Close every link, leave the room, disconnect and release the devices
    pub async fn end(mut self) {
        tracing::info!("Leaving room {}", self.room_id);
        self.orchestrator.close_all().await;
        if let Err(e) = self.signaling.leave_room() {
            tracing::debug!("Could not send leaveRoom: {}", e);
        }
        self.signaling.close().await;
        self.media.stop();
    }
}

fn log_event(event: &CallEvent) {
    match event {
        CallEvent::PeerJoined(id) => tracing::info!("Peer {} discovered", id),
        CallEvent::RemoteTrack { from, kind } => tracing::info!("Receiving {} from {}", kind, from),
        CallEvent::PeerFailed(id) => tracing::warn!("Connection to {} failed", id),
        CallEvent::PeerLeft(id) => tracing::info!("Peer {} left", id),
    }
}

/// Run the capture fallback. With `continue_without_media` a total failure
/// yields an empty handle instead of an error.
pub async fn acquire_media(
    devices: Arc<dyn MediaDevices>,
    continue_without_media: bool,
) -> Result<LocalMediaHandle, MediaError> {
    match LocalMediaBootstrap::new(devices).acquire().await {
        Ok(handle) => Ok(handle),
        Err(e) if continue_without_media => {
            tracing::warn!("Joining without local media: {}. {}", e, e.guidance());
            Ok(LocalMediaHandle::empty())
        }
        Err(e) => {
            tracing::error!("{}", e.guidance());
            Err(e)
        }
    }
}
