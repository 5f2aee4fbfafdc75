use super::connection::{PeerConnector, RemoteTrack};
use super::link::{IceRestartPolicy, LinkCommand, LinkContext, LinkHandle, NegotiationState};
use crate::media::{LocalMediaHandle, MediaKind};
use meshcall_protocol::{ClientMessage, ParticipantId, ServerMessage};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};

/// What the call surface gets to see
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    PeerJoined(ParticipantId),
    RemoteTrack {
        from: ParticipantId,
        kind: MediaKind,
    },
    PeerFailed(ParticipantId),
    PeerLeft(ParticipantId),
}

/// Inbound media of one remote participant
#[derive(Debug, Clone, Default)]
pub struct RemoteStream {
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn has_audio(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == MediaKind::Audio)
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == MediaKind::Video)
    }
}

/// Maintains one link per remote participant of the current room.
///
/// Every relay message enters through [`PeerOrchestrator::handle`] and is
/// forwarded to the link of its sender, which negotiates in its own task.
/// The joiner offers to everyone already in the room; existing members
/// wait for the joiner's offer.
pub struct PeerOrchestrator {
    ctx: Arc<LinkContext>,
    links: HashMap<ParticipantId, LinkHandle>,
    streams: Arc<RwLock<BTreeMap<ParticipantId, RemoteStream>>>,
}

impl PeerOrchestrator {
    pub fn new(
        local_id: ParticipantId,
        connector: Arc<dyn PeerConnector>,
        media: Arc<LocalMediaHandle>,
        signaling: mpsc::UnboundedSender<ClientMessage>,
        ice_restart: IceRestartPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let streams = Arc::new(RwLock::new(BTreeMap::new()));
        let ctx = Arc::new(LinkContext {
            local_id,
            connector,
            media,
            signaling,
            streams: streams.clone(),
            events,
            ice_restart,
        });

        (
            Self {
                ctx,
                links: HashMap::new(),
                streams,
            },
            events_rx,
        )
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.ctx.local_id
    }

    pub async fn handle(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::RoomUsers(users) => {
                tracing::info!("Room has {} other participants", users.len());
                for user in users {
                    if &user == self.local_id() {
                        continue;
                    }
                    self.forward(&user, LinkCommand::Initiate);
                }
            }
            ServerMessage::UserJoined(user) => {
                if &user != self.local_id() {
                    tracing::info!("{} joined, waiting for their offer", user);
                    self.link(&user);
                }
            }
            ServerMessage::UserLeft(user) => self.remove_peer(&user).await,
            ServerMessage::Offer { from, offer } => {
                self.forward(&from, LinkCommand::RemoteOffer(offer));
            }
            ServerMessage::Answer { from, answer } => {
                self.forward_existing(&from, LinkCommand::RemoteAnswer(answer));
            }
            ServerMessage::IceCandidate { from, candidate } => {
                self.forward_existing(&from, LinkCommand::RemoteCandidate(candidate));
            }
            ServerMessage::Connected(id) => {
                tracing::debug!("Ignoring repeated greeting for {}", id);
            }
            ServerMessage::Pong => {
                // Heartbeat response
            }
        }
    }

    fn link(&mut self, remote_id: &ParticipantId) -> &LinkHandle {
        match self.links.entry(remote_id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let _ = self.ctx.events.send(CallEvent::PeerJoined(remote_id.clone()));
                entry.insert(LinkHandle::spawn(self.ctx.clone(), remote_id.clone()))
            }
        }
    }

    fn forward(&mut self, remote_id: &ParticipantId, command: LinkCommand) {
        if !self.link(remote_id).send(command) {
            tracing::warn!("Link to {} is gone, dropping message", remote_id);
        }
    }

    fn forward_existing(&mut self, remote_id: &ParticipantId, command: LinkCommand) {
        match self.links.get(remote_id) {
            Some(link) => {
                if !link.send(command) {
                    tracing::warn!("Link to {} is gone, dropping message", remote_id);
                }
            }
            None => tracing::warn!("Dropping {:?} from unknown participant {}", command, remote_id),
        }
    }

    /// Close the link to `remote_id` and forget its media
    pub async fn remove_peer(&mut self, remote_id: &ParticipantId) {
        let Some(link) = self.links.remove(remote_id) else {
            tracing::debug!("No link to {}", remote_id);
            return;
        };

        link.close().await;
        self.streams.write().await.remove(remote_id);
        let _ = self.ctx.events.send(CallEvent::PeerLeft(remote_id.clone()));
        tracing::info!("{} left, {} peers remain", remote_id, self.links.len());
    }

    /// Close every link, waiting for each connection to shut down
    pub async fn close_all(&mut self) {
        let links: Vec<_> = self.links.drain().collect();
        for (remote_id, link) in links {
            link.close().await;
            tracing::debug!("Closed link to {}", remote_id);
        }
        self.streams.write().await.clear();
    }

    /// Remote participants with a link, in id order
    pub fn peers(&self) -> Vec<ParticipantId> {
        let mut peers: Vec<_> = self.links.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn peer_count(&self) -> usize {
        self.links.len()
    }

    pub fn link_state(&self, remote_id: &ParticipantId) -> Option<NegotiationState> {
        self.links.get(remote_id).map(LinkHandle::state)
    }

    pub fn watch_link(&self, remote_id: &ParticipantId) -> Option<watch::Receiver<NegotiationState>> {
        self.links.get(remote_id).map(LinkHandle::watch)
    }

    /// Received media keyed by participant, for presentation
    pub async fn remote_streams(&self) -> BTreeMap<ParticipantId, RemoteStream> {
        self.streams.read().await.clone()
    }
}
