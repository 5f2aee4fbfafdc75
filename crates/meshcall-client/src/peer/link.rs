use super::connection::{ConnectionEvent, ConnectionState, PeerConnection, PeerConnector, RemoteTrack};
use super::error::NegotiationError;
use super::orchestrator::{CallEvent, RemoteStream};
use crate::media::{LocalMediaHandle, MediaKind};
use meshcall_protocol::{ClientMessage, IceCandidate, ParticipantId, SessionDescription};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Where a link stands in the offer/answer exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferSent,
    OfferReceived,
    Connected,
    Failed,
    Closed,
}

/// How a link recovers from a failed transport.
///
/// The smaller id restarts ICE right away. The larger id gives it `grace`
/// to do so and then restarts on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IceRestartPolicy {
    /// Restarts attempted before giving up; reset once media flows again
    pub max_attempts: u32,
    pub grace: Duration,
}

impl Default for IceRestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
pub(crate) enum LinkCommand {
    /// Start negotiating as the offering side
    Initiate,
    RemoteOffer(SessionDescription),
    RemoteAnswer(SessionDescription),
    RemoteCandidate(IceCandidate),
    Close,
}

/// Everything links of one orchestrator share
pub(crate) struct LinkContext {
    pub local_id: ParticipantId,
    pub connector: Arc<dyn PeerConnector>,
    pub media: Arc<LocalMediaHandle>,
    pub signaling: mpsc::UnboundedSender<ClientMessage>,
    pub streams: Arc<RwLock<BTreeMap<ParticipantId, RemoteStream>>>,
    pub events: mpsc::UnboundedSender<CallEvent>,
    pub ice_restart: IceRestartPolicy,
}

/// The orchestrator's side of a running link task
pub(crate) struct LinkHandle {
    inbox: mpsc::UnboundedSender<LinkCommand>,
    state: watch::Receiver<NegotiationState>,
    task: JoinHandle<()>,
}

impl LinkHandle {
    pub fn spawn(ctx: Arc<LinkContext>, remote_id: ParticipantId) -> Self {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(NegotiationState::Idle);
        let link = PeerLink::new(ctx, remote_id, state_tx);
        let task = tokio::spawn(link.run(inbox_rx));
        Self { inbox, state, task }
    }

    /// Queue a command. Returns false once the link task has ended.
    pub fn send(&self, command: LinkCommand) -> bool {
        self.inbox.send(command).is_ok()
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<NegotiationState> {
        self.state.clone()
    }

    /// Stop the link and wait until its connection is closed
    pub async fn close(self) {
        let _ = self.inbox.send(LinkCommand::Close);
        if let Err(e) = self.task.await {
            tracing::warn!("Link task ended abnormally: {}", e);
        }
    }
}

/// Negotiation with one remote participant. Owned by its task; every
/// transition happens there, in arrival order.
pub(crate) struct PeerLink {
    ctx: Arc<LinkContext>,
    remote_id: ParticipantId,
    connection: Option<Box<dyn PeerConnection>>,
    connection_events: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    state: watch::Sender<NegotiationState>,
    remote_description_set: bool,
    local_description_sent: bool,
    /// Gathered before our description went out
    pending_outbound: Vec<IceCandidate>,
    /// Received before their description was applied
    pending_inbound: Vec<IceCandidate>,
    ice_restarts: u32,
    /// When the larger id stops waiting for the remote restart offer
    restart_deadline: Option<Instant>,
}

impl PeerLink {
    pub fn new(
        ctx: Arc<LinkContext>,
        remote_id: ParticipantId,
        state: watch::Sender<NegotiationState>,
    ) -> Self {
        Self {
            ctx,
            remote_id,
            connection: None,
            connection_events: None,
            state,
            remote_description_set: false,
            local_description_sent: false,
            pending_outbound: Vec::new(),
            pending_inbound: Vec::new(),
            ice_restarts: 0,
            restart_deadline: None,
        }
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<LinkCommand>) {
        loop {
            tokio::select! {
                command = inbox.recv() => {
                    let command = match command {
                        Some(LinkCommand::Close) | None => break,
                        Some(command) => command,
                    };
                    let result = self.on_command(command).await;
                    self.report(result);
                }
                Some(event) = next_event(&mut self.connection_events) => {
                    let result = self.on_connection_event(event).await;
                    self.report(result);
                }
                _ = restart_timer(self.restart_deadline) => {
                    self.restart_deadline = None;
                    let result = self.on_restart_timeout().await;
                    self.report(result);
                }
            }
        }

        self.discard_connection().await;
        self.pending_inbound.clear();
        self.set_state(NegotiationState::Closed);
        tracing::debug!("Link to {} closed", self.remote_id);
    }

    fn report(&self, result: Result<(), NegotiationError>) {
        match result {
            Ok(()) => {}
            Err(e @ NegotiationError::UnexpectedAnswer(_)) => {
                tracing::warn!("Dropped message: {}", e);
            }
            Err(e) => {
                tracing::error!("Negotiation with {} failed: {}", self.remote_id, e);
                self.set_state(NegotiationState::Failed);
            }
        }
    }

    fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    fn set_state(&self, state: NegotiationState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(
                "Link {} {:?} -> {:?}",
                self.remote_id.short(),
                previous,
                state
            );
        }
    }

    fn connection(&self) -> Result<&dyn PeerConnection, NegotiationError> {
        self.connection
            .as_deref()
            .ok_or_else(|| NegotiationError::NoConnection(self.remote_id.clone()))
    }

    async fn on_command(&mut self, command: LinkCommand) -> Result<(), NegotiationError> {
        match command {
            LinkCommand::Initiate => self.initiate().await,
            LinkCommand::RemoteOffer(offer) => self.on_offer(offer).await,
            LinkCommand::RemoteAnswer(answer) => self.on_answer(answer).await,
            LinkCommand::RemoteCandidate(candidate) => self.on_remote_candidate(candidate).await,
            LinkCommand::Close => Ok(()),
        }
    }

    /// Open the connection with every local track, or a receive-only
    /// section for each kind we don't capture
    async fn ensure_connection(&mut self) -> Result<(), NegotiationError> {
        if self.connection.is_some() {
            return Ok(());
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = self.ctx.connector.connect(events_tx).await?;

        for kind in MediaKind::ALL {
            match self.ctx.media.track(kind) {
                Some(track) => connection.add_track(track).await?,
                None => connection.add_recvonly(kind).await?,
            }
        }

        self.connection = Some(connection);
        self.connection_events = Some(events_rx);
        self.remote_description_set = false;
        self.local_description_sent = false;
        self.pending_outbound.clear();
        Ok(())
    }

    async fn discard_connection(&mut self) {
        self.connection_events = None;
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                tracing::warn!("Failed to close connection to {}: {}", self.remote_id, e);
            }
        }
        self.remote_description_set = false;
        self.local_description_sent = false;
        self.pending_outbound.clear();
    }

    async fn initiate(&mut self) -> Result<(), NegotiationError> {
        if self.state() != NegotiationState::Idle {
            tracing::debug!(
                "Not offering to {}, already {:?}",
                self.remote_id,
                self.state()
            );
            return Ok(());
        }

        self.ensure_connection().await?;
        let offer = self.connection()?.create_offer(false).await?;
        self.send_description(ClientMessage::Offer {
            to: self.remote_id.clone(),
            offer,
        })?;
        self.set_state(NegotiationState::OfferSent);
        tracing::info!("Sent offer to {}", self.remote_id);
        Ok(())
    }

    async fn on_offer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        self.restart_deadline = None;

        // Glare: the smaller id keeps its offer
        if self.state() == NegotiationState::OfferSent {
            if self.ctx.local_id < self.remote_id {
                tracing::info!("Offer glare with {}, keeping ours", self.remote_id);
                return Ok(());
            }
            if self.remote_description_set {
                // Renegotiating an established connection
                tracing::info!("Restart glare with {}, rolling back ours", self.remote_id);
                self.connection()?.rollback().await?;
            } else {
                tracing::info!("Offer glare with {}, answering theirs", self.remote_id);
                self.discard_connection().await;
            }
        }

        self.ensure_connection().await?;
        self.connection()?.set_remote_description(offer).await?;
        self.remote_description_set = true;
        self.set_state(NegotiationState::OfferReceived);
        self.flush_inbound().await?;

        let answer = self.connection()?.create_answer().await?;
        self.send_description(ClientMessage::Answer {
            to: self.remote_id.clone(),
            answer,
        })?;
        self.set_state(NegotiationState::Connected);
        tracing::info!("Answered offer from {}", self.remote_id);
        Ok(())
    }

    async fn on_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        if self.state() != NegotiationState::OfferSent {
            return Err(NegotiationError::UnexpectedAnswer(self.remote_id.clone()));
        }

        self.connection()?.set_remote_description(answer).await?;
        self.remote_description_set = true;
        self.flush_inbound().await?;
        self.set_state(NegotiationState::Connected);
        tracing::info!("Offer to {} answered", self.remote_id);
        Ok(())
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        if !self.remote_description_set {
            tracing::debug!("Buffering ICE candidate from {}", self.remote_id);
            self.pending_inbound.push(candidate);
            return Ok(());
        }

        if let Err(e) = self.connection()?.add_ice_candidate(candidate).await {
            tracing::warn!("Rejected ICE candidate from {}: {}", self.remote_id, e);
        }
        Ok(())
    }

    async fn flush_inbound(&mut self) -> Result<(), NegotiationError> {
        let pending = std::mem::take(&mut self.pending_inbound);
        if pending.is_empty() {
            return Ok(());
        }

        tracing::debug!(
            "Applying {} buffered ICE candidates from {}",
            pending.len(),
            self.remote_id
        );
        let connection = self.connection()?;
        for candidate in pending {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                tracing::warn!("Rejected ICE candidate from {}: {}", self.remote_id, e);
            }
        }
        Ok(())
    }

    fn send_signal(&self, message: ClientMessage) -> Result<(), NegotiationError> {
        self.ctx
            .signaling
            .send(message)
            .map_err(|_| NegotiationError::SignalingClosed)
    }

    /// Send an offer or answer, then whatever candidates waited for it
    fn send_description(&mut self, message: ClientMessage) -> Result<(), NegotiationError> {
        self.send_signal(message)?;
        self.local_description_sent = true;

        for candidate in std::mem::take(&mut self.pending_outbound) {
            self.send_signal(ClientMessage::IceCandidate {
                to: self.remote_id.clone(),
                candidate,
            })?;
        }
        Ok(())
    }

    async fn on_connection_event(&mut self, event: ConnectionEvent) -> Result<(), NegotiationError> {
        match event {
            ConnectionEvent::IceCandidate(candidate) => {
                if self.local_description_sent {
                    self.send_signal(ClientMessage::IceCandidate {
                        to: self.remote_id.clone(),
                        candidate,
                    })?;
                } else {
                    self.pending_outbound.push(candidate);
                }
                Ok(())
            }
            ConnectionEvent::Track(track) => {
                self.on_remote_track(track).await;
                Ok(())
            }
            ConnectionEvent::StateChanged(state) => self.on_connection_state(state).await,
        }
    }

    async fn on_remote_track(&mut self, track: RemoteTrack) {
        tracing::info!("Receiving {} from {}", track.kind, self.remote_id);
        let kind = track.kind;

        self.ctx
            .streams
            .write()
            .await
            .entry(self.remote_id.clone())
            .or_default()
            .tracks
            .push(track);

        let _ = self.ctx.events.send(CallEvent::RemoteTrack {
            from: self.remote_id.clone(),
            kind,
        });
    }

    async fn on_connection_state(&mut self, state: ConnectionState) -> Result<(), NegotiationError> {
        match state {
            ConnectionState::Connected => {
                tracing::info!("Media flowing with {}", self.remote_id);
                self.ice_restarts = 0;
                self.restart_deadline = None;
                if self.state() == NegotiationState::Failed {
                    self.set_state(NegotiationState::Connected);
                }
                Ok(())
            }
            ConnectionState::Failed => {
                tracing::warn!("Connection to {} failed", self.remote_id);
                self.set_state(NegotiationState::Failed);
                let _ = self
                    .ctx
                    .events
                    .send(CallEvent::PeerFailed(self.remote_id.clone()));
                self.restart_ice().await
            }
            other => {
                tracing::debug!("Connection to {} is {:?}", self.remote_id, other);
                Ok(())
            }
        }
    }

    /// Renegotiate ICE on the existing connection. The smaller id does so
    /// at once; the larger one waits for that offer first.
    async fn restart_ice(&mut self) -> Result<(), NegotiationError> {
        if self.ice_restarts >= self.ctx.ice_restart.max_attempts {
            tracing::error!(
                "Giving up on {} after {} ICE restarts",
                self.remote_id,
                self.ice_restarts
            );
            return Ok(());
        }

        if self.ctx.local_id > self.remote_id {
            tracing::info!(
                "Waiting up to {:?} for {} to restart ICE",
                self.ctx.ice_restart.grace,
                self.remote_id
            );
            self.restart_deadline = Some(Instant::now() + self.ctx.ice_restart.grace);
            return Ok(());
        }

        self.send_restart_offer().await
    }

    async fn on_restart_timeout(&mut self) -> Result<(), NegotiationError> {
        if self.state() != NegotiationState::Failed {
            return Ok(());
        }
        tracing::warn!("No ICE restart from {}, restarting ourselves", self.remote_id);
        self.send_restart_offer().await
    }

    async fn send_restart_offer(&mut self) -> Result<(), NegotiationError> {
        self.ice_restarts += 1;
        tracing::info!(
            "Restarting ICE with {} ({}/{})",
            self.remote_id,
            self.ice_restarts,
            self.ctx.ice_restart.max_attempts
        );

        let offer = self.connection()?.create_offer(true).await?;
        self.send_description(ClientMessage::Offer {
            to: self.remote_id.clone(),
            offer,
        })?;
        self.set_state(NegotiationState::OfferSent);
        Ok(())
    }
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
) -> Option<ConnectionEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn restart_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
