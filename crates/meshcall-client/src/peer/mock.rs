//! In-memory connections that record every call

use super::connection::{ConnectionEvent, PeerConnection, PeerConnector};
use crate::media::{LocalTrack, MediaKind};
use anyhow::Result;
use async_trait::async_trait;
use meshcall_protocol::{IceCandidate, SdpType, SessionDescription};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    AddTrack(MediaKind),
    AddRecvonly(MediaKind),
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetRemote(SdpType),
    Rollback,
    AddCandidate(String),
    Close,
}

pub(crate) struct MockConnectionState {
    pub index: usize,
    calls: Mutex<Vec<Call>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    closed: AtomicBool,
}

impl MockConnectionState {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Report something as if the transport produced it
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[derive(Default)]
pub(crate) struct MockConnector {
    connections: Mutex<Vec<Arc<MockConnectionState>>>,
    sdp_counter: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connection(&self, index: usize) -> Arc<MockConnectionState> {
        self.connections.lock().unwrap()[index].clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Box<dyn PeerConnection>> {
        let mut connections = self.connections.lock().unwrap();
        let state = Arc::new(MockConnectionState {
            index: connections.len(),
            calls: Mutex::new(Vec::new()),
            events,
            closed: AtomicBool::new(false),
        });
        connections.push(state.clone());
        Ok(Box::new(MockConnection {
            state,
            sdp_counter: self.sdp_counter.clone(),
        }))
    }
}

struct MockConnection {
    state: Arc<MockConnectionState>,
    sdp_counter: Arc<AtomicUsize>,
}

impl MockConnection {
    fn next_sdp(&self, label: &str) -> String {
        let n = self.sdp_counter.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}-{}", label, self.state.index, n)
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        self.state.record(Call::AddTrack(track.kind()));
        Ok(())
    }

    async fn add_recvonly(&self, kind: MediaKind) -> Result<()> {
        self.state.record(Call::AddRecvonly(kind));
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        self.state.record(Call::CreateOffer { ice_restart });
        let label = if ice_restart { "restart" } else { "offer" };
        Ok(SessionDescription::offer(self.next_sdp(label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.state.record(Call::CreateAnswer);
        Ok(SessionDescription::answer(self.next_sdp("answer")))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.state.record(Call::SetRemote(description.sdp_type));
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.state.record(Call::Rollback);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.state.record(Call::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.record(Call::Close);
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
