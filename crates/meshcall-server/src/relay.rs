//! Signaling relay
//!
//! Interprets participant events, keeps the room registry and routes
//! negotiation messages by participant id. Payloads are never inspected.

use crate::error::{RelayError, Result};
use crate::rooms::RoomRegistry;
use crate::ws::connections::ConnectionManager;
use meshcall_protocol::{ClientMessage, ParticipantId, RawClientMessage, ServerMessage};
use tokio::sync::{mpsc, Mutex};

pub struct Relay {
    /// Lock order: `rooms` first, then anything inside `connections`
    rooms: Mutex<RoomRegistry>,
    connections: ConnectionManager,
    announce_leave: bool,
}

impl Relay {
    pub fn new(announce_leave: bool) -> Self {
        Self {
            rooms: Mutex::new(RoomRegistry::new()),
            connections: ConnectionManager::new(),
            announce_leave,
        }
    }

    /// Register a new connection and greet it with its session id
    pub async fn connect(&self, sender: mpsc::UnboundedSender<String>) -> ParticipantId {
        let participant_id = ParticipantId::generate();
        self.connections
            .add_connection(participant_id.clone(), sender)
            .await;
        self.connections
            .send_to_connection(
                &participant_id,
                &ServerMessage::Connected(participant_id.clone()),
            )
            .await;

        tracing::info!("New connection: {}", participant_id);
        participant_id
    }

    /// Parse and dispatch one text frame. Negotiation payloads stay raw JSON.
    pub async fn handle_text(&self, from: &ParticipantId, text: &str) -> Result<()> {
        let message: RawClientMessage = serde_json::from_str(text)?;
        self.handle_message(from, message).await
    }

    pub async fn handle_message(&self, from: &ParticipantId, message: RawClientMessage) -> Result<()> {
        if !self.connections.is_connected(from).await {
            return Err(RelayError::UnknownConnection(from.to_string()));
        }

        match message {
            ClientMessage::JoinRoom(room_id) => self.join(from, &room_id).await,
            ClientMessage::LeaveRoom => {
                self.leave(from).await;
                Ok(())
            }
            ClientMessage::Ping => {
                self.connections
                    .send_to_connection(from, &ServerMessage::Pong)
                    .await;
                Ok(())
            }
            negotiation => {
                self.route(from, negotiation).await;
                Ok(())
            }
        }
    }

    pub async fn join(&self, participant_id: &ParticipantId, room_id: &str) -> Result<()> {
        if room_id.is_empty() {
            return Err(RelayError::EmptyRoomId);
        }

        // Held across both sends so concurrent joins and leaves cannot
        // interleave with the snapshot handed to the joiner.
        let mut rooms = self.rooms.lock().await;
        let others = rooms.join(room_id, participant_id);
        self.connections
            .set_current_room(participant_id, room_id)
            .await;

        tracing::info!(
            "{} joined room {} ({} other members)",
            participant_id,
            room_id,
            others.len()
        );

        self.connections
            .broadcast(&others, &ServerMessage::UserJoined(participant_id.clone()))
            .await;
        self.connections
            .send_to_connection(participant_id, &ServerMessage::RoomUsers(others))
            .await;

        Ok(())
    }

    /// Leave the connection's current room.
    ///
    /// Remaining members are only told when `announce_leave` is set; by
    /// default they learn about it once the connection drops.
    pub async fn leave(&self, participant_id: &ParticipantId) {
        let mut rooms = self.rooms.lock().await;
        let Some(room_id) = self.connections.take_current_room(participant_id).await else {
            tracing::debug!("{} sent leaveRoom outside any room", participant_id);
            return;
        };

        if !rooms.leave(&room_id, participant_id) {
            return;
        }
        tracing::info!("{} left room {}", participant_id, room_id);

        if self.announce_leave {
            let remaining = rooms.members(&room_id);
            self.connections
                .broadcast(&remaining, &ServerMessage::UserLeft(participant_id.clone()))
                .await;
        }
    }

    /// Forward an offer, answer or candidate to its target, stamped with the sender
    pub async fn route(&self, from: &ParticipantId, message: RawClientMessage) {
        let Some((to, routed)) = message.into_routed(from.clone()) else {
            return;
        };

        if !self.connections.send_to_connection(&to, &routed).await {
            tracing::debug!("Dropping message from {} to unknown participant {}", from, to);
        }
    }

    /// Connection is gone: drop it from every room and tell the rooms
    pub async fn disconnect(&self, participant_id: &ParticipantId) {
        let mut rooms = self.rooms.lock().await;
        let left = rooms.remove_from_all_rooms(participant_id);
        self.connections.remove_connection(participant_id).await;

        for room_id in &left {
            let remaining = rooms.members(room_id);
            self.connections
                .broadcast(&remaining, &ServerMessage::UserLeft(participant_id.clone()))
                .await;
        }

        tracing::info!(
            "Disconnected: {} (left {} rooms)",
            participant_id,
            left.len()
        );
    }

    pub async fn members(&self, room_id: &str) -> Vec<ParticipantId> {
        self.rooms.lock().await.members(room_id)
    }

    pub async fn rooms_of(&self, participant_id: &ParticipantId) -> Vec<String> {
        self.rooms.lock().await.rooms_of(participant_id)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.room_count()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.connection_count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcall_protocol::RawServerMessage;
    use serde_json::json;

    struct TestPeer {
        id: ParticipantId,
        rx: mpsc::UnboundedReceiver<String>,
    }

    impl TestPeer {
        async fn connect(relay: &Relay) -> Self {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let id = relay.connect(tx).await;
            let greeting: RawServerMessage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(greeting, ServerMessage::Connected(id.clone()));
            Self { id, rx }
        }

        fn drain(&mut self) -> Vec<RawServerMessage> {
            let mut out = Vec::new();
            while let Ok(text) = self.rx.try_recv() {
                out.push(serde_json::from_str(&text).unwrap());
            }
            out
        }
    }

    fn sorted(mut ids: Vec<ParticipantId>) -> Vec<ParticipantId> {
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn joiner_gets_others_and_others_get_notified() {
        let relay = Relay::new(false);
        let mut a = TestPeer::connect(&relay).await;
        let mut b = TestPeer::connect(&relay).await;
        let mut c = TestPeer::connect(&relay).await;

        relay.join(&a.id, "abc").await.unwrap();
        relay.join(&b.id, "abc").await.unwrap();
        a.drain();
        b.drain();

        relay.join(&c.id, "abc").await.unwrap();

        let to_c = c.drain();
        assert_eq!(to_c.len(), 1);
        match &to_c[0] {
            ServerMessage::RoomUsers(users) => {
                assert_eq!(sorted(users.clone()), sorted(vec![a.id.clone(), b.id.clone()]));
            }
            other => panic!("Expected RoomUsers, got {:?}", other),
        }
        assert_eq!(a.drain(), vec![ServerMessage::UserJoined(c.id.clone())]);
        assert_eq!(b.drain(), vec![ServerMessage::UserJoined(c.id.clone())]);
    }

    #[tokio::test]
    async fn first_joiner_gets_empty_member_list() {
        let relay = Relay::new(false);
        let mut a = TestPeer::connect(&relay).await;
        relay.join(&a.id, "fresh").await.unwrap();
        assert_eq!(a.drain(), vec![ServerMessage::RoomUsers(vec![])]);
        assert_eq!(relay.members("fresh").await, vec![a.id.clone()]);
    }

    #[tokio::test]
    async fn empty_room_id_is_rejected() {
        let relay = Relay::new(false);
        let mut a = TestPeer::connect(&relay).await;
        let result = relay.join(&a.id, "").await;
        assert!(matches!(result, Err(RelayError::EmptyRoomId)));
        assert!(a.drain().is_empty());
        assert_eq!(relay.room_count().await, 0);
    }

    #[tokio::test]
    async fn disconnect_notifies_every_room_it_was_in_and_no_other() {
        let relay = Relay::new(false);
        let a = TestPeer::connect(&relay).await;
        let mut b = TestPeer::connect(&relay).await;
        let mut x = TestPeer::connect(&relay).await;
        let mut outsider = TestPeer::connect(&relay).await;

        relay.join(&b.id, "abc").await.unwrap();
        relay.join(&x.id, "xyz").await.unwrap();
        relay.join(&outsider.id, "elsewhere").await.unwrap();
        relay.join(&a.id, "abc").await.unwrap();
        relay.join(&a.id, "xyz").await.unwrap();
        b.drain();
        x.drain();
        outsider.drain();

        relay.disconnect(&a.id).await;

        assert_eq!(b.drain(), vec![ServerMessage::UserLeft(a.id.clone())]);
        assert_eq!(x.drain(), vec![ServerMessage::UserLeft(a.id.clone())]);
        assert!(outsider.drain().is_empty());
        assert!(!relay.members("abc").await.contains(&a.id));
        assert!(!relay.members("xyz").await.contains(&a.id));
        assert!(relay.rooms_of(&a.id).await.is_empty());
        assert_eq!(relay.connection_count().await, 3);
    }

    #[tokio::test]
    async fn leave_is_silent_by_default() {
        let relay = Relay::new(false);
        let mut a = TestPeer::connect(&relay).await;
        let mut b = TestPeer::connect(&relay).await;
        relay.join(&a.id, "abc").await.unwrap();
        relay.join(&b.id, "abc").await.unwrap();
        a.drain();
        b.drain();

        relay
            .handle_message(&a.id, ClientMessage::LeaveRoom)
            .await
            .unwrap();

        assert!(a.drain().is_empty());
        assert!(b.drain().is_empty());
        assert_eq!(relay.members("abc").await, vec![b.id.clone()]);
    }

    #[tokio::test]
    async fn leave_can_announce_when_configured() {
        let relay = Relay::new(true);
        let a = TestPeer::connect(&relay).await;
        let mut b = TestPeer::connect(&relay).await;
        relay.join(&a.id, "abc").await.unwrap();
        relay.join(&b.id, "abc").await.unwrap();
        b.drain();

        relay.leave(&a.id).await;
        assert_eq!(b.drain(), vec![ServerMessage::UserLeft(a.id.clone())]);
    }

    #[tokio::test]
    async fn leave_only_touches_the_current_room() {
        let relay = Relay::new(false);
        let a = TestPeer::connect(&relay).await;
        relay.join(&a.id, "first").await.unwrap();
        relay.join(&a.id, "second").await.unwrap();

        relay.leave(&a.id).await;
        assert_eq!(relay.rooms_of(&a.id).await, vec!["first".to_string()]);

        // Nothing tracked any more, so a second leave does nothing
        relay.leave(&a.id).await;
        assert_eq!(relay.rooms_of(&a.id).await, vec!["first".to_string()]);
    }

    #[tokio::test]
    async fn negotiation_is_routed_point_to_point_with_sender() {
        let relay = Relay::new(false);
        let mut a = TestPeer::connect(&relay).await;
        let mut b = TestPeer::connect(&relay).await;
        let mut c = TestPeer::connect(&relay).await;

        let offer = json!({"type": "offer", "sdp": "v=0\r\n"});
        relay
            .handle_message(
                &a.id,
                ClientMessage::Offer {
                    to: b.id.clone(),
                    offer: offer.clone(),
                },
            )
            .await
            .unwrap();

        assert_eq!(
            b.drain(),
            vec![ServerMessage::Offer {
                from: a.id.clone(),
                offer
            }]
        );
        assert!(a.drain().is_empty());
        assert!(c.drain().is_empty());
    }

    #[tokio::test]
    async fn negotiation_payloads_are_forwarded_as_sent() {
        let relay = Relay::new(false);
        let mut a = TestPeer::connect(&relay).await;
        let mut b = TestPeer::connect(&relay).await;

        let candidate = json!({
            "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0,
            "usernameFragment": "abcd",
        });
        let frame = json!({"event": "iceCandidate", "data": {"to": b.id, "candidate": candidate}});
        relay.handle_text(&a.id, &frame.to_string()).await.unwrap();

        let frame = json!({"event": "offer", "data": {"to": b.id, "offer": {"type": "pranswer", "sdp": "v=0"}}});
        relay.handle_text(&a.id, &frame.to_string()).await.unwrap();

        assert_eq!(
            b.drain(),
            vec![
                ServerMessage::IceCandidate {
                    from: a.id.clone(),
                    candidate,
                },
                ServerMessage::Offer {
                    from: a.id.clone(),
                    offer: json!({"type": "pranswer", "sdp": "v=0"}),
                },
            ]
        );
        assert!(a.drain().is_empty());
    }

    #[tokio::test]
    async fn routing_to_unknown_target_is_silently_dropped() {
        let relay = Relay::new(false);
        let mut a = TestPeer::connect(&relay).await;

        let result = relay
            .handle_message(
                &a.id,
                ClientMessage::Answer {
                    to: ParticipantId::from("nobody"),
                    answer: json!({"type": "answer", "sdp": "v=0"}),
                },
            )
            .await;

        assert!(result.is_ok());
        assert!(a.drain().is_empty());
        assert_eq!(relay.connection_count().await, 1);
    }

    #[tokio::test]
    async fn malformed_frames_are_errors_without_side_effects() {
        let relay = Relay::new(false);
        let mut a = TestPeer::connect(&relay).await;

        assert!(matches!(
            relay.handle_text(&a.id, "not json").await,
            Err(RelayError::Malformed(_))
        ));
        assert!(matches!(
            relay.handle_text(&a.id, r#"{"event":"offer","data":{}}"#).await,
            Err(RelayError::Malformed(_))
        ));
        assert!(a.drain().is_empty());

        relay.handle_text(&a.id, r#"{"event":"ping"}"#).await.unwrap();
        assert_eq!(a.drain(), vec![ServerMessage::Pong]);
    }

    #[tokio::test]
    async fn unknown_sender_is_rejected() {
        let relay = Relay::new(false);
        let result = relay
            .handle_message(&ParticipantId::from("ghost"), ClientMessage::JoinRoom("abc".into()))
            .await;
        assert!(matches!(result, Err(RelayError::UnknownConnection(_))));
        assert_eq!(relay.room_count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_joins_see_consistent_snapshots() {
        let relay = std::sync::Arc::new(Relay::new(false));
        let mut peers = Vec::new();
        for _ in 0..16 {
            peers.push(TestPeer::connect(&relay).await);
        }

        let handles: Vec<_> = peers
            .iter()
            .map(|peer| {
                let relay = relay.clone();
                let id = peer.id.clone();
                tokio::spawn(async move { relay.join(&id, "busy").await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(relay.members("busy").await.len(), 16);

        // Everyone either saw a peer in its snapshot or was told it joined later,
        // never both and never neither.
        for peer in &mut peers {
            let messages = peer.drain();
            let mut known: Vec<ParticipantId> = Vec::new();
            for msg in messages {
                match msg {
                    ServerMessage::RoomUsers(users) => known.extend(users),
                    ServerMessage::UserJoined(id) => known.push(id),
                    other => panic!("Unexpected {:?}", other),
                }
            }
            known.sort();
            let before = known.len();
            known.dedup();
            assert_eq!(before, known.len());
            assert_eq!(known.len(), 15);
            assert!(!known.contains(&peer.id));
        }
    }
}
