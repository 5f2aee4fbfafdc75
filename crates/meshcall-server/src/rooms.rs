//! Room membership
//!
//! Plain in-memory registry of room id -> participant ids. It does no locking
//! of its own; the relay owns the single instance behind a mutex so that a
//! mutation and the member snapshot taken with it are one atomic step.

use meshcall_protocol::ParticipantId;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: BTreeMap<String, BTreeSet<ParticipantId>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `participant` to `room`, creating the room on demand.
    ///
    /// Returns the other members in registry order. Joining twice leaves the
    /// member set unchanged.
    pub fn join(&mut self, room: &str, participant: &ParticipantId) -> Vec<ParticipantId> {
        let members = self.rooms.entry(room.to_string()).or_default();
        members.insert(participant.clone());
        members
            .iter()
            .filter(|id| *id != participant)
            .cloned()
            .collect()
    }

    /// Remove `participant` from `room`. Returns whether it was a member.
    pub fn leave(&mut self, room: &str, participant: &ParticipantId) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let removed = members.remove(participant);
        if members.is_empty() {
            self.rooms.remove(room);
        }
        removed
    }

    /// Remove `participant` from every room it belongs to and return those rooms.
    pub fn remove_from_all_rooms(&mut self, participant: &ParticipantId) -> Vec<String> {
        let mut left = Vec::new();
        self.rooms.retain(|room, members| {
            if members.remove(participant) {
                left.push(room.clone());
            }
            !members.is_empty()
        });
        left
    }

    /// Every current member of `room`, the caller included
    pub fn members(&self, room: &str) -> Vec<ParticipantId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn rooms_of(&self, participant: &ParticipantId) -> Vec<String> {
        self.rooms
            .iter()
            .filter(|(_, members)| members.contains(participant))
            .map(|(room, _)| room.clone())
            .collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ParticipantId {
        ParticipantId::from(s)
    }

    #[test]
    fn join_creates_room_and_returns_others() {
        let mut registry = RoomRegistry::new();
        assert!(registry.join("abc", &id("a")).is_empty());
        assert_eq!(registry.join("abc", &id("b")), vec![id("a")]);
        assert_eq!(registry.join("abc", &id("c")), vec![id("a"), id("b")]);
        assert_eq!(registry.members("abc"), vec![id("a"), id("b"), id("c")]);
        assert_eq!(registry.room_count(), 1);
    }

    #[test]
    fn join_is_idempotent() {
        let mut registry = RoomRegistry::new();
        registry.join("abc", &id("a"));
        registry.join("abc", &id("b"));
        assert_eq!(registry.join("abc", &id("a")), vec![id("b")]);
        assert_eq!(registry.members("abc").len(), 2);
    }

    #[test]
    fn leave_of_non_member_is_a_no_op() {
        let mut registry = RoomRegistry::new();
        registry.join("abc", &id("a"));
        assert!(!registry.leave("abc", &id("z")));
        assert!(!registry.leave("nowhere", &id("a")));
        assert_eq!(registry.members("abc"), vec![id("a")]);
    }

    #[test]
    fn last_leave_drops_the_room() {
        let mut registry = RoomRegistry::new();
        registry.join("abc", &id("a"));
        assert!(registry.leave("abc", &id("a")));
        assert_eq!(registry.room_count(), 0);
        assert!(registry.members("abc").is_empty());
    }

    #[test]
    fn remove_from_all_rooms_reports_only_rooms_it_was_in() {
        let mut registry = RoomRegistry::new();
        registry.join("abc", &id("a"));
        registry.join("abc", &id("b"));
        registry.join("xyz", &id("a"));
        registry.join("xyz", &id("c"));
        registry.join("other", &id("d"));

        let mut left = registry.remove_from_all_rooms(&id("a"));
        left.sort();
        assert_eq!(left, vec!["abc".to_string(), "xyz".to_string()]);
        assert_eq!(registry.members("abc"), vec![id("b")]);
        assert_eq!(registry.members("xyz"), vec![id("c")]);
        assert_eq!(registry.members("other"), vec![id("d")]);
        assert!(registry.rooms_of(&id("a")).is_empty());

        assert!(registry.remove_from_all_rooms(&id("a")).is_empty());
    }
}
