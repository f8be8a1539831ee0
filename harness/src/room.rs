use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::Value;
use thiserror::Error;

use crate::event::{state_needed_for, EventBuilder, EventError, Pdu, RoomVersion, StateKeyTuple, M_ROOM_CREATE};

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("room {0} has no events to build on")]
    EmptyTimeline(String),
    #[error("event construction failed: {0}")]
    Event(#[from] EventError),
}

/// One simulated room hosted by a peer server.
///
/// The timeline is append-only. Current state is never stored: it is
/// projected from the timeline on demand, so the two cannot drift apart.
#[derive(Clone, Debug)]
pub struct ServerRoom {
    room_id: String,
    version: RoomVersion,
    timeline: Vec<Pdu>,
    /// event ID -> timeline position
    index: HashMap<String, usize>,
}

impl ServerRoom {
    pub fn new(room_id: &str, version: RoomVersion) -> Self {
        Self {
            room_id: room_id.to_string(),
            version,
            timeline: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn version(&self) -> RoomVersion {
        self.version
    }

    pub fn timeline(&self) -> &[Pdu] {
        &self.timeline
    }

    pub fn len(&self) -> usize {
        self.timeline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timeline.is_empty()
    }

    pub fn tail(&self) -> Option<&Pdu> {
        self.timeline.last()
    }

    /// Depth of the newest event, 0 for an empty room.
    pub fn depth(&self) -> i64 {
        self.tail().map(Pdu::depth).unwrap_or(0)
    }

    /// Append an event to the timeline.
    ///
    /// The caller has already authenticated the event; nothing is checked
    /// here beyond de-duplication and the room version. Returns `false` if
    /// the event ID was already present or the event is in another format.
    pub fn add_event(&mut self, pdu: Pdu) -> bool {
        if pdu.room_version() != self.version {
            tracing::warn!(
                room_id = %self.room_id,
                event_id = %pdu.event_id(),
                event_version = %pdu.room_version(),
                room_version = %self.version,
                "event built for another room version refused"
            );
            return false;
        }
        if self.index.contains_key(pdu.event_id()) {
            tracing::debug!(room_id = %self.room_id, event_id = %pdu.event_id(), "duplicate event ignored");
            return false;
        }
        if let Some(tail) = self.tail() {
            if !pdu.prev_events().iter().any(|p| p == tail.event_id()) {
                tracing::warn!(
                    room_id = %self.room_id,
                    event_id = %pdu.event_id(),
                    tail = %tail.event_id(),
                    "appended event does not reference the timeline tail"
                );
            }
        }
        tracing::debug!(
            room_id = %self.room_id,
            event_id = %pdu.event_id(),
            event_type = %pdu.event_type(),
            "event appended"
        );
        self.index.insert(pdu.event_id().to_string(), self.timeline.len());
        self.timeline.push(pdu);
        true
    }

    /// Timeline position of the latest event per state slot.
    fn state_positions(&self) -> HashMap<StateKeyTuple, usize> {
        let mut positions = HashMap::new();
        for (i, pdu) in self.timeline.iter().enumerate() {
            if let Some(tuple) = pdu.state_tuple() {
                positions.insert(tuple, i);
            }
        }
        positions
    }

    pub fn current_state(&self, event_type: &str, state_key: &str) -> Option<&Pdu> {
        self.timeline
            .iter()
            .rev()
            .find(|pdu| pdu.event_type() == event_type && pdu.state_key() == Some(state_key))
    }

    /// Event IDs of the current-state events filling `needed`, in the order
    /// requested. Slots with no state are skipped.
    pub fn auth_events(&self, needed: &[StateKeyTuple]) -> Vec<String> {
        needed
            .iter()
            .filter_map(|t| self.current_state(&t.event_type, &t.state_key))
            .map(|pdu| pdu.event_id().to_string())
            .collect()
    }

    /// The whole current state, ordered by each winning event's timeline position.
    pub fn all_current_state(&self) -> Vec<Pdu> {
        let mut positions: Vec<usize> = self.state_positions().into_values().collect();
        positions.sort_unstable();
        positions.into_iter().map(|i| self.timeline[i].clone()).collect()
    }

    /// The create event plus everything reachable through `auth_events`
    /// from the current state, de-duplicated, in timeline order.
    pub fn auth_chain(&self) -> Vec<Pdu> {
        let mut seen: HashSet<usize> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();

        if let Some(create) = self.current_state(M_ROOM_CREATE, "") {
            if let Some(&i) = self.index.get(create.event_id()) {
                seen.insert(i);
            }
        }
        for &i in self.state_positions().values() {
            queue.extend(self.timeline[i].auth_events().iter().map(String::as_str));
        }

        while let Some(event_id) = queue.pop_front() {
            let Some(&i) = self.index.get(event_id) else {
                tracing::debug!(room_id = %self.room_id, event_id, "auth event not in timeline");
                continue;
            };
            if seen.insert(i) {
                queue.extend(self.timeline[i].auth_events().iter().map(String::as_str));
            }
        }

        let mut positions: Vec<usize> = seen.into_iter().collect();
        positions.sort_unstable();
        positions.into_iter().map(|i| self.timeline[i].clone()).collect()
    }

    /// Template for the next event in this room: references the tail, sits
    /// one deeper, and cites the auth events its type requires.
    pub fn prepare_event(
        &self,
        sender: &str,
        event_type: &str,
        state_key: Option<&str>,
        content: Value,
    ) -> Result<EventBuilder, RoomError> {
        let mut builder = EventBuilder::new(sender, &self.room_id, event_type);
        builder.state_key = state_key.map(str::to_string);
        builder.set_content(content)?;

        match self.tail() {
            Some(tail) => {
                builder.prev_events = vec![tail.event_id().to_string()];
                builder.depth = tail.depth() + 1;
            }
            None if event_type == M_ROOM_CREATE => {
                builder.depth = 1;
            }
            None => return Err(RoomError::EmptyTimeline(self.room_id.clone())),
        }

        let needed = state_needed_for(event_type, sender, state_key, &builder.content);
        builder.auth_events = self.auth_events(&needed);
        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ServerIdentity;
    use crate::event::{M_ROOM_JOIN_RULES, M_ROOM_MEMBER, M_ROOM_POWER_LEVELS};
    use serde_json::json;

    const CREATOR: &str = "@creator:peer";

    fn identity() -> ServerIdentity {
        ServerIdentity::from_seed("peer", &[3u8; 32]).unwrap()
    }

    fn append(
        room: &mut ServerRoom,
        id: &ServerIdentity,
        sender: &str,
        event_type: &str,
        state_key: Option<&str>,
        content: Value,
    ) -> Pdu {
        let ts = room.len() as i64;
        let pdu = room
            .prepare_event(sender, event_type, state_key, content)
            .unwrap()
            .build(id, ts, room.version())
            .unwrap();
        assert!(room.add_event(pdu.clone()));
        pdu
    }

    fn seeded_room() -> (ServerRoom, ServerIdentity) {
        let id = identity();
        let mut room = ServerRoom::new("!r:peer", RoomVersion::V6);
        append(&mut room, &id, CREATOR, M_ROOM_CREATE, Some(""), json!({"creator": CREATOR}));
        append(&mut room, &id, CREATOR, M_ROOM_MEMBER, Some(CREATOR), json!({"membership": "join"}));
        append(&mut room, &id, CREATOR, M_ROOM_POWER_LEVELS, Some(""), json!({"users": {CREATOR: 100}}));
        append(&mut room, &id, CREATOR, M_ROOM_JOIN_RULES, Some(""), json!({"join_rule": "public"}));
        (room, id)
    }

    #[test]
    fn create_only_room_auth_chain_is_just_create() {
        let id = identity();
        let mut room = ServerRoom::new("!r:peer", RoomVersion::V6);
        let create = append(&mut room, &id, CREATOR, M_ROOM_CREATE, Some(""), json!({"creator": CREATOR}));

        let chain = room.auth_chain();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].event_id(), create.event_id());
    }

    #[test]
    fn latest_state_event_wins() {
        let (mut room, id) = seeded_room();
        let mut last = None;
        for n in 0..5 {
            last = Some(append(&mut room, &id, CREATOR, "m.room.topic", Some(""), json!({"topic": n})));
        }

        let topics: Vec<_> = room
            .all_current_state()
            .into_iter()
            .filter(|p| p.event_type() == "m.room.topic")
            .collect();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].event_id(), last.unwrap().event_id());
        assert_eq!(room.all_current_state().len(), 5);
    }

    #[test]
    fn current_state_ordered_by_timeline_position() {
        let (mut room, id) = seeded_room();
        append(&mut room, &id, CREATOR, M_ROOM_POWER_LEVELS, Some(""), json!({"users": {}}));
        let types: Vec<_> = room
            .all_current_state()
            .iter()
            .map(|p| p.event_type().to_string())
            .collect();
        assert_eq!(
            types,
            vec![M_ROOM_CREATE, M_ROOM_MEMBER, M_ROOM_JOIN_RULES, M_ROOM_POWER_LEVELS]
        );
    }

    #[test]
    fn messages_are_not_state() {
        let (mut room, id) = seeded_room();
        append(&mut room, &id, CREATOR, "m.room.message", None, json!({"body": "hi"}));
        assert_eq!(room.all_current_state().len(), 4);
        assert_eq!(room.len(), 5);
    }

    #[test]
    fn prepared_join_references_tail_and_required_auth() {
        let (room, _) = seeded_room();
        let joiner = "@bob:remote";
        let builder = room
            .prepare_event(joiner, M_ROOM_MEMBER, Some(joiner), json!({"membership": "join"}))
            .unwrap();

        assert_eq!(builder.prev_events, vec![room.tail().unwrap().event_id().to_string()]);
        assert_eq!(builder.depth, room.depth() + 1);
        let expected: Vec<String> = [M_ROOM_CREATE, M_ROOM_POWER_LEVELS, M_ROOM_JOIN_RULES]
            .iter()
            .map(|t| room.current_state(t, "").unwrap().event_id().to_string())
            .collect();
        assert_eq!(builder.auth_events, expected);
    }

    #[test]
    fn auth_chain_is_transitive_and_deduplicated() {
        let (mut room, id) = seeded_room();
        append(&mut room, &id, CREATOR, "m.room.message", None, json!({"body": "not state"}));
        append(&mut room, &id, "@bob:remote", M_ROOM_MEMBER, Some("@bob:remote"), json!({"membership": "join"}));

        let chain = room.auth_chain();
        let ids: HashSet<_> = chain.iter().map(|p| p.event_id().to_string()).collect();
        assert_eq!(ids.len(), chain.len());
        // create, creator join, power levels, join rules
        assert_eq!(chain.len(), 4);
        assert!(chain.iter().all(|p| p.event_type() != "m.room.message"));
        assert_eq!(chain[0].event_type(), M_ROOM_CREATE);
    }

    #[test]
    fn duplicate_event_rejected() {
        let (mut room, _) = seeded_room();
        let tail = room.tail().unwrap().clone();
        assert!(!room.add_event(tail));
        assert_eq!(room.len(), 4);
    }

    #[test]
    fn event_of_other_version_refused() {
        let (mut room, id) = seeded_room();
        let pdu = room
            .prepare_event(CREATOR, "m.room.topic", Some(""), json!({"topic": "v5"}))
            .unwrap()
            .build(&id, 99, RoomVersion::V5)
            .unwrap();
        assert_eq!(pdu.room_version(), RoomVersion::V5);
        assert!(!room.add_event(pdu));
        assert_eq!(room.len(), 4);
        assert!(room.current_state("m.room.topic", "").is_none());
    }

    #[test]
    fn prepare_on_empty_room_only_allows_create() {
        let room = ServerRoom::new("!empty:peer", RoomVersion::V6);
        assert!(matches!(
            room.prepare_event(CREATOR, M_ROOM_MEMBER, Some(CREATOR), json!({"membership": "join"})),
            Err(RoomError::EmptyTimeline(_))
        ));
        let create = room
            .prepare_event(CREATOR, M_ROOM_CREATE, Some(""), json!({"creator": CREATOR}))
            .unwrap();
        assert!(create.auth_events.is_empty());
        assert!(create.prev_events.is_empty());
    }
}
