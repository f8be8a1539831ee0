//! Declarative deployment topology: homeservers, their users and rooms.
//!
//! A [`Blueprint`] is written by a test author with shorthand identifiers
//! (`@alice`, `bob`) and normalised by [`validate`] into fully qualified ones
//! (`@alice:hs1`) before it is handed to a provisioner.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Sigil that prefixes every declared user localpart.
pub const USER_SIGIL: char = '@';
/// Separator between a localpart and the server name.
pub const DOMAIN_SEPARATOR: char = ':';

const MEMBER_EVENT: &str = "m.room.member";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlueprintError {
    #[error("blueprint must have a name")]
    MissingName,
    #[error("HS {homeserver} user localpart '{localpart}' must start with '@'")]
    MissingSigil {
        homeserver: String,
        localpart: String,
    },
    #[error("HS {homeserver} user localpart '{localpart}' must not contain a domain")]
    LocalpartHasDomain {
        homeserver: String,
        localpart: String,
    },
    #[error("{homeserver}: room must have either a ref or a creator")]
    RoomWithoutRefOrCreator { homeserver: String },
    #[error("HS '{homeserver}' user '{user}' must end with ':{homeserver}' or have no domain")]
    ForeignUser { homeserver: String, user: String },
}

/// An entire deployment to make.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    /// Namespace for the provisioned instances.
    pub name: String,
    pub homeservers: Vec<Homeserver>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Homeserver {
    /// Protocol-level server name, no scheme.
    pub name: String,
    pub users: Vec<User>,
    pub rooms: Vec<Room>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub localpart: String,
    pub display_name: String,
    pub avatar_url: String,
    pub account_data: Vec<AccountData>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountData {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Room {
    /// Correlates one room across homeserver declarations. Not a room ID.
    #[serde(rename = "ref")]
    pub reference: String,
    pub creator: String,
    pub create_room: Map<String, Value>,
    pub events: Vec<Event>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub sender: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    pub content: Map<String, Value>,
}

impl Homeserver {
    /// Full user ID for a user declared on this homeserver.
    ///
    /// Works both before and after normalisation.
    pub fn user_id(&self, user: &User) -> String {
        let localpart = user
            .localpart
            .strip_prefix(USER_SIGIL)
            .unwrap_or(&user.localpart);
        format!("{USER_SIGIL}{localpart}{DOMAIN_SEPARATOR}{}", self.name)
    }
}

impl Event {
    /// Convenience constructor for a state event.
    pub fn state(event_type: &str, sender: &str, state_key: &str, content: Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            sender: sender.to_string(),
            state_key: Some(state_key.to_string()),
            content: into_object(content),
        }
    }

    /// Convenience constructor for a message-like event.
    pub fn message(event_type: &str, sender: &str, content: Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            sender: sender.to_string(),
            state_key: None,
            content: into_object(content),
        }
    }
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Validate a blueprint and return a normalised copy.
///
/// Every user localpart loses its `@` sigil, and every room creator, event
/// sender and membership state key is qualified with its homeserver's name.
/// The input is left untouched.
///
/// Sigil stripping is one-shot: validating an already-normalised blueprint
/// fails with [`BlueprintError::MissingSigil`] for every declared user.
/// Rooms and events on their own are idempotent, see [`normalise_room`].
pub fn validate(bp: &Blueprint) -> Result<Blueprint, BlueprintError> {
    if bp.name.is_empty() {
        return Err(BlueprintError::MissingName);
    }
    let homeservers = bp
        .homeservers
        .iter()
        .map(normalise_homeserver)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Blueprint {
        name: bp.name.clone(),
        homeservers,
    })
}

/// Like [`validate`], but panics on an invalid blueprint.
///
/// Meant for test set-up where an invalid blueprint is an authoring bug.
pub fn must_validate(bp: &Blueprint) -> Blueprint {
    match validate(bp) {
        Ok(bp) => bp,
        Err(err) => panic!("must_validate: {err}"),
    }
}

fn normalise_homeserver(hs: &Homeserver) -> Result<Homeserver, BlueprintError> {
    let users = hs
        .users
        .iter()
        .map(|u| {
            let Some(localpart) = u.localpart.strip_prefix(USER_SIGIL) else {
                return Err(BlueprintError::MissingSigil {
                    homeserver: hs.name.clone(),
                    localpart: u.localpart.clone(),
                });
            };
            if localpart.contains(DOMAIN_SEPARATOR) {
                return Err(BlueprintError::LocalpartHasDomain {
                    homeserver: hs.name.clone(),
                    localpart: u.localpart.clone(),
                });
            }
            Ok(User {
                localpart: localpart.to_string(),
                ..u.clone()
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let rooms = hs
        .rooms
        .iter()
        .map(|r| normalise_room(&hs.name, r))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Homeserver {
        name: hs.name.clone(),
        users,
        rooms,
    })
}

/// Qualify a room's creator, senders and membership state keys with `hs_name`.
pub fn normalise_room(hs_name: &str, room: &Room) -> Result<Room, BlueprintError> {
    let mut out = room.clone();
    if !room.creator.is_empty() {
        out.creator = normalise_user(&room.creator, hs_name)?;
    } else if room.reference.is_empty() {
        return Err(BlueprintError::RoomWithoutRefOrCreator {
            homeserver: hs_name.to_string(),
        });
    }

    for event in &mut out.events {
        event.sender = normalise_user(&event.sender, hs_name)?;
        if event.event_type == MEMBER_EVENT {
            if let Some(state_key) = &event.state_key {
                event.state_key = Some(normalise_user(state_key, hs_name)?);
            }
        }
    }
    Ok(out)
}

/// Qualify a bare user identifier with `hs_name`.
///
/// An identifier that already carries a domain must carry this one.
pub fn normalise_user(user: &str, hs_name: &str) -> Result<String, BlueprintError> {
    if user.contains(DOMAIN_SEPARATOR) {
        if user.ends_with(&format!("{DOMAIN_SEPARATOR}{hs_name}")) {
            return Ok(user.to_string());
        }
        return Err(BlueprintError::ForeignUser {
            homeserver: hs_name.to_string(),
            user: user.to_string(),
        });
    }
    Ok(format!("{user}{DOMAIN_SEPARATOR}{hs_name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(localpart: &str) -> User {
        User {
            localpart: localpart.into(),
            display_name: localpart.trim_start_matches('@').into(),
            ..User::default()
        }
    }

    fn sample() -> Blueprint {
        Blueprint {
            name: "one_to_one_room".into(),
            homeservers: vec![Homeserver {
                name: "hs1".into(),
                users: vec![user("@alice"), user("@bob")],
                rooms: vec![Room {
                    creator: "@alice".into(),
                    create_room: json!({"preset": "public_chat"})
                        .as_object()
                        .cloned()
                        .unwrap(),
                    events: vec![
                        Event::state("m.room.member", "@bob", "@bob", json!({"membership": "join"})),
                        Event::message("m.room.message", "@bob:hs1", json!({"body": "hi"})),
                    ],
                    ..Room::default()
                }],
            }],
        }
    }

    #[test]
    fn validate_normalises_identifiers() {
        let bp = validate(&sample()).unwrap();
        let hs = &bp.homeservers[0];
        assert_eq!(hs.users[0].localpart, "alice");
        assert_eq!(hs.users[1].localpart, "bob");
        assert_eq!(hs.rooms[0].creator, "@alice:hs1");
        assert_eq!(hs.rooms[0].events[0].sender, "@bob:hs1");
        assert_eq!(hs.rooms[0].events[0].state_key.as_deref(), Some("@bob:hs1"));
        assert_eq!(hs.rooms[0].events[1].sender, "@bob:hs1");
    }

    #[test]
    fn validate_does_not_touch_input() {
        let original = sample();
        let _ = validate(&original).unwrap();
        assert_eq!(original, sample());
    }

    #[test]
    fn empty_name_rejected() {
        let mut bp = sample();
        bp.name.clear();
        assert_eq!(validate(&bp).unwrap_err(), BlueprintError::MissingName);
    }

    #[test]
    fn localpart_without_sigil_rejected() {
        let mut bp = sample();
        bp.homeservers[0].users.push(user("carol"));
        assert!(matches!(
            validate(&bp).unwrap_err(),
            BlueprintError::MissingSigil { .. }
        ));
    }

    #[test]
    fn localpart_with_domain_rejected() {
        let mut bp = sample();
        bp.homeservers[0].users.push(user("@carol:hs1"));
        assert!(matches!(
            validate(&bp).unwrap_err(),
            BlueprintError::LocalpartHasDomain { .. }
        ));
    }

    #[test]
    fn room_needs_ref_or_creator() {
        let mut bp = sample();
        bp.homeservers[0].rooms.push(Room::default());
        let err = validate(&bp).unwrap_err();
        assert_eq!(
            err,
            BlueprintError::RoomWithoutRefOrCreator {
                homeserver: "hs1".into()
            }
        );
        assert!(err.to_string().contains("ref or a creator"));

        bp.homeservers[0].rooms.last_mut().unwrap().reference = "shared".into();
        assert!(validate(&bp).is_ok());
    }

    #[test]
    fn sender_on_wrong_server_rejected() {
        let mut bp = sample();
        bp.homeservers[0].rooms[0]
            .events
            .push(Event::message("m.room.message", "@alice:hs2", json!({})));
        assert_eq!(
            validate(&bp).unwrap_err(),
            BlueprintError::ForeignUser {
                homeserver: "hs1".into(),
                user: "@alice:hs2".into()
            }
        );
    }

    #[test]
    fn non_member_state_keys_untouched() {
        let mut bp = sample();
        bp.homeservers[0].rooms[0].events.push(Event::state(
            "m.room.topic",
            "@alice",
            "",
            json!({"topic": "x"}),
        ));
        let bp = validate(&bp).unwrap();
        let topic = bp.homeservers[0].rooms[0].events.last().unwrap();
        assert_eq!(topic.state_key.as_deref(), Some(""));
    }

    #[test]
    fn room_and_event_layer_is_idempotent() {
        let bp = validate(&sample()).unwrap();
        let room = &bp.homeservers[0].rooms[0];
        assert_eq!(&normalise_room("hs1", room).unwrap(), room);
    }

    #[test]
    fn second_validate_trips_on_stripped_sigil() {
        let once = validate(&sample()).unwrap();
        assert!(matches!(
            validate(&once).unwrap_err(),
            BlueprintError::MissingSigil { .. }
        ));
    }

    #[test]
    fn user_id_reconstructed_either_side_of_normalisation() {
        let raw = sample();
        let normalised = validate(&raw).unwrap();
        let hs = &raw.homeservers[0];
        let nhs = &normalised.homeservers[0];
        assert_eq!(hs.user_id(&hs.users[0]), "@alice:hs1");
        assert_eq!(nhs.user_id(&nhs.users[0]), "@alice:hs1");
    }

    #[test]
    #[should_panic(expected = "must_validate")]
    fn must_validate_panics() {
        must_validate(&Blueprint::default());
    }
}
