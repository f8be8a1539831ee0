//! Protocol events (PDUs) as seen by the impersonated peer.
//!
//! Only the event format shared by room versions 4 to 6 is modelled: event
//! IDs are URL-safe reference hashes and `prev_events`/`auth_events` are flat
//! lists of event IDs.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::crypto::{self, canonical_json, CryptoError, ServerIdentity, BASE64, BASE64_URL};

pub const M_ROOM_CREATE: &str = "m.room.create";
pub const M_ROOM_MEMBER: &str = "m.room.member";
pub const M_ROOM_POWER_LEVELS: &str = "m.room.power_levels";
pub const M_ROOM_JOIN_RULES: &str = "m.room.join_rules";
pub const M_ROOM_HISTORY_VISIBILITY: &str = "m.room.history_visibility";

pub const MEMBERSHIP_JOIN: &str = "join";
pub const MEMBERSHIP_INVITE: &str = "invite";

#[derive(Debug, Error)]
pub enum EventError {
    #[error("unsupported room version: {0}")]
    UnsupportedRoomVersion(String),
    #[error("event JSON is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("event is not a JSON object")]
    NotAnObject,
    #[error("event field '{0}' is missing")]
    MissingField(&'static str),
    #[error("event field '{0}' has the wrong type")]
    WrongType(&'static str),
    #[error("event content hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch { expected: String, computed: String },
    #[error("event content must be a JSON object")]
    ContentNotObject,
    #[error("signing failed: {0}")]
    Crypto(#[from] CryptoError),
}

/// Room versions whose event format this crate understands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomVersion {
    #[serde(rename = "4")]
    V4,
    #[serde(rename = "5")]
    V5,
    #[default]
    #[serde(rename = "6")]
    V6,
}

impl RoomVersion {
    pub const ALL: [RoomVersion; 3] = [RoomVersion::V4, RoomVersion::V5, RoomVersion::V6];

    pub fn as_str(&self) -> &'static str {
        match self {
            RoomVersion::V4 => "4",
            RoomVersion::V5 => "5",
            RoomVersion::V6 => "6",
        }
    }
}

impl fmt::Display for RoomVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoomVersion {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RoomVersion::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| EventError::UnsupportedRoomVersion(s.to_string()))
    }
}

/// A `(type, state_key)` pair identifying one slot of room state.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKeyTuple {
    pub event_type: String,
    pub state_key: String,
}

impl StateKeyTuple {
    pub fn new(event_type: &str, state_key: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            state_key: state_key.to_string(),
        }
    }
}

/// The state slots an event of this shape must cite in its `auth_events`.
///
/// Create events cite nothing. Everything else cites the create event, the
/// power levels and the sender's membership. Membership events additionally
/// cite the target's membership, and the join rules when joining or inviting.
pub fn state_needed_for(
    event_type: &str,
    sender: &str,
    state_key: Option<&str>,
    content: &Value,
) -> Vec<StateKeyTuple> {
    if event_type == M_ROOM_CREATE {
        return Vec::new();
    }

    let mut needed = vec![
        StateKeyTuple::new(M_ROOM_CREATE, ""),
        StateKeyTuple::new(M_ROOM_POWER_LEVELS, ""),
        StateKeyTuple::new(M_ROOM_MEMBER, sender),
    ];

    if event_type == M_ROOM_MEMBER {
        if let Some(target) = state_key {
            let tuple = StateKeyTuple::new(M_ROOM_MEMBER, target);
            if !needed.contains(&tuple) {
                needed.push(tuple);
            }
        }
        let membership = content.get("membership").and_then(Value::as_str);
        if matches!(membership, Some(MEMBERSHIP_JOIN) | Some(MEMBERSHIP_INVITE)) {
            needed.push(StateKeyTuple::new(M_ROOM_JOIN_RULES, ""));
        }
    }
    needed
}

/// An unsigned, unhashed event template.
///
/// This is what make-join hands back to the joining server, which fills in
/// `origin`, `origin_server_ts`, hashes and signatures itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventBuilder {
    pub sender: String,
    pub room_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    pub prev_events: Vec<String>,
    pub auth_events: Vec<String>,
    pub depth: i64,
    pub content: Value,
}

impl EventBuilder {
    pub fn new(sender: &str, room_id: &str, event_type: &str) -> Self {
        Self {
            sender: sender.to_string(),
            room_id: room_id.to_string(),
            event_type: event_type.to_string(),
            state_key: None,
            prev_events: Vec::new(),
            auth_events: Vec::new(),
            depth: 1,
            content: json!({}),
        }
    }

    pub fn with_state_key(mut self, state_key: &str) -> Self {
        self.state_key = Some(state_key.to_string());
        self
    }

    pub fn set_content<T: Serialize>(&mut self, content: T) -> Result<(), EventError> {
        let content = serde_json::to_value(content)?;
        if !content.is_object() {
            return Err(EventError::ContentNotObject);
        }
        self.content = content;
        Ok(())
    }

    /// The state slots this event's `auth_events` must reference.
    pub fn state_needed(&self) -> Vec<StateKeyTuple> {
        state_needed_for(
            &self.event_type,
            &self.sender,
            self.state_key.as_deref(),
            &self.content,
        )
    }

    /// Hash, sign and finalise the event as `identity`.
    pub fn build(
        &self,
        identity: &ServerIdentity,
        origin_server_ts: i64,
        version: RoomVersion,
    ) -> Result<Pdu, EventError> {
        let Value::Object(mut object) = serde_json::to_value(self)? else {
            return Err(EventError::NotAnObject);
        };
        object.insert("origin".into(), json!(identity.server_name()));
        object.insert("origin_server_ts".into(), json!(origin_server_ts));

        let value = Value::Object(object);
        let hash = content_hash(&value)?;
        let Value::Object(mut object) = value else {
            return Err(EventError::NotAnObject);
        };
        object.insert("hashes".into(), json!({ "sha256": hash }));

        let redacted = redact(&Value::Object(object.clone()));
        let signed = crypto::sign_json(identity, &redacted)?;
        object.insert("signatures".into(), signed["signatures"].clone());

        Pdu::from_object(object, version)
    }
}

/// A complete, hashed and signed event with a derived event ID.
#[derive(Clone, Debug, PartialEq)]
pub struct Pdu {
    event_id: String,
    version: RoomVersion,
    room_id: String,
    event_type: String,
    state_key: Option<String>,
    sender: String,
    prev_events: Vec<String>,
    auth_events: Vec<String>,
    depth: i64,
    json: Map<String, Value>,
}

impl Serialize for Pdu {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.json.serialize(serializer)
    }
}

impl Pdu {
    /// Parse an event received from a remote server.
    ///
    /// The input is untrusted: it must be a structurally valid event for
    /// `version` and its content hash must match.
    pub fn from_untrusted_json(bytes: &[u8], version: RoomVersion) -> Result<Self, EventError> {
        let Value::Object(mut object) = serde_json::from_slice::<Value>(bytes)? else {
            return Err(EventError::NotAnObject);
        };
        // Event IDs are derived in this format, never carried.
        object.remove("event_id");

        let expected = object
            .get("hashes")
            .ok_or(EventError::MissingField("hashes"))?
            .get("sha256")
            .ok_or(EventError::MissingField("hashes.sha256"))?
            .as_str()
            .ok_or(EventError::WrongType("hashes.sha256"))?
            .to_string();
        let computed = content_hash(&Value::Object(object.clone()))?;
        if BASE64.decode(&expected).ok() != BASE64.decode(&computed).ok() {
            return Err(EventError::HashMismatch { expected, computed });
        }

        Self::from_object(object, version)
    }

    fn from_object(object: Map<String, Value>, version: RoomVersion) -> Result<Self, EventError> {
        let room_id = required_str(&object, "room_id")?;
        let event_type = required_str(&object, "type")?;
        let sender = required_str(&object, "sender")?;
        if !object
            .get("origin_server_ts")
            .ok_or(EventError::MissingField("origin_server_ts"))?
            .is_i64()
        {
            return Err(EventError::WrongType("origin_server_ts"));
        }
        if !object
            .get("content")
            .ok_or(EventError::MissingField("content"))?
            .is_object()
        {
            return Err(EventError::WrongType("content"));
        }
        if !object
            .get("signatures")
            .ok_or(EventError::MissingField("signatures"))?
            .is_object()
        {
            return Err(EventError::WrongType("signatures"));
        }
        let state_key = match object.get("state_key") {
            None => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => return Err(EventError::WrongType("state_key")),
        };
        let depth = object
            .get("depth")
            .ok_or(EventError::MissingField("depth"))?
            .as_i64()
            .filter(|d| *d >= 0)
            .ok_or(EventError::WrongType("depth"))?;
        let prev_events = string_list(&object, "prev_events")?;
        let auth_events = string_list(&object, "auth_events")?;

        let event_id = reference_event_id(&Value::Object(object.clone()))?;

        Ok(Self {
            event_id,
            version,
            room_id,
            event_type,
            state_key,
            sender,
            prev_events,
            auth_events,
            depth,
            json: object,
        })
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// The room version this event was built or parsed for.
    pub fn room_version(&self) -> RoomVersion {
        self.version
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn state_key(&self) -> Option<&str> {
        self.state_key.as_deref()
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn content(&self) -> &Value {
        // Presence and shape checked at construction.
        self.json.get("content").unwrap_or(&Value::Null)
    }

    /// `content.membership` for membership events.
    pub fn membership(&self) -> Option<&str> {
        self.content().get("membership").and_then(Value::as_str)
    }

    pub fn prev_events(&self) -> &[String] {
        &self.prev_events
    }

    pub fn auth_events(&self) -> &[String] {
        &self.auth_events
    }

    pub fn depth(&self) -> i64 {
        self.depth
    }

    /// The state slot this event fills, if it is a state event.
    pub fn state_tuple(&self) -> Option<StateKeyTuple> {
        self.state_key
            .as_deref()
            .map(|key| StateKeyTuple::new(&self.event_type, key))
    }

    pub fn json(&self) -> Value {
        Value::Object(self.json.clone())
    }
}

fn required_str(object: &Map<String, Value>, field: &'static str) -> Result<String, EventError> {
    object
        .get(field)
        .ok_or(EventError::MissingField(field))?
        .as_str()
        .map(str::to_string)
        .ok_or(EventError::WrongType(field))
}

fn string_list(object: &Map<String, Value>, field: &'static str) -> Result<Vec<String>, EventError> {
    object
        .get(field)
        .ok_or(EventError::MissingField(field))?
        .as_array()
        .ok_or(EventError::WrongType(field))?
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or(EventError::WrongType(field))
        })
        .collect()
}

fn sha256(bytes: &[u8]) -> Vec<u8> {
    Sha256::digest(bytes).to_vec()
}

fn without_keys(value: &Value, keys: &[&str]) -> Result<Value, EventError> {
    let Value::Object(object) = value else {
        return Err(EventError::NotAnObject);
    };
    let mut object = object.clone();
    for key in keys {
        object.remove(*key);
    }
    Ok(Value::Object(object))
}

/// SHA-256 over the event minus `unsigned`, `signatures` and `hashes`.
pub fn content_hash(event: &Value) -> Result<String, EventError> {
    let hashable = without_keys(event, &["unsigned", "signatures", "hashes"])?;
    Ok(BASE64.encode(sha256(&canonical_json(&hashable)?)))
}

/// `$` + URL-safe reference hash of the redacted event.
pub fn reference_event_id(event: &Value) -> Result<String, EventError> {
    let redacted = redact(event);
    let hashable = without_keys(&redacted, &["unsigned", "signatures", "age_ts"])?;
    Ok(format!(
        "${}",
        BASE64_URL.encode(sha256(&canonical_json(&hashable)?))
    ))
}

const ESSENTIAL_KEYS: &[&str] = &[
    "event_id",
    "type",
    "room_id",
    "sender",
    "state_key",
    "content",
    "hashes",
    "signatures",
    "depth",
    "prev_events",
    "prev_state",
    "auth_events",
    "origin",
    "origin_server_ts",
    "membership",
];

fn essential_content_keys(event_type: &str) -> &'static [&'static str] {
    match event_type {
        M_ROOM_MEMBER => &["membership"],
        M_ROOM_CREATE => &["creator"],
        M_ROOM_JOIN_RULES => &["join_rule"],
        M_ROOM_POWER_LEVELS => &[
            "ban",
            "events",
            "events_default",
            "kick",
            "redact",
            "state_default",
            "users",
            "users_default",
        ],
        M_ROOM_HISTORY_VISIBILITY => &["history_visibility"],
        _ => &[],
    }
}

/// Strip an event down to the keys that survive redaction.
///
/// Non-object input is returned unchanged.
pub fn redact(event: &Value) -> Value {
    let Value::Object(object) = event else {
        return event.clone();
    };
    let event_type = object.get("type").and_then(Value::as_str).unwrap_or_default();
    let keep_content = essential_content_keys(event_type);

    let mut out = Map::new();
    for (key, value) in object {
        if !ESSENTIAL_KEYS.contains(&key.as_str()) {
            continue;
        }
        if key == "content" {
            let content = value
                .as_object()
                .map(|c| {
                    c.iter()
                        .filter(|(k, _)| keep_content.contains(&k.as_str()))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect::<Map<_, _>>()
                })
                .unwrap_or_default();
            out.insert(key.clone(), Value::Object(content));
        } else {
            out.insert(key.clone(), value.clone());
        }
    }
    Value::Object(out)
}
