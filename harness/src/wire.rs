//! JSON bodies exchanged with the system under test.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::{self, CryptoError, ServerIdentity};
use crate::event::{EventBuilder, RoomVersion};

pub const M_UNAUTHORIZED: &str = "M_UNAUTHORIZED";
pub const M_FORBIDDEN: &str = "M_FORBIDDEN";
pub const M_NOT_FOUND: &str = "M_NOT_FOUND";
pub const M_MISSING_PARAM: &str = "M_MISSING_PARAM";
pub const M_BAD_JSON: &str = "M_BAD_JSON";
pub const M_INCOMPATIBLE_ROOM_VERSION: &str = "M_INCOMPATIBLE_ROOM_VERSION";
pub const M_UNKNOWN: &str = "M_UNKNOWN";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyKey {
    pub key: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OldVerifyKey {
    pub key: String,
    pub expired_ts: i64,
}

/// A server's published key document (`GET /_matrix/key/v2/server`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerKeys {
    pub server_name: String,
    pub verify_keys: BTreeMap<String, VerifyKey>,
    #[serde(default)]
    pub old_verify_keys: BTreeMap<String, OldVerifyKey>,
    pub valid_until_ts: i64,
    #[serde(default)]
    pub signatures: BTreeMap<String, BTreeMap<String, String>>,
}

impl ServerKeys {
    /// The unsigned key document for `identity`.
    pub fn for_identity(identity: &ServerIdentity, valid_until_ts: i64) -> Self {
        let mut verify_keys = BTreeMap::new();
        verify_keys.insert(
            identity.key_id().to_string(),
            VerifyKey {
                key: identity.public_key_base64(),
            },
        );
        Self {
            server_name: identity.server_name().to_string(),
            verify_keys,
            old_verify_keys: BTreeMap::new(),
            valid_until_ts,
            signatures: BTreeMap::new(),
        }
    }

    /// The key document for `identity`, self-signed, as sent on the wire.
    pub fn signed(identity: &ServerIdentity, valid_until_ts: i64) -> Result<Value, CryptoError> {
        let doc = serde_json::to_value(Self::for_identity(identity, valid_until_ts))?;
        crypto::sign_json(identity, &doc)
    }

    pub fn key(&self, key_id: &str) -> Option<&str> {
        self.verify_keys
            .get(key_id)
            .map(|k| k.key.as_str())
            .or_else(|| self.old_verify_keys.get(key_id).map(|k| k.key.as_str()))
    }
}

/// make-join response: the unsigned join template and the room version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RespMakeJoin {
    pub event: EventBuilder,
    pub room_version: RoomVersion,
}

/// send-join response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RespSendJoin {
    pub auth_chain: Vec<Value>,
    pub state: Vec<Value>,
    pub origin: String,
}

/// Directory (alias) query response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RespDirectory {
    pub room_id: String,
    pub servers: Vec<String>,
}

/// Protocol-shaped error body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub errcode: String,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(errcode: &str, error: impl Into<String>) -> Self {
        Self {
            errcode: errcode.to_string(),
            error: error.into(),
        }
    }

    pub fn not_found(error: impl Into<String>) -> Self {
        Self::new(M_NOT_FOUND, error)
    }

    pub fn unknown(error: impl Into<String>) -> Self {
        Self::new(M_UNKNOWN, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signed_key_document_verifies_and_detects_tampering() {
        let id = ServerIdentity::from_seed("peer.test", &[9u8; 32]).unwrap();
        let doc = ServerKeys::signed(&id, 1_000).unwrap();

        let key = doc["verify_keys"][id.key_id()]["key"].as_str().unwrap().to_string();
        crypto::verify_json("peer.test", id.key_id(), &key, &doc).unwrap();

        let mut tampered = doc.clone();
        tampered["valid_until_ts"] = json!(1_001);
        assert!(crypto::verify_json("peer.test", id.key_id(), &key, &tampered).is_err());
    }

    #[test]
    fn key_document_shape() {
        let id = ServerIdentity::from_seed("peer.test", &[9u8; 32]).unwrap();
        let doc = ServerKeys::signed(&id, 42).unwrap();
        assert_eq!(doc["server_name"], "peer.test");
        assert_eq!(doc["valid_until_ts"], 42);
        assert_eq!(doc["old_verify_keys"], json!({}));
        assert!(doc["signatures"]["peer.test"][id.key_id()].is_string());

        let parsed: ServerKeys = serde_json::from_value(doc).unwrap();
        assert_eq!(parsed.key(id.key_id()), Some(id.public_key_base64().as_str()));
    }

    #[test]
    fn error_body_shape() {
        let body = serde_json::to_value(ErrorResponse::not_found("Unknown room")).unwrap();
        assert_eq!(body, json!({"errcode": "M_NOT_FOUND", "error": "Unknown room"}));
    }
}
