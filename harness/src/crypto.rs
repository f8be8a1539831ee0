use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use ring::rand::SystemRandom;
use ring::signature::{self, Ed25519KeyPair, KeyPair, UnparsedPublicKey};
use serde_json::{Map, Value};
use thiserror::Error;

const UNPADDED: GeneralPurposeConfig = GeneralPurposeConfig::new()
    .with_encode_padding(false)
    .with_decode_padding_mode(DecodePaddingMode::Indifferent);

/// Unpadded standard base64, used for keys, signatures and content hashes.
/// Decoding accepts padded input too.
pub const BASE64: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, UNPADDED);

/// Unpadded URL-safe base64, used for reference-hash event IDs.
pub const BASE64_URL: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, UNPADDED);

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed")]
    KeyGeneration,
    #[error("signature verification failed")]
    VerificationFailed,
    #[error("invalid key material")]
    InvalidKey,
    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
    #[error("cannot sign or verify a non-object JSON value")]
    NotAnObject,
    #[error("no signature from {server_name} with key {key_id}")]
    MissingSignature { server_name: String, key_id: String },
    #[error("json encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The Ed25519 signing identity of one (impersonated) homeserver.
///
/// Owned by whoever constructs a peer server and shared with its handlers
/// behind an `Arc`, so several identities can coexist in one process.
pub struct ServerIdentity {
    server_name: String,
    key_id: String,
    key_pair: Ed25519KeyPair,
}

impl std::fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("server_name", &self.server_name)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl ServerIdentity {
    /// Generate a fresh Ed25519 key pair using the OS CSPRNG.
    pub fn generate(server_name: &str) -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let pkcs8_bytes =
            Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| CryptoError::KeyGeneration)?;
        let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8_bytes.as_ref())
            .map_err(|_| CryptoError::KeyGeneration)?;
        Ok(Self::with_key_pair(server_name, key_pair))
    }

    /// Reconstruct from a base64-encoded PKCS#8 document (v1 or v2).
    pub fn from_pkcs8_base64(server_name: &str, encoded: &str) -> Result<Self, CryptoError> {
        let der = BASE64.decode(encoded.trim())?;
        let key_pair =
            Ed25519KeyPair::from_pkcs8_maybe_unchecked(&der).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self::with_key_pair(server_name, key_pair))
    }

    /// Deterministic identity from a 32-byte seed.
    pub fn from_seed(server_name: &str, seed: &[u8]) -> Result<Self, CryptoError> {
        let key_pair =
            Ed25519KeyPair::from_seed_unchecked(seed).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self::with_key_pair(server_name, key_pair))
    }

    fn with_key_pair(server_name: &str, key_pair: Ed25519KeyPair) -> Self {
        // Key ID versions are restricted to [a-zA-Z0-9_], hex of the key prefix fits.
        let version: String = key_pair.public_key().as_ref()[..4]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        Self {
            server_name: server_name.to_string(),
            key_id: format!("ed25519:{version}"),
            key_pair,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Public key as unpadded base64.
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.key_pair.public_key().as_ref())
    }

    /// Sign an arbitrary byte message, returning the unpadded base64 signature.
    pub fn sign(&self, message: &[u8]) -> String {
        BASE64.encode(self.key_pair.sign(message).as_ref())
    }
}

/// Verify an Ed25519 signature against a base64 public key and message.
pub fn verify(public_key: &str, message: &[u8], signature: &str) -> Result<(), CryptoError> {
    let key_bytes = BASE64.decode(public_key)?;
    let sig_bytes = BASE64.decode(signature)?;

    UnparsedPublicKey::new(&signature::ED25519, &key_bytes)
        .verify(message, &sig_bytes)
        .map_err(|_| CryptoError::VerificationFailed)
}

/// Canonical JSON: compact, object keys in lexicographic order.
///
/// `serde_json::Map` is a `BTreeMap` unless `preserve_order` is enabled, so
/// compact serialization of a `Value` is already canonical.
pub fn canonical_json(value: &Value) -> Result<Vec<u8>, CryptoError> {
    Ok(serde_json::to_vec(value)?)
}

/// Split a JSON object into its signable part and its `signatures`/`unsigned` members.
fn split_signable(value: &Value) -> Result<(Map<String, Value>, Option<Value>, Option<Value>), CryptoError> {
    let Value::Object(object) = value else {
        return Err(CryptoError::NotAnObject);
    };
    let mut object = object.clone();
    let signatures = object.remove("signatures");
    let unsigned = object.remove("unsigned");
    Ok((object, signatures, unsigned))
}

/// Sign a JSON object, merging this identity's signature into `signatures`.
pub fn sign_json(identity: &ServerIdentity, value: &Value) -> Result<Value, CryptoError> {
    let (mut object, signatures, unsigned) = split_signable(value)?;
    let sig = identity.sign(&canonical_json(&Value::Object(object.clone()))?);

    let mut signatures = match signatures {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let entry = signatures
        .entry(identity.server_name().to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    if let Value::Object(keys) = entry {
        keys.insert(identity.key_id().to_string(), Value::String(sig));
    }

    object.insert("signatures".into(), Value::Object(signatures));
    if let Some(unsigned) = unsigned {
        object.insert("unsigned".into(), unsigned);
    }
    Ok(Value::Object(object))
}

/// Verify the signature `server_name` made over `value` with `key_id`.
pub fn verify_json(
    server_name: &str,
    key_id: &str,
    public_key: &str,
    value: &Value,
) -> Result<(), CryptoError> {
    let (object, signatures, _) = split_signable(value)?;
    let signature = signatures
        .as_ref()
        .and_then(|s| s.get(server_name))
        .and_then(|s| s.get(key_id))
        .and_then(Value::as_str)
        .ok_or_else(|| CryptoError::MissingSignature {
            server_name: server_name.to_string(),
            key_id: key_id.to_string(),
        })?;
    verify(
        public_key,
        &canonical_json(&Value::Object(object))?,
        signature,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generate_and_sign_verify() {
        let id = ServerIdentity::generate("hs1").unwrap();
        let msg = b"hello federation";

        let sig = id.sign(msg);
        assert!(verify(&id.public_key_base64(), msg, &sig).is_ok());
    }

    #[test]
    fn verify_rejects_wrong_message() {
        let id = ServerIdentity::generate("hs1").unwrap();
        let sig = id.sign(b"correct message");

        assert!(verify(&id.public_key_base64(), b"wrong message", &sig).is_err());
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let id_a = ServerIdentity::generate("hs1").unwrap();
        let id_b = ServerIdentity::generate("hs2").unwrap();
        let sig = id_a.sign(b"hello");

        assert!(verify(&id_b.public_key_base64(), b"hello", &sig).is_err());
    }

    #[test]
    fn seeded_identity_is_deterministic() {
        let a = ServerIdentity::from_seed("hs1", &[7u8; 32]).unwrap();
        let b = ServerIdentity::from_seed("hs1", &[7u8; 32]).unwrap();
        assert_eq!(a.public_key_base64(), b.public_key_base64());
        assert_eq!(a.key_id(), b.key_id());
        assert!(a.key_id().starts_with("ed25519:"));
    }

    #[test]
    fn encodings_are_unpadded() {
        let id = ServerIdentity::generate("hs1").unwrap();
        assert!(!id.public_key_base64().ends_with('='));
        assert!(!id.sign(b"x").ends_with('='));
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let value = json!({"b": 1, "a": {"d": true, "c": null}});
        let bytes = canonical_json(&value).unwrap();
        assert_eq!(bytes, br#"{"a":{"c":null,"d":true},"b":1}"#);
    }

    #[test]
    fn signed_json_verifies_and_ignores_unsigned() {
        let id = ServerIdentity::generate("hs1").unwrap();
        let signed = sign_json(&id, &json!({"foo": "bar", "unsigned": {"age": 5}})).unwrap();
        assert_eq!(signed["unsigned"]["age"], 5);

        let mut altered = signed.clone();
        altered["unsigned"]["age"] = json!(99);
        verify_json("hs1", id.key_id(), &id.public_key_base64(), &altered).unwrap();

        altered["foo"] = json!("baz");
        assert!(verify_json("hs1", id.key_id(), &id.public_key_base64(), &altered).is_err());
    }

    #[test]
    fn signing_keeps_existing_signatures() {
        let a = ServerIdentity::generate("hs1").unwrap();
        let b = ServerIdentity::generate("hs2").unwrap();
        let once = sign_json(&a, &json!({"x": 1})).unwrap();
        let twice = sign_json(&b, &once).unwrap();

        verify_json("hs1", a.key_id(), &a.public_key_base64(), &twice).unwrap();
        verify_json("hs2", b.key_id(), &b.public_key_base64(), &twice).unwrap();
    }

    #[test]
    fn missing_signature_reported() {
        let id = ServerIdentity::generate("hs1").unwrap();
        let err = verify_json("hs1", id.key_id(), &id.public_key_base64(), &json!({"x": 1}))
            .unwrap_err();
        assert!(matches!(err, CryptoError::MissingSignature { .. }));
    }
}
