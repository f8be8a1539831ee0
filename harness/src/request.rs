//! Signed server-to-server requests (`Authorization: X-Matrix ...`).

use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::crypto::{self, CryptoError, ServerIdentity};
use crate::keyring::{KeyRing, KeyRingError};
use crate::wire::{M_BAD_JSON, M_FORBIDDEN, M_UNAUTHORIZED, M_UNKNOWN};

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("missing Authorization header")]
    MissingAuthorization,
    #[error("malformed Authorization header: {0}")]
    MalformedAuthorization(String),
    #[error("request addressed to {got}, this server is {expected}")]
    WrongDestination { expected: String, got: String },
    #[error("request body is not JSON: {0}")]
    BadJson(#[from] serde_json::Error),
    #[error("cannot obtain signing key: {0}")]
    KeyRing(#[from] KeyRingError),
    #[error("request signature invalid: {0}")]
    BadSignature(#[source] CryptoError),
    #[error("signing request failed: {0}")]
    Signing(#[source] CryptoError),
}

impl RequestError {
    pub fn status(&self) -> StatusCode {
        match self {
            RequestError::WrongDestination { .. } => StatusCode::FORBIDDEN,
            RequestError::BadJson(_) => StatusCode::BAD_REQUEST,
            RequestError::Signing(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    pub fn errcode(&self) -> &'static str {
        match self {
            RequestError::WrongDestination { .. } => M_FORBIDDEN,
            RequestError::BadJson(_) => M_BAD_JSON,
            RequestError::Signing(_) => M_UNKNOWN,
            _ => M_UNAUTHORIZED,
        }
    }
}

/// The signable description of one federation request.
#[derive(Clone, Debug, PartialEq)]
pub struct FederationRequest {
    pub method: String,
    /// Path and query, exactly as sent.
    pub uri: String,
    pub origin: String,
    pub destination: String,
    pub content: Option<Value>,
}

impl FederationRequest {
    pub fn new(method: &str, uri: &str, origin: &str, destination: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            uri: uri.to_string(),
            origin: origin.to_string(),
            destination: destination.to_string(),
            content: None,
        }
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.content = Some(content);
        self
    }

    fn signable(&self) -> Value {
        let mut object = Map::new();
        object.insert("method".into(), json!(self.method));
        object.insert("uri".into(), json!(self.uri));
        object.insert("origin".into(), json!(self.origin));
        object.insert("destination".into(), json!(self.destination));
        if let Some(content) = &self.content {
            object.insert("content".into(), content.clone());
        }
        Value::Object(object)
    }

    /// The `Authorization` header value for this request, signed by `identity`.
    pub fn sign(&self, identity: &ServerIdentity) -> Result<String, RequestError> {
        let signed = crypto::sign_json(identity, &self.signable()).map_err(RequestError::Signing)?;
        let sig = signed["signatures"][identity.server_name()][identity.key_id()]
            .as_str()
            .unwrap_or_default();
        Ok(format!(
            r#"X-Matrix origin="{}",destination="{}",key="{}",sig="{}""#,
            self.origin,
            self.destination,
            identity.key_id(),
            sig
        ))
    }
}

/// Parsed `X-Matrix` credentials.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XMatrix {
    pub origin: String,
    pub destination: Option<String>,
    pub key: String,
    pub sig: String,
}

pub fn parse_authorization(header: &str) -> Result<XMatrix, RequestError> {
    let malformed = |why: &str| RequestError::MalformedAuthorization(why.to_string());
    let params = header
        .trim()
        .strip_prefix("X-Matrix")
        .filter(|rest| rest.starts_with(' '))
        .ok_or_else(|| malformed("scheme is not X-Matrix"))?;

    let (mut origin, mut destination, mut key, mut sig) = (None, None, None, None);
    for param in params.split(',') {
        let (name, value) = param
            .trim()
            .split_once('=')
            .ok_or_else(|| malformed("parameter without '='"))?;
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value)
            .to_string();
        match name.trim().to_ascii_lowercase().as_str() {
            "origin" => origin = Some(value),
            "destination" => destination = Some(value),
            "key" => key = Some(value),
            "sig" => sig = Some(value),
            _ => {}
        }
    }

    Ok(XMatrix {
        origin: origin.ok_or_else(|| malformed("missing origin"))?,
        destination,
        key: key.ok_or_else(|| malformed("missing key"))?,
        sig: sig.ok_or_else(|| malformed("missing sig"))?,
    })
}

/// Authenticate an inbound request addressed to `destination`.
///
/// Fails closed: anything short of a valid signature by a currently valid
/// key of the claimed origin is an error.
pub async fn verify_request(
    method: &str,
    uri: &str,
    headers: &HeaderMap,
    body: &[u8],
    destination: &str,
    key_ring: &KeyRing,
    now_ms: i64,
) -> Result<FederationRequest, RequestError> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or(RequestError::MissingAuthorization)?
        .to_str()
        .map_err(|_| RequestError::MalformedAuthorization("not visible ASCII".into()))?;
    let auth = parse_authorization(header)?;

    if let Some(got) = &auth.destination {
        if got != destination {
            return Err(RequestError::WrongDestination {
                expected: destination.to_string(),
                got: got.clone(),
            });
        }
    }

    let mut request = FederationRequest::new(method, uri, &auth.origin, destination);
    if !body.is_empty() {
        request.content = Some(serde_json::from_slice(body)?);
    }

    let public_key = key_ring.verify_key(&auth.origin, &auth.key, now_ms).await?;
    let mut signed = request.signable();
    signed["signatures"] = json!({ auth.origin.clone(): { auth.key.clone(): auth.sig.clone() } });
    crypto::verify_json(&auth.origin, &auth.key, &public_key, &signed)
        .map_err(RequestError::BadSignature)?;

    Ok(request)
}
