use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::crypto::{self, CryptoError, ServerIdentity};
use crate::deployment::{Deployment, DeploymentError};
use crate::wire::ServerKeys;

#[derive(Debug, Error)]
pub enum KeyRingError {
    #[error("no key document available for {0}")]
    NotFound(String),
    #[error("key fetch from {server_name} failed: {source}")]
    Http {
        server_name: String,
        #[source]
        source: reqwest::Error,
    },
    #[error(transparent)]
    Deployment(#[from] DeploymentError),
    #[error("malformed key document: {0}")]
    InvalidDocument(#[from] serde_json::Error),
    #[error("key document is for {got}, expected {expected}")]
    ServerNameMismatch { expected: String, got: String },
    #[error("key document self-signature invalid: {0}")]
    BadSignature(#[from] CryptoError),
    #[error("{server_name} has no key {key_id}")]
    UnknownKey { server_name: String, key_id: String },
    #[error("keys of {server_name} expired at {valid_until_ts}")]
    Expired {
        server_name: String,
        valid_until_ts: i64,
    },
}

/// Source of raw, signed key documents.
#[async_trait]
pub trait KeyFetcher: Send + Sync {
    async fn fetch(&self, server_name: &str) -> Result<Value, KeyRingError>;
}

/// Fetches `/_matrix/key/v2/server` from servers in a deployment.
pub struct HttpKeyFetcher {
    http: reqwest::Client,
    deployment: Arc<dyn Deployment>,
}

impl HttpKeyFetcher {
    pub fn new(http: reqwest::Client, deployment: Arc<dyn Deployment>) -> Self {
        Self { http, deployment }
    }
}

#[async_trait]
impl KeyFetcher for HttpKeyFetcher {
    async fn fetch(&self, server_name: &str) -> Result<Value, KeyRingError> {
        let base_url = self.deployment.base_url(server_name)?;
        let url = format!("{base_url}/_matrix/key/v2/server");
        tracing::debug!(server_name, %url, "fetching server keys");

        let http_err = |source| KeyRingError::Http {
            server_name: server_name.to_string(),
            source,
        };
        self.http
            .get(url.as_str())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(http_err)?
            .json::<Value>()
            .await
            .map_err(http_err)
    }
}

/// In-memory key documents, for peers sharing a process.
#[derive(Clone, Debug, Default)]
pub struct StaticKeyFetcher {
    docs: HashMap<String, Value>,
}

impl StaticKeyFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `identity`'s key, self-signed and valid until `valid_until_ts`.
    pub fn with_identity(
        mut self,
        identity: &ServerIdentity,
        valid_until_ts: i64,
    ) -> Result<Self, KeyRingError> {
        let doc = ServerKeys::signed(identity, valid_until_ts)?;
        self.docs.insert(identity.server_name().to_string(), doc);
        Ok(self)
    }

    pub fn with_document(mut self, server_name: &str, doc: Value) -> Self {
        self.docs.insert(server_name.to_string(), doc);
        self
    }
}

#[async_trait]
impl KeyFetcher for StaticKeyFetcher {
    async fn fetch(&self, server_name: &str) -> Result<Value, KeyRingError> {
        self.docs
            .get(server_name)
            .cloned()
            .ok_or_else(|| KeyRingError::NotFound(server_name.to_string()))
    }
}

/// Parse a key document and check it is signed by every key it lists.
pub fn verify_server_keys(doc: &Value) -> Result<ServerKeys, KeyRingError> {
    let keys: ServerKeys = serde_json::from_value(doc.clone())?;
    for (key_id, verify_key) in &keys.verify_keys {
        crypto::verify_json(&keys.server_name, key_id, &verify_key.key, doc)?;
    }
    Ok(keys)
}

/// Cache of verified server signing keys.
pub struct KeyRing {
    fetcher: Arc<dyn KeyFetcher>,
    cache: RwLock<HashMap<String, ServerKeys>>,
}

impl KeyRing {
    pub fn new(fetcher: Arc<dyn KeyFetcher>) -> Self {
        Self {
            fetcher,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// The public key `server_name` uses as `key_id`, valid at `at_ms`.
    pub async fn verify_key(
        &self,
        server_name: &str,
        key_id: &str,
        at_ms: i64,
    ) -> Result<String, KeyRingError> {
        if let Some(keys) = self.cache.read().await.get(server_name) {
            if keys.valid_until_ts >= at_ms {
                if let Some(key) = keys.key(key_id) {
                    return Ok(key.to_string());
                }
            }
        }

        let doc = self.fetcher.fetch(server_name).await?;
        let keys = verify_server_keys(&doc)?;
        if keys.server_name != server_name {
            return Err(KeyRingError::ServerNameMismatch {
                expected: server_name.to_string(),
                got: keys.server_name,
            });
        }
        tracing::debug!(server_name, valid_until_ts = keys.valid_until_ts, "server keys fetched");

        let result = if keys.valid_until_ts < at_ms {
            Err(KeyRingError::Expired {
                server_name: server_name.to_string(),
                valid_until_ts: keys.valid_until_ts,
            })
        } else {
            keys.key(key_id)
                .map(str::to_string)
                .ok_or_else(|| KeyRingError::UnknownKey {
                    server_name: server_name.to_string(),
                    key_id: key_id.to_string(),
                })
        };
        self.cache.write().await.insert(server_name.to_string(), keys);
        result
    }
}
