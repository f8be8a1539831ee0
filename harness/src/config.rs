use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

pub const ENV_DEBUG: &str = "TANDEM_DEBUG";
pub const ENV_SYNC_TIMEOUT_SECS: &str = "TANDEM_SYNC_TIMEOUT_SECS";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "TANDEM_REQUEST_TIMEOUT_SECS";
pub const ENV_PEER_ADDR: &str = "PEER_ADDR";
pub const ENV_PEER_SERVER_NAME: &str = "PEER_SERVER_NAME";
pub const ENV_PEER_KEY_SERVERS: &str = "PEER_KEY_SERVERS";
pub const ENV_PEER_SIGNING_KEY: &str = "PEER_SIGNING_KEY";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

/// Settings shared by every protocol client a test creates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Log every request and response.
    pub debug: bool,
    /// Deadline for sync-based polling.
    pub sync_until_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            debug: false,
            sync_until_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl HarnessConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            debug: lookup(ENV_DEBUG).map(|v| is_truthy(&v)).unwrap_or(false),
            sync_until_timeout: secs(&lookup, ENV_SYNC_TIMEOUT_SECS)?
                .unwrap_or(defaults.sync_until_timeout),
            request_timeout: secs(&lookup, ENV_REQUEST_TIMEOUT_SECS)?
                .unwrap_or(defaults.request_timeout),
        })
    }
}

/// Settings for the standalone peer binary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerConfig {
    pub bind_addr: SocketAddr,
    pub server_name: String,
    /// server name -> base URL for fetching signing keys.
    pub key_servers: BTreeMap<String, String>,
    /// Base64 PKCS#8 Ed25519 key; a fresh key is generated when absent.
    pub signing_key: Option<String>,
}

impl PeerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = match lookup(ENV_PEER_ADDR) {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                var: ENV_PEER_ADDR,
                value: raw.clone(),
            })?,
            None => SocketAddr::from(([0, 0, 0, 0], 8448)),
        };
        let server_name = lookup(ENV_PEER_SERVER_NAME)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "peer.local".to_string());

        let mut key_servers = BTreeMap::new();
        if let Some(raw) = lookup(ENV_PEER_KEY_SERVERS) {
            for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                let (name, url) = entry
                    .split_once('=')
                    .filter(|(n, u)| !n.is_empty() && !u.is_empty())
                    .ok_or_else(|| ConfigError::InvalidValue {
                        var: ENV_PEER_KEY_SERVERS,
                        value: entry.to_string(),
                    })?;
                key_servers.insert(name.to_string(), url.trim_end_matches('/').to_string());
            }
        }

        Ok(Self {
            bind_addr,
            server_name,
            key_servers,
            signing_key: lookup(ENV_PEER_SIGNING_KEY).filter(|k| !k.trim().is_empty()),
        })
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    lookup(var)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::InvalidValue { var, value: raw.clone() })
        })
        .transpose()
}
