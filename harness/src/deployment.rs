use std::collections::HashMap;

use thiserror::Error;

use crate::client::ClientApi;
use crate::config::HarnessConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeploymentError {
    #[error("no homeserver named {0} in this deployment")]
    UnknownServer(String),
    #[error("user {user_id} is not registered on {server_name}")]
    UnknownUser { server_name: String, user_id: String },
}

/// A set of running homeservers a test can talk to.
///
/// Provisioning is someone else's job; this only answers where each server
/// lives and hands out clients bound to it.
pub trait Deployment: Send + Sync {
    /// Base URL of `server_name` as reachable from this process.
    fn base_url(&self, server_name: &str) -> Result<String, DeploymentError>;

    /// A client for `user_id` on `server_name`. An empty `user_id` yields
    /// an unauthenticated client.
    fn client(&self, server_name: &str, user_id: &str) -> Result<ClientApi, DeploymentError>;
}

/// Map-backed deployment for servers started outside the harness.
#[derive(Clone, Debug, Default)]
pub struct StaticDeployment {
    config: HarnessConfig,
    http: reqwest::Client,
    servers: HashMap<String, String>,
    /// (server name, user ID) -> access token
    access_tokens: HashMap<(String, String), String>,
}

impl StaticDeployment {
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn with_server(mut self, server_name: &str, base_url: &str) -> Self {
        self.servers.insert(
            server_name.to_string(),
            base_url.trim_end_matches('/').to_string(),
        );
        self
    }

    pub fn with_user(mut self, server_name: &str, user_id: &str, access_token: &str) -> Self {
        self.access_tokens.insert(
            (server_name.to_string(), user_id.to_string()),
            access_token.to_string(),
        );
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }
}

impl Deployment for StaticDeployment {
    fn base_url(&self, server_name: &str) -> Result<String, DeploymentError> {
        self.servers
            .get(server_name)
            .cloned()
            .ok_or_else(|| DeploymentError::UnknownServer(server_name.to_string()))
    }

    fn client(&self, server_name: &str, user_id: &str) -> Result<ClientApi, DeploymentError> {
        let base_url = self.base_url(server_name)?;
        let access_token = if user_id.is_empty() {
            String::new()
        } else {
            self.access_tokens
                .get(&(server_name.to_string(), user_id.to_string()))
                .cloned()
                .ok_or_else(|| DeploymentError::UnknownUser {
                    server_name: server_name.to_string(),
                    user_id: user_id.to_string(),
                })?
        };
        Ok(ClientApi::new(
            self.http.clone(),
            &base_url,
            user_id,
            &access_token,
            &self.config,
        ))
    }
}
