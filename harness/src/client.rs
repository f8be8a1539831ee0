//! HTTP clients a test drives homeservers with.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, Method, StatusCode};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::assertions::{self, escape_path_segment, json_field, json_field_str, AssertionError};
use crate::blueprint;
use crate::config::HarnessConfig;
use crate::crypto::ServerIdentity;
use crate::poll::{poll_until, Batch, ObservationSource, PollError};
use crate::request::{FederationRequest, RequestError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{method} {url} returned HTTP {status}: {body}")]
    Status {
        method: Method,
        url: String,
        status: StatusCode,
        body: String,
    },
    #[error(transparent)]
    Assertion(#[from] AssertionError),
    #[error("cannot decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Signing(#[from] RequestError),
    #[error("sync timed out after {elapsed:?}: called check {checked} times over {fetches} syncs")]
    SyncTimedOut {
        checked: usize,
        fetches: usize,
        elapsed: Duration,
    },
}

impl From<PollError<ClientError>> for ClientError {
    fn from(err: PollError<ClientError>) -> Self {
        match err {
            PollError::TimedOut {
                checked,
                fetches,
                elapsed,
            } => ClientError::SyncTimedOut {
                checked,
                fetches,
                elapsed,
            },
            PollError::Fetch { source, .. } => source,
        }
    }
}

/// `base_url` + URL-escaped `paths` + `query`.
pub fn build_url(base_url: &str, paths: &[&str], query: &[(&str, &str)]) -> Result<Url, ClientError> {
    let invalid = |reason: String| ClientError::InvalidUrl {
        url: base_url.to_string(),
        reason,
    };
    let mut url = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| invalid("cannot be a base".to_string()))?
        .pop_if_empty()
        .extend(paths);
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }
    Ok(url)
}

/// A fully read HTTP response.
#[derive(Clone, Debug)]
pub struct ClientResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ClientResponse {
    async fn read(res: reqwest::Response) -> Result<Self, ClientError> {
        Ok(Self {
            status: res.status(),
            headers: res.headers().clone(),
            body: res.bytes().await?,
        })
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn body_json(&self) -> Result<Value, AssertionError> {
        assertions::parse_json(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Client-server API access as one user of one homeserver.
#[derive(Debug)]
pub struct ClientApi {
    user_id: String,
    access_token: String,
    base_url: String,
    http: reqwest::Client,
    sync_until_timeout: Duration,
    request_timeout: Duration,
    debug: bool,
    txn_id: AtomicU64,
}

impl ClientApi {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        user_id: &str,
        access_token: &str,
        config: &HarnessConfig,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            access_token: access_token.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            sync_until_timeout: config.sync_until_timeout,
            request_timeout: config.request_timeout,
            debug: config.debug,
            txn_id: AtomicU64::new(0),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn sync_until_timeout(&self) -> Duration {
        self.sync_until_timeout
    }

    /// Send a JSON request without credentials.
    pub async fn do_request(
        &self,
        method: Method,
        paths: &[&str],
        body: Option<&Value>,
        query: &[(&str, &str)],
    ) -> Result<ClientResponse, ClientError> {
        let url = build_url(&self.base_url, paths, query)?;
        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .timeout(self.request_timeout)
            .header(CONTENT_TYPE, "application/json");
        if let Some(body) = body {
            request = request.body(serde_json::to_vec(body)?);
        }

        if self.debug {
            let shown = body.unwrap_or(&Value::Null);
            info!(%method, %url, body = %shown, "client request");
        }
        let start = Instant::now();
        let res = ClientResponse::read(request.send().await?).await?;
        if self.debug {
            info!(%method, %url, status = %res.status, elapsed = ?start.elapsed(), body = %res.text(), "client response");
        } else {
            debug!(%method, path = url.path(), status = %res.status, elapsed = ?start.elapsed(), "client round trip");
        }
        Ok(res)
    }

    /// Send a JSON request carrying this user's access token.
    pub async fn do_with_auth(
        &self,
        method: Method,
        paths: &[&str],
        body: Option<&Value>,
    ) -> Result<ClientResponse, ClientError> {
        self.do_request(method, paths, body, &[("access_token", self.access_token.as_str())])
            .await
    }

    /// Like [`do_with_auth`](Self::do_with_auth), but non-2xx is an error.
    pub async fn do_success(
        &self,
        method: Method,
        paths: &[&str],
        body: Option<&Value>,
    ) -> Result<ClientResponse, ClientError> {
        let res = self.do_with_auth(method.clone(), paths, body).await?;
        if !res.is_success() {
            return Err(ClientError::Status {
                method,
                url: format!("{}/{}", self.base_url, paths.join("/")),
                status: res.status,
                body: res.text(),
            });
        }
        Ok(res)
    }

    /// Like [`do_success`](Self::do_success), but panics on failure.
    pub async fn must_do(&self, method: Method, paths: &[&str], body: Option<&Value>) -> ClientResponse {
        match self.do_success(method.clone(), paths, body).await {
            Ok(res) => res,
            Err(err) => panic!("ClientApi::must_do {method} {}: {err}", paths.join("/")),
        }
    }

    /// Create a room; returns its ID.
    pub async fn create_room(&self, content: &Value) -> Result<String, ClientError> {
        let res = self
            .do_success(Method::POST, &["_matrix", "client", "r0", "createRoom"], Some(content))
            .await?;
        Ok(json_field_str(&res.body_json()?, "room_id")?)
    }

    /// Join by room ID or alias; returns the room ID.
    pub async fn join_room(&self, room_id_or_alias: &str) -> Result<String, ClientError> {
        let res = self
            .do_success(
                Method::POST,
                &["_matrix", "client", "r0", "join", room_id_or_alias],
                Some(&json!({})),
            )
            .await?;
        if room_id_or_alias.starts_with('!') {
            return Ok(room_id_or_alias.to_string());
        }
        Ok(json_field_str(&res.body_json()?, "room_id")?)
    }

    /// Send `event` and wait until it shows up in this user's sync timeline.
    pub async fn send_event_synced(
        &self,
        room_id: &str,
        event: &blueprint::Event,
    ) -> Result<String, ClientError> {
        let content = Value::Object(event.content.clone());
        let txn_id = (self.txn_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        let paths: Vec<&str> = match &event.state_key {
            Some(state_key) => vec![
                "_matrix",
                "client",
                "r0",
                "rooms",
                room_id,
                "state",
                event.event_type.as_str(),
                state_key.as_str(),
            ],
            None => vec![
                "_matrix",
                "client",
                "r0",
                "rooms",
                room_id,
                "send",
                event.event_type.as_str(),
                txn_id.as_str(),
            ],
        };
        let res = self.do_success(Method::PUT, &paths, Some(&content)).await?;
        let event_id = json_field_str(&res.body_json()?, "event_id")?;

        debug!(%room_id, %event_id, "waiting for sent event to come down sync");
        self.sync_until_timeline_has(room_id, |ev| {
            ev.get("event_id").and_then(Value::as_str) == Some(event_id.as_str())
        })
        .await?;
        Ok(event_id)
    }

    /// Sync until `check` accepts an event of `room_id`'s timeline.
    pub async fn sync_until_timeline_has(
        &self,
        room_id: &str,
        check: impl FnMut(&Value) -> bool,
    ) -> Result<Value, ClientError> {
        let mut source = self.sync_timeline(room_id);
        Ok(poll_until(&mut source, self.sync_until_timeout, check).await?)
    }

    /// The joined timeline of `room_id` as seen through `/sync`.
    pub fn sync_timeline(&self, room_id: &str) -> SyncTimeline<'_> {
        SyncTimeline {
            client: self,
            path: format!(
                "rooms.join.{}.timeline.events",
                escape_path_segment(room_id)
            ),
        }
    }
}

/// Observation source over one room's `/sync` timeline.
pub struct SyncTimeline<'a> {
    client: &'a ClientApi,
    path: String,
}

#[async_trait]
impl<'a> ObservationSource for SyncTimeline<'a> {
    type Item = Value;
    type Error = ClientError;

    async fn next_batch(&mut self, since: Option<&str>) -> Result<Batch<Value>, ClientError> {
        let mut query = vec![
            ("access_token", self.client.access_token.as_str()),
            ("timeout", "1000"),
        ];
        if let Some(since) = since {
            query.push(("since", since));
        }
        let paths = ["_matrix", "client", "r0", "sync"];
        let res = self.client.do_request(Method::GET, &paths, None, &query).await?;
        if !res.is_success() {
            return Err(ClientError::Status {
                method: Method::GET,
                url: format!("{}/{} since={since:?}", self.client.base_url, paths.join("/")),
                status: res.status,
                body: res.text(),
            });
        }

        let body = res.body_json()?;
        let next_batch = json_field_str(&body, "next_batch")?;
        let items = json_field(&body, &self.path)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(Batch::new(items, next_batch))
    }
}

/// Sends requests signed as a federation peer.
#[derive(Clone, Debug)]
pub struct FederationClient {
    http: reqwest::Client,
    identity: Arc<ServerIdentity>,
}

impl FederationClient {
    pub fn new(http: reqwest::Client, identity: Arc<ServerIdentity>) -> Self {
        Self { http, identity }
    }

    pub fn server_name(&self) -> &str {
        self.identity.server_name()
    }

    pub async fn do_request(
        &self,
        base_url: &str,
        destination: &str,
        method: Method,
        paths: &[&str],
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<ClientResponse, ClientError> {
        let url = build_url(base_url, paths, query)?;
        let uri = match url.query() {
            Some(q) => format!("{}?{q}", url.path()),
            None => url.path().to_string(),
        };

        let mut signable =
            FederationRequest::new(method.as_str(), &uri, self.identity.server_name(), destination);
        let mut request = self.http.request(method.clone(), url.clone());
        if let Some(body) = body {
            signable = signable.with_content(body.clone());
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(serde_json::to_vec(body)?);
        }
        let authorization = signable.sign(&self.identity)?;

        let res = ClientResponse::read(request.header(AUTHORIZATION, authorization).send().await?).await?;
        debug!(%method, %uri, destination, status = %res.status, "federation request");
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Path, Query},
        routing::{get, post, put},
        Json, Router,
    };
    use std::collections::HashMap;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://{addr}")
    }

    fn client(base_url: &str) -> ClientApi {
        let config = HarnessConfig {
            sync_until_timeout: Duration::from_secs(2),
            ..HarnessConfig::default()
        };
        ClientApi::new(reqwest::Client::new(), base_url, "@alice:hs1", "tok", &config)
    }

    /// Sync endpoint that delivers `$ev1` in the second batch.
    async fn sync(Query(q): Query<HashMap<String, String>>) -> Json<Value> {
        assert_eq!(q.get("access_token").map(String::as_str), Some("tok"));
        match q.get("since").map(String::as_str) {
            None => Json(json!({"next_batch": "s1", "rooms": {"join": {}}})),
            Some("s1") => Json(json!({
                "next_batch": "s2",
                "rooms": {"join": {"!room:hs1": {"timeline": {"events": [
                    {"event_id": "$other"},
                    {"event_id": "$ev1"},
                ]}}}},
            })),
            Some(since) => Json(json!({"next_batch": since})),
        }
    }

    #[test]
    fn build_url_escapes_segments() {
        let url = build_url(
            "http://localhost:8008/",
            &["_matrix", "client", "r0", "rooms", "!a/b:hs", "send"],
            &[("access_token", "a b")],
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8008/_matrix/client/r0/rooms/!a%2Fb:hs/send?access_token=a+b"
        );
        assert!(matches!(
            build_url("not a url", &[], &[]),
            Err(ClientError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn create_and_join_room() {
        let app = Router::new()
            .route(
                "/_matrix/client/r0/createRoom",
                post(|| async { Json(json!({"room_id": "!new:hs1"})) }),
            )
            .route(
                "/_matrix/client/r0/join/{target}",
                post(|Path(target): Path<String>| async move {
                    assert_eq!(target, "#lobby:hs1");
                    Json(json!({"room_id": "!lobby:hs1"}))
                }),
            );
        let c = client(&serve(app).await);

        assert_eq!(c.create_room(&json!({"preset": "public_chat"})).await.unwrap(), "!new:hs1");
        assert_eq!(c.join_room("#lobby:hs1").await.unwrap(), "!lobby:hs1");
    }

    #[tokio::test]
    async fn debug_mode_logs_bodies_and_still_succeeds() {
        let app = Router::new().route(
            "/_matrix/client/r0/createRoom",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["preset"], "private_chat");
                Json(json!({"room_id": "!dbg:hs1"}))
            }),
        );
        let config = HarnessConfig {
            debug: true,
            ..HarnessConfig::default()
        };
        let c = ClientApi::new(reqwest::Client::new(), &serve(app).await, "@alice:hs1", "tok", &config);

        assert_eq!(c.create_room(&json!({"preset": "private_chat"})).await.unwrap(), "!dbg:hs1");
        let res = c
            .do_request(Method::GET, &["_matrix", "client", "versions"], None, &[])
            .await
            .unwrap();
        assert_eq!(res.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn send_event_synced_waits_for_event() {
        let app = Router::new()
            .route(
                "/_matrix/client/r0/rooms/{room}/send/{kind}/{txn}",
                put(|| async { Json(json!({"event_id": "$ev1"})) }),
            )
            .route("/_matrix/client/r0/sync", get(sync));
        let c = client(&serve(app).await);

        let event = blueprint::Event::message("m.room.message", "@alice:hs1", json!({"body": "hi"}));
        assert_eq!(c.send_event_synced("!room:hs1", &event).await.unwrap(), "$ev1");
    }

    #[tokio::test]
    async fn sync_until_times_out_with_check_count() {
        let app = Router::new().route("/_matrix/client/r0/sync", get(sync));
        let mut c = client(&serve(app).await);
        c.sync_until_timeout = Duration::from_millis(300);

        let err = c
            .sync_until_timeline_has("!room:hs1", |_| false)
            .await
            .unwrap_err();
        match err {
            ClientError::SyncTimedOut { checked, .. } => assert_eq!(checked, 2),
            other => panic!("expected SyncTimedOut, got {other}"),
        }
    }

    #[tokio::test]
    async fn sync_error_status_aborts() {
        let app = Router::new().route(
            "/_matrix/client/r0/sync",
            get(|| async { (StatusCode::FORBIDDEN, Json(json!({"errcode": "M_FORBIDDEN"}))) }),
        );
        let c = client(&serve(app).await);
        let err = c.sync_until_timeline_has("!room:hs1", |_| true).await.unwrap_err();
        assert!(matches!(err, ClientError::Status { status: StatusCode::FORBIDDEN, .. }));
    }

    #[tokio::test]
    #[should_panic(expected = "must_do")]
    async fn must_do_panics_on_non_2xx() {
        let app = Router::new();
        let c = client(&serve(app).await);
        c.must_do(Method::GET, &["_matrix", "client", "versions"], None).await;
    }
}
