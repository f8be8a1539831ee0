//! The impersonated federation peer.
//!
//! Each protocol surface is opt-in: a [`PeerServer`] starts with no routes
//! and gains them only through the [`ServerOption`]s it is given.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    routing::{get, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::crypto::ServerIdentity;
use crate::event::{
    EventError, Pdu, RoomVersion, M_ROOM_CREATE, M_ROOM_HISTORY_VISIBILITY, M_ROOM_JOIN_RULES,
    M_ROOM_MEMBER, M_ROOM_POWER_LEVELS, MEMBERSHIP_JOIN,
};
use crate::events::{EventBus, PeerEvent};
use crate::keyring::KeyRing;
use crate::request::{verify_request, FederationRequest};
use crate::room::{RoomError, ServerRoom};
use crate::wire::{
    ErrorResponse, RespDirectory, RespMakeJoin, RespSendJoin, ServerKeys, M_BAD_JSON,
    M_FORBIDDEN, M_INCOMPATIBLE_ROOM_VERSION, M_MISSING_PARAM,
};

/// How long served key documents claim to stay valid.
const KEY_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

type ApiError = (StatusCode, Json<ErrorResponse>);

/// A configuration mutator applied to a server under construction.
pub type ServerOption = Box<dyn FnOnce(&mut PeerServer) + Send>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Room(#[from] RoomError),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error("server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn api_error(status: StatusCode, errcode: &str, error: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse::new(errcode, error)))
}

fn internal_error(error: impl Into<String>) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse::unknown(error)))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// State shared by every handler of one peer server.
pub struct PeerState {
    identity: ServerIdentity,
    key_ring: KeyRing,
    rooms: RwLock<HashMap<String, Arc<RwLock<ServerRoom>>>>,
    aliases: RwLock<HashMap<String, String>>,
    bus: EventBus,
}

impl PeerState {
    pub fn server_name(&self) -> &str {
        self.identity.server_name()
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub async fn room(&self, room_id: &str) -> Option<Arc<RwLock<ServerRoom>>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Host `room`, replacing any room with the same ID.
    pub async fn insert_room(&self, room: ServerRoom) -> Arc<RwLock<ServerRoom>> {
        let room_id = room.room_id().to_string();
        let room = Arc::new(RwLock::new(room));
        self.rooms.write().await.insert(room_id, room.clone());
        room
    }

    /// Create and host a room owned by `creator`: create event, creator
    /// join, power levels, public join rules and shared history.
    pub async fn make_room(&self, version: RoomVersion, creator: &str) -> Result<String, ServerError> {
        let room_id = format!("!{}:{}", uuid::Uuid::new_v4().simple(), self.server_name());
        let mut room = ServerRoom::new(&room_id, version);

        let seed: [(&str, &str, Value); 5] = [
            (M_ROOM_CREATE, "", json!({"creator": creator, "room_version": version.as_str()})),
            (M_ROOM_MEMBER, creator, json!({"membership": MEMBERSHIP_JOIN})),
            (
                M_ROOM_POWER_LEVELS,
                "",
                json!({
                    "users": {creator: 100},
                    "users_default": 0,
                    "events_default": 0,
                    "state_default": 50,
                    "ban": 50,
                    "kick": 50,
                    "redact": 50,
                }),
            ),
            (M_ROOM_JOIN_RULES, "", json!({"join_rule": "public"})),
            (M_ROOM_HISTORY_VISIBILITY, "", json!({"history_visibility": "shared"})),
        ];
        for (event_type, state_key, content) in seed {
            let pdu = room
                .prepare_event(creator, event_type, Some(state_key), content)?
                .build(&self.identity, now_ms(), version)?;
            room.add_event(pdu);
        }

        info!(room_id = %room_id, creator, %version, "room created");
        self.insert_room(room).await;
        Ok(room_id)
    }

    /// Bind `#localpart:server_name` to `room_id`, returning the alias.
    pub async fn make_alias_mapping(&self, localpart: &str, room_id: &str) -> String {
        let alias = format!("#{localpart}:{}", self.server_name());
        self.aliases
            .write()
            .await
            .insert(alias.clone(), room_id.to_string());
        alias
    }

    async fn authenticate(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<FederationRequest, ApiError> {
        let request_uri = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| uri.path());
        verify_request(
            method.as_str(),
            request_uri,
            headers,
            body,
            self.server_name(),
            &self.key_ring,
            now_ms(),
        )
        .await
        .map_err(|err| {
            warn!(uri = %uri, error = %err, "rejecting unauthenticated request");
            self.bus
                .emit_rejected(uri.path(), err.errcode(), &err.to_string());
            api_error(err.status(), err.errcode(), err.to_string())
        })
    }

    async fn room_or_404(&self, room_id: &str) -> Result<Arc<RwLock<ServerRoom>>, ApiError> {
        self.room(room_id).await.ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::not_found(format!("Unknown room {room_id}"))),
            )
        })
    }
}

/// A peer server being configured, not yet listening.
pub struct PeerServer {
    state: Arc<PeerState>,
    router: Router<Arc<PeerState>>,
    keys_enabled: bool,
    joins_enabled: bool,
    directory_enabled: bool,
}

impl PeerServer {
    pub fn new(
        identity: ServerIdentity,
        key_ring: KeyRing,
        options: impl IntoIterator<Item = ServerOption>,
    ) -> Self {
        let mut server = Self {
            state: Arc::new(PeerState {
                identity,
                key_ring,
                rooms: RwLock::new(HashMap::new()),
                aliases: RwLock::new(HashMap::new()),
                bus: EventBus::default(),
            }),
            router: Router::new(),
            keys_enabled: false,
            joins_enabled: false,
            directory_enabled: false,
        };
        server.apply(options);
        server
    }

    /// Apply further options, in order.
    pub fn apply(&mut self, options: impl IntoIterator<Item = ServerOption>) {
        for option in options {
            option(self);
        }
    }

    pub fn state(&self) -> Arc<PeerState> {
        self.state.clone()
    }

    fn add_routes(&mut self, routes: impl FnOnce(Router<Arc<PeerState>>) -> Router<Arc<PeerState>>) {
        let router = std::mem::take(&mut self.router);
        self.router = routes(router);
    }

    /// Bind `127.0.0.1` on an OS-assigned port and start serving.
    pub async fn listen(self) -> Result<ListeningServer, ServerError> {
        self.listen_on(SocketAddr::from(([127, 0, 0, 1], 0))).await
    }

    pub async fn listen_on(self, addr: SocketAddr) -> Result<ListeningServer, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let host = if local_addr.ip().is_unspecified() {
            format!("127.0.0.1:{}", local_addr.port())
        } else {
            local_addr.to_string()
        };
        let base_url = format!("http://{host}");

        let (tx, mut rx) = watch::channel(false);
        let app = self
            .router
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http());
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = rx.wait_for(|stop| *stop).await;
        });
        let task = tokio::spawn(async move { serve.await });

        info!(%local_addr, server_name = %self.state.server_name(), "peer server listening");
        Ok(ListeningServer {
            base_url,
            local_addr,
            shutdown: ShutdownHandle { tx: Arc::new(tx) },
            task: Some(task),
            state: self.state,
        })
    }
}

/// Enable `GET /_matrix/key/v2/server`.
pub fn handle_key_requests() -> ServerOption {
    Box::new(|server: &mut PeerServer| {
        if server.keys_enabled {
            return;
        }
        server.keys_enabled = true;
        server.add_routes(|r| {
            r.route("/_matrix/key/v2/server", get(key_server))
                .route("/_matrix/key/v2/server/", get(key_server))
                .route("/_matrix/key/v2/server/{key_id}", get(key_server_by_id))
        });
    })
}

/// Enable the make-join / send-join handshake.
pub fn handle_make_send_join_requests() -> ServerOption {
    Box::new(|server: &mut PeerServer| {
        if server.joins_enabled {
            return;
        }
        server.joins_enabled = true;
        server.add_routes(|r| {
            r.route(
                "/_matrix/federation/v1/make_join/{room_id}/{user_id}",
                get(make_join),
            )
            .route(
                "/_matrix/federation/v1/send_join/{room_id}/{event_id}",
                put(send_join_v1),
            )
            .route(
                "/_matrix/federation/v2/send_join/{room_id}/{event_id}",
                put(send_join_v2),
            )
        });
    })
}

/// Enable room alias resolution.
pub fn handle_directory_lookups() -> ServerOption {
    Box::new(|server: &mut PeerServer| {
        if server.directory_enabled {
            return;
        }
        server.directory_enabled = true;
        server.add_routes(|r| r.route("/_matrix/federation/v1/query/directory", get(directory)));
    })
}

/// Stops a listening server. Cancelling more than once is harmless.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// A running peer server. Dropping it stops the listener.
pub struct ListeningServer {
    base_url: String,
    local_addr: SocketAddr,
    shutdown: ShutdownHandle,
    task: Option<JoinHandle<std::io::Result<()>>>,
    state: Arc<PeerState>,
}

impl ListeningServer {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> Arc<PeerState> {
        self.state.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(mut self) -> Result<(), ServerError> {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            task.await??;
        }
        Ok(())
    }
}

impl Drop for ListeningServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /_matrix/key/v2/server
#[instrument(skip(state))]
async fn key_server(State(state): State<Arc<PeerState>>) -> Result<Json<Value>, ApiError> {
    let valid_until = now_ms() + KEY_VALIDITY.as_millis() as i64;
    let doc = ServerKeys::signed(&state.identity, valid_until).map_err(|err| {
        internal_error(format!("signing key document: {err}"))
    })?;
    state.bus.emit(PeerEvent::KeysServed {
        key_id: state.identity.key_id().to_string(),
    });
    Ok(Json(doc))
}

/// GET /_matrix/key/v2/server/{key_id}, served the same as the bare path.
async fn key_server_by_id(
    state: State<Arc<PeerState>>,
    Path(_key_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    key_server(state).await
}

fn requested_versions(uri: &Uri) -> Vec<String> {
    uri.query()
        .unwrap_or_default()
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(k, _)| *k == "ver")
        .map(|(_, v)| v.to_string())
        .collect()
}

/// GET /_matrix/federation/v1/make_join/{room_id}/{user_id}
#[instrument(skip(state, headers))]
async fn make_join(
    State(state): State<Arc<PeerState>>,
    Path((room_id, user_id)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Json<RespMakeJoin>, ApiError> {
    let request = state.authenticate(&method, &uri, &headers, &[]).await?;
    let room = state.room_or_404(&room_id).await?;

    let user_domain = user_id.split_once(':').map(|(_, d)| d).unwrap_or_default();
    if user_domain != request.origin {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            M_FORBIDDEN,
            format!("{user_id} does not belong to {}", request.origin),
        ));
    }

    let room = room.read().await;
    let versions = requested_versions(&uri);
    if !versions.is_empty() && !versions.iter().any(|v| v == room.version().as_str()) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            M_INCOMPATIBLE_ROOM_VERSION,
            format!("room version {} not supported by joining server", room.version()),
        ));
    }

    let event = room
        .prepare_event(
            &user_id,
            M_ROOM_MEMBER,
            Some(&user_id),
            json!({"membership": MEMBERSHIP_JOIN}),
        )
        .map_err(|err| {
            warn!(room_id = %room_id, error = %err, "cannot build join template");
            internal_error(err.to_string())
        })?;

    info!(room_id = %room_id, user_id = %user_id, origin = %request.origin, "make_join served");
    state.bus.emit(PeerEvent::MakeJoinServed {
        origin: request.origin,
        room_id: room_id.clone(),
        user_id: user_id.clone(),
    });
    Ok(Json(RespMakeJoin {
        event,
        room_version: room.version(),
    }))
}

async fn send_join(
    state: &PeerState,
    room_id: &str,
    event_id: &str,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<RespSendJoin, ApiError> {
    let request = state.authenticate(method, uri, headers, body).await?;
    let room = state.room_or_404(room_id).await?;
    let mut room = room.write().await;

    let pdu = Pdu::from_untrusted_json(body, room.version()).map_err(|err| {
        warn!(room_id, origin = %request.origin, error = %err, "unparsable send_join event");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, M_BAD_JSON, err.to_string())
    })?;

    let bad = |why: String| api_error(StatusCode::BAD_REQUEST, M_BAD_JSON, why);
    if pdu.event_id() != event_id {
        return Err(bad(format!(
            "event ID {} does not match path {event_id}",
            pdu.event_id()
        )));
    }
    if pdu.room_id() != room_id {
        return Err(bad(format!("event is for room {}", pdu.room_id())));
    }
    if pdu.event_type() != M_ROOM_MEMBER || pdu.membership() != Some(MEMBERSHIP_JOIN) {
        return Err(bad("event is not a join".to_string()));
    }

    room.add_event(pdu);
    let state_events = room.all_current_state();
    let auth_chain = room.auth_chain();
    drop(room);

    info!(room_id, event_id, origin = %request.origin, "join accepted");
    state.bus.emit(PeerEvent::JoinAccepted {
        origin: request.origin,
        room_id: room_id.to_string(),
        event_id: event_id.to_string(),
    });
    Ok(RespSendJoin {
        auth_chain: auth_chain.iter().map(Pdu::json).collect(),
        state: state_events.iter().map(Pdu::json).collect(),
        origin: state.server_name().to_string(),
    })
}

/// PUT /_matrix/federation/v2/send_join/{room_id}/{event_id}
#[instrument(skip(state, headers, body))]
async fn send_join_v2(
    State(state): State<Arc<PeerState>>,
    Path((room_id, event_id)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<RespSendJoin>, ApiError> {
    send_join(&state, &room_id, &event_id, &method, &uri, &headers, &body)
        .await
        .map(Json)
}

/// PUT /_matrix/federation/v1/send_join/{room_id}/{event_id}: `[200, body]`.
#[instrument(skip(state, headers, body))]
async fn send_join_v1(
    State(state): State<Arc<PeerState>>,
    Path((room_id, event_id)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let resp = send_join(&state, &room_id, &event_id, &method, &uri, &headers, &body).await?;
    Ok(Json(json!([200, resp])))
}

#[derive(Debug, Deserialize)]
struct DirectoryQuery {
    room_alias: Option<String>,
}

/// GET /_matrix/federation/v1/query/directory?room_alias=
#[instrument(skip(state, headers))]
async fn directory(
    State(state): State<Arc<PeerState>>,
    Query(query): Query<DirectoryQuery>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Json<RespDirectory>, ApiError> {
    state.authenticate(&method, &uri, &headers, &[]).await?;
    let alias = query.room_alias.ok_or_else(|| {
        api_error(StatusCode::BAD_REQUEST, M_MISSING_PARAM, "room_alias is required")
    })?;

    let room_id = state.aliases.read().await.get(&alias).cloned();
    let Some(room_id) = room_id else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::not_found(format!("Room alias {alias} not found"))),
        ));
    };

    state.bus.emit(PeerEvent::AliasResolved {
        alias,
        room_id: room_id.clone(),
    });
    Ok(Json(RespDirectory {
        room_id,
        servers: vec![state.server_name().to_string()],
    }))
}
