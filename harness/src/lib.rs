//! Federation integration-test harness: declare a topology, impersonate a
//! remote peer, and poll homeservers until distributed state converges.

pub mod assertions;
pub mod blueprint;
pub mod client;
pub mod config;
pub mod crypto;
pub mod deployment;
pub mod event;
pub mod events;
pub mod keyring;
pub mod poll;
pub mod request;
pub mod room;
pub mod server;
pub mod wire;

pub use assertions::{AssertionError, SoftAssertions};
pub use blueprint::{must_validate, validate, Blueprint, BlueprintError, Homeserver};
pub use client::{ClientApi, ClientError, ClientResponse, FederationClient, SyncTimeline};
pub use config::{ConfigError, HarnessConfig, PeerConfig};
pub use crypto::{CryptoError, ServerIdentity};
pub use deployment::{Deployment, DeploymentError, StaticDeployment};
pub use event::{EventBuilder, EventError, Pdu, RoomVersion, StateKeyTuple};
pub use events::{EventBus, PeerEvent};
pub use keyring::{HttpKeyFetcher, KeyFetcher, KeyRing, KeyRingError, StaticKeyFetcher};
pub use poll::{poll_until, Batch, ObservationSource, PollError};
pub use request::{FederationRequest, RequestError};
pub use room::{RoomError, ServerRoom};
pub use server::{
    handle_directory_lookups, handle_key_requests, handle_make_send_join_requests,
    ListeningServer, PeerServer, PeerState, ServerError, ServerOption, ShutdownHandle,
};
pub use wire::{ErrorResponse, RespDirectory, RespMakeJoin, RespSendJoin, ServerKeys};
