use std::{env, sync::Arc};

use opentelemetry::{global, trace::TracerProvider, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use tandem_harness::{
    handle_directory_lookups, handle_key_requests, handle_make_send_join_requests, EventBus,
    HarnessConfig, HttpKeyFetcher, KeyRing, PeerConfig, PeerEvent, PeerServer, RoomVersion,
    ServerIdentity, StaticDeployment,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOBBY_ALIAS: &str = "lobby";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("tandem-peer");

    let config = PeerConfig::from_env()?;
    let harness = HarnessConfig::from_env()?;

    let identity = match &config.signing_key {
        Some(key) => ServerIdentity::from_pkcs8_base64(&config.server_name, key)?,
        None => {
            warn!("PEER_SIGNING_KEY not set, generating an ephemeral signing key");
            ServerIdentity::generate(&config.server_name)?
        }
    };
    info!(server_name = %config.server_name, key_id = %identity.key_id(), "signing identity ready");

    let deployment = config
        .key_servers
        .iter()
        .fold(StaticDeployment::new(harness), |d, (name, url)| {
            d.with_server(name, url)
        });
    let fetcher = HttpKeyFetcher::new(reqwest::Client::new(), Arc::new(deployment));
    let key_ring = KeyRing::new(Arc::new(fetcher));

    let server = PeerServer::new(
        identity,
        key_ring,
        [
            handle_key_requests(),
            handle_make_send_join_requests(),
            handle_directory_lookups(),
        ],
    );

    let state = server.state();
    let creator = format!("@peer:{}", config.server_name);
    let room_id = state.make_room(RoomVersion::default(), &creator).await?;
    let alias = state.make_alias_mapping(LOBBY_ALIAS, &room_id).await;
    info!(%room_id, %alias, "seeded lobby room");

    tokio::spawn(log_peer_events(state.bus().clone()));

    let listening = server.listen_on(config.bind_addr).await?;
    info!(
        bind_addr = %config.bind_addr,
        base_url = %listening.base_url(),
        key_servers = config.key_servers.len(),
        "peer listening"
    );

    shutdown_signal().await;
    listening.shutdown().await?;

    global::shutdown_tracer_provider();
    Ok(())
}

async fn log_peer_events(bus: EventBus) {
    let mut rx = bus.subscribe();
    loop {
        match rx.recv().await {
            Ok(PeerEvent::RequestRejected {
                path,
                errcode,
                reason,
            }) => warn!(%path, %errcode, %reason, "request rejected"),
            Ok(event) => info!(?event, "peer event"),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "peer event log lagging");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Log to stdout at `info` for the peer, the harness library and HTTP
/// traces unless `RUST_LOG` says otherwise. Spans are also exported over
/// OTLP when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
fn init_tracing(service_name: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("tandem_peer=info,tandem_harness=info,tower_http=info")
    });
    let fmt_layer = tracing_subscriber::fmt::layer().compact().with_target(false);

    if let Ok(endpoint) = env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let provider = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_trace_config(
                opentelemetry_sdk::trace::Config::default().with_resource(Resource::new(vec![
                    KeyValue::new("service.name", service_name.to_owned()),
                ])),
            )
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint),
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio);

        match provider {
            Ok(provider) => {
                let tracer = provider.tracer(service_name.to_owned());
                global::set_tracer_provider(provider);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .with(tracing_opentelemetry::layer().with_tracer(tracer))
                    .init();
                info!("tracing initialized with OpenTelemetry OTLP exporter");
                return;
            }
            Err(error) => {
                eprintln!("failed to initialize OTLP exporter: {error}");
            }
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
    info!("tracing initialized (stdout only)");
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}
