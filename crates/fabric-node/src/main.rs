//! Reference node binary (spec §2 component table, ambient stack): wires
//! one `Producer` and one `Consumer` over a single NATS connection behind
//! a health-check HTTP endpoint. Grounded on the teacher's `sr-governor`
//! binary shape (config-from-env, JSON tracing, axum health routes,
//! signal-based graceful shutdown).
//!
//! The event payload is left as `serde_json::Value` and the producer's
//! `on_spawn` factory only logs: this binary is the generic host, not a
//! specific application built on top of the fabric.

mod config;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{routing::get, Json, Router};
use serde_json::json;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use config::NodeConfig;
use fabric_core::error::FabricError;
use fabric_producer::destroy::Destroy;
use fabric_producer::{Consumer, ConsumerConfig, Producer, ProducerClient, ProducerConfig};

/// The thing spawned per live subscription on a shard this peer owns.
/// A real application would publish domain events through `client`;
/// this reference node just logs the subscription's lifetime.
struct SubscriptionEmitter {
    param_hash: String,
}

impl Destroy for SubscriptionEmitter {
    async fn destroy(self) {
        info!(param_hash = %self.param_hash, "subscription emitter stopped");
    }
}

async fn spawn_emitter(
    params: serde_json::Value,
    param_hash: String,
    client: ProducerClient,
) -> SubscriptionEmitter {
    info!(
        param_hash = %param_hash,
        subject = %client.subject(),
        params = %params,
        "subscription emitter started"
    );
    SubscriptionEmitter { param_hash }
}

struct NodeState {
    ready: AtomicBool,
}

impl NodeState {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = NodeConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(
        service = %config.service_name,
        producer = %config.producer_name,
        peer = %config.peer_id,
        shards = config.shards.len(),
        "starting fabric node"
    );

    let client = async_nats::connect(&config.nats_url).await?;
    info!(nats_url = %config.nats_url, "nats connection established");

    let producer_config = ProducerConfig {
        shards: config.shards.clone(),
        replicas: config.replicas,
        heartbeat_interval: config.heartbeat_interval(),
        ..ProducerConfig::default()
    };

    let producer = Producer::new(
        config.producer_name.clone(),
        config.peer_id.clone(),
        client.clone(),
        producer_config,
        spawn_emitter,
    )
    .await?;
    producer.init().await?;
    info!("producer initialized");

    let consumer_config = ConsumerConfig {
        heartbeat_interval: config.heartbeat_interval(),
        nak_max_delay: config.nak_max_delay(),
        ..ConsumerConfig::default()
    };

    let consumer = Consumer::<serde_json::Value>::new(
        config.producer_name.clone(),
        format!("{}-consumer", config.service_name),
        config.consumer_params.clone(),
        client.clone(),
        consumer_config,
        |event: serde_json::Value| async move {
            info!(event = %event, "received event");
            Ok::<(), FabricError>(())
        },
    );
    consumer.init().await?;
    info!("consumer initialized");

    let state = Arc::new(NodeState {
        ready: AtomicBool::new(true),
    });

    let health_state = state.clone();
    let health_addr = SocketAddr::from(([0, 0, 0, 0], config.health_port));
    let health_app = Router::new()
        .route("/readyz", get(move || ready_handler(health_state.clone())))
        .route("/healthz", get(|| async { Json(json!({"status": "ok"})) }))
        .layer(TraceLayer::new_for_http());

    let health_server = tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(health_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(error = %err, "failed to bind health server");
                return;
            }
        };
        info!(addr = %health_addr, "health server listening");
        if let Err(err) = axum::serve(listener, health_app).await {
            error!(error = %err, "health server error");
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received, tearing down");
    state.ready.store(false, Ordering::Relaxed);

    health_server.abort();
    consumer.destroy().await;
    producer.destroy().await;

    info!("fabric node shutdown complete");
    Ok(())
}

/// Readiness handler (spec's ambient stack, not a named [MODULE]).
async fn ready_handler(state: Arc<NodeState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": if state.is_ready() { "ready" } else { "not_ready" },
    }))
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl+c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
