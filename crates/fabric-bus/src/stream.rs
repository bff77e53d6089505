//! Per-subscription JetStream stream and durable-consumer provisioning
//! (spec §3, §6). Grounded on the teacher's `sr_adapters::nats::ensure_stream`
//! / `create_consumer` (get-or-create, `update_stream` when already present).

use std::time::Duration;

use async_nats::jetstream::consumer::pull::Config as PullConsumerConfig;
use async_nats::jetstream::consumer::{AckPolicy, Consumer, DeliverPolicy};
use async_nats::jetstream::stream::{DiscardPolicy, RetentionPolicy, StorageType};
use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::Context;
use tracing::{debug, info};

use fabric_core::error::FabricError;
use fabric_core::names::sanitize_for_stream;

use crate::error::internal;

/// The five numeric limits spec §6 calls `streamDefaults`, overridable per
/// producer.
#[derive(Debug, Clone, Copy)]
pub struct StreamLimits {
    pub max_messages: i64,
    pub max_age: Duration,
    pub max_bytes: i64,
    pub max_message_size: i32,
}

impl Default for StreamLimits {
    fn default() -> Self {
        StreamLimits {
            max_messages: 100_000,
            max_age: Duration::from_secs(2 * 60 * 60),
            max_bytes: 100 * 1024 * 1024,
            max_message_size: 100 * 1024,
        }
    }
}

/// Idempotently create (or confirm) the per-subscription stream
/// `producer.<name>.<paramHash>` per spec §3/§6: interest retention, file
/// storage, discard-old.
pub async fn ensure_subscription_stream(
    js: &Context,
    stream_name: &str,
    limits: StreamLimits,
) -> Result<(), FabricError> {
    let sanitized = sanitize_for_stream(stream_name);
    let config = StreamConfig {
        name: sanitized.clone(),
        subjects: vec![stream_name.to_string()],
        retention: RetentionPolicy::Interest,
        storage: StorageType::File,
        max_messages: limits.max_messages,
        max_age: limits.max_age,
        max_bytes: limits.max_bytes,
        max_message_size: limits.max_message_size,
        discard: DiscardPolicy::Old,
        ..Default::default()
    };

    match js.get_stream(&sanitized).await {
        Ok(_) => {
            debug!(stream = %sanitized, "subscription stream already present");
            Ok(())
        }
        Err(_) => {
            info!(stream = %sanitized, subject = %stream_name, "creating subscription stream");
            js.create_stream(config)
                .await
                .map_err(|e| internal("failed to create subscription stream", e))?;
            Ok(())
        }
    }
}

/// Open (or reattach to) the durable pull consumer a `Consumer` drives
/// against a subscription stream (spec §4.10, §6): `ack_policy=explicit`,
/// `deliver_policy=new`, `durable_name` with dots sanitized.
pub async fn ensure_pull_consumer(
    js: &Context,
    stream_name: &str,
    durable_name: &str,
) -> Result<Consumer<PullConsumerConfig>, FabricError> {
    let sanitized_stream = sanitize_for_stream(stream_name);
    let sanitized_durable = sanitize_for_stream(durable_name);

    let stream = js
        .get_stream(&sanitized_stream)
        .await
        .map_err(|e| internal("failed to look up subscription stream", e))?;

    let config = PullConsumerConfig {
        durable_name: Some(sanitized_durable.clone()),
        ack_policy: AckPolicy::Explicit,
        deliver_policy: DeliverPolicy::New,
        ..Default::default()
    };

    let consumer = stream
        .get_or_create_consumer(&sanitized_durable, config)
        .await
        .map_err(|e| internal("failed to create durable consumer", e))?;

    Ok(consumer)
}
