//! Producer (spec §4.9): peer election via a heartbeat KV, consistent
//! shard-to-peer assignment with replication, per-shard subscription
//! demultiplexing, and subscriber-driven stream provisioning.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::Context;
use async_nats::Client;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

use fabric_bus::kv::{Bucket, Cell, Slice};
use fabric_bus::pubsub::Service;
use fabric_bus::stream::{ensure_subscription_stream, StreamLimits};
use fabric_bus::timer::Timer;
use fabric_bus::watcher::{WatchOptions, Watcher};
use fabric_core::canon::hash_of;
use fabric_core::cancel::Autoabortable;
use fabric_core::distribute::distribute;
use fabric_core::error::FabricError;
use fabric_core::ids::shard_sequence;
use fabric_core::names;
use fabric_core::records::{DistributionRecord, InstanceRecord, ProducerUpdate, SubscriptionRecord};
use fabric_core::trapdoor::{SharedTrapdoor, Trapdoor};

use crate::destroy::Destroy;
use crate::spawner::Spawner;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub shards: Vec<String>,
    pub replicas: usize,
    pub heartbeat_interval: Duration,
    pub stream_limits: StreamLimits,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        ProducerConfig {
            shards: shard_sequence(12),
            replicas: 2,
            // Resolved Open Question (spec §9): 15s production default,
            // overridable via FABRIC_HEARTBEAT_INTERVAL_MS.
            heartbeat_interval: Duration::from_secs(15),
            stream_limits: StreamLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeResult {
    pub stream: String,
}

/// A thin publisher over a subscription's event stream subject (spec
/// §4.9), handed to the user's `on_spawn` factory.
#[derive(Clone)]
pub struct ProducerClient {
    js: Context,
    subject: String,
}

impl ProducerClient {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Publish and await the JetStream ack (teacher idiom:
    /// `sr_adapters::nats::publish_with_id` awaits the ack future before
    /// returning success).
    pub async fn publish(&self, payload: Vec<u8>) -> Result<(), FabricError> {
        let ack = self
            .js
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| FabricError::internal_from("failed to publish producer event", e))?;
        ack.await
            .map_err(|e| FabricError::internal_from("failed to receive publish ack", e))?;
        Ok(())
    }
}

type SpawnFn<C> = Arc<dyn Fn(serde_json::Value, String, ProducerClient) -> BoxFuture<C> + Send + Sync>;

/// Owns one assigned shard: the shared subscriptions slice, the inner
/// per-`paramHash` spawner, and the watcher feeding it (spec §4.9.4).
struct ShardHandler<C: Destroy + Send + 'static> {
    watcher: Watcher<SubscriptionRecord>,
    inner: Arc<Spawner<String, serde_json::Value, C>>,
}

impl<C: Destroy + Send + 'static> Destroy for ShardHandler<C> {
    async fn destroy(self) {
        self.watcher.destroy().await;
        // `inner` may still be referenced by the watch loop's own future
        // while it unwinds; its children are destroyed via `&self` so
        // dropping this last `Arc` after `watcher.destroy()` (which has
        // joined that loop) is always the final reference.
        self.inner.destroy().await;
    }
}

async fn spawn_shard_handler<C: Destroy + Send + 'static>(
    producer_name: String,
    subscriptions: Slice<SubscriptionRecord>,
    js: Context,
    trapdoor: SharedTrapdoor,
    on_spawn: SpawnFn<C>,
) -> ShardHandler<C> {
    let inner: Arc<Spawner<String, serde_json::Value, C>> = Arc::new(Spawner::new(move |param_hash: String, params: serde_json::Value| {
        let producer_name = producer_name.clone();
        let js = js.clone();
        let on_spawn = on_spawn.clone();
        async move {
            let subject = names::subscription_subject(&producer_name, &param_hash);
            let client = ProducerClient { js, subject };
            on_spawn(params, param_hash, client).await
        }
    }));

    let watcher = subscriptions.watch(trapdoor, WatchOptions { detach: true });
    let watch_inner = inner.clone();
    let _ = watcher
        .init(move |update: ProducerUpdate<SubscriptionRecord>| {
            let inner = watch_inner.clone();
            async move {
                match update {
                    ProducerUpdate::Put { key, value, .. } => {
                        let param_hash = key.rsplit('.').next().unwrap_or_default().to_string();
                        inner.maybe_respawn_item(param_hash, value.params).await;
                    }
                    ProducerUpdate::Del { key, .. } => {
                        let param_hash = key.rsplit('.').next().unwrap_or_default().to_string();
                        inner.destroy_item(&param_hash).await;
                    }
                }
                Ok(())
            }
        })
        .await;

    ShardHandler { watcher, inner }
}

struct ProducerInner<C: Destroy + Send + 'static> {
    name: String,
    peer_id: String,
    config: ProducerConfig,
    js: Context,
    client: Client,
    bucket: Bucket,
    autoabortable: Autoabortable,
    trapdoor: SharedTrapdoor,
    distribution: Cell<DistributionRecord>,
    instances: Slice<InstanceRecord>,
    crowd: AsyncMutex<BTreeMap<String, InstanceRecord>>,
    online: AsyncMutex<bool>,
    shard_spawner: Spawner<String, (), ShardHandler<C>>,
    service: AsyncMutex<Option<Service>>,
    heartbeat: AsyncMutex<Option<Timer>>,
    distribution_watcher: AsyncMutex<Option<Watcher<DistributionRecord>>>,
    instances_watcher: AsyncMutex<Option<Watcher<InstanceRecord>>>,
}

/// Shard election, rebalancing, subscription intake, per-shard spawning
/// of user event sources (spec §4.9). `C` is the type produced by the
/// caller's `on_spawn` factory for each live `(shard, paramHash)`.
#[derive(Clone)]
pub struct Producer<C: Destroy + Send + 'static> {
    inner: Arc<ProducerInner<C>>,
}

impl<C: Destroy + Send + 'static> Producer<C> {
    pub async fn new<F, Fut>(
        name: impl Into<String>,
        peer_id: String,
        client: Client,
        config: ProducerConfig,
        on_spawn: F,
    ) -> Result<Self, FabricError>
    where
        F: Fn(serde_json::Value, String, ProducerClient) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = C> + Send + 'static,
    {
        let name = name.into();
        let js = async_nats::jetstream::new(client.clone());
        let bucket = Bucket::open_file(&js, &names::producer_bucket(&name)).await?;
        let distribution = bucket.cell::<DistributionRecord>(names::DISTRIBUTION_KEY);
        let instances = bucket.slice::<InstanceRecord>(names::instances_prefix());
        let on_spawn: SpawnFn<C> = Arc::new(move |params, hash, client| Box::pin(on_spawn(params, hash, client)));

        let producer_name = name.clone();
        let js_for_shards = js.clone();
        let on_spawn_for_shards = on_spawn.clone();
        let trapdoor = Arc::new(Trapdoor::new());
        let trapdoor_for_shards = trapdoor.clone();
        let bucket_for_shards = bucket.clone();

        let shard_spawner: Spawner<String, (), ShardHandler<C>> = Spawner::new(move |shard: String, _unit: ()| {
            let producer_name = producer_name.clone();
            let js = js_for_shards.clone();
            let on_spawn = on_spawn_for_shards.clone();
            let trapdoor = trapdoor_for_shards.clone();
            let subscriptions = bucket_for_shards.slice::<SubscriptionRecord>(names::subscriptions_shard_prefix(&shard));
            async move { spawn_shard_handler(producer_name, subscriptions, js, trapdoor, on_spawn).await }
        });

        let inner = Arc::new(ProducerInner {
            name,
            peer_id,
            config,
            js,
            client,
            bucket,
            autoabortable: Autoabortable::new(),
            trapdoor,
            distribution,
            instances,
            crowd: AsyncMutex::new(BTreeMap::new()),
            online: AsyncMutex::new(false),
            shard_spawner,
            service: AsyncMutex::new(None),
            heartbeat: AsyncMutex::new(None),
            distribution_watcher: AsyncMutex::new(None),
            instances_watcher: AsyncMutex::new(None),
        });

        Ok(Producer { inner })
    }

    pub fn trapdoor(&self) -> SharedTrapdoor {
        self.inner.trapdoor.clone()
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    /// Writes the own heartbeat first, installs watchers (each blocks
    /// until `online`), registers the subscribe intake service, and
    /// starts the heartbeat timer (spec §4.9, Lifecycle).
    pub async fn init(&self) -> Result<(), FabricError> {
        let inner = &self.inner;

        inner.instances.put(&inner.peer_id, &InstanceRecord::now()).await?;

        let distribution_watcher = inner.distribution.watch(inner.trapdoor.clone(), WatchOptions::default());
        let this = self.clone();
        distribution_watcher
            .init(move |update| {
                let this = this.clone();
                async move { this.on_distribution_update(update).await }
            })
            .await?;

        let instances_watcher = inner.instances.watch(inner.trapdoor.clone(), WatchOptions::default());
        let this = self.clone();
        instances_watcher
            .init(move |update| {
                let this = this.clone();
                async move { this.on_instances_update(update).await }
            })
            .await?;

        *inner.online.lock().await = true;
        *inner.distribution_watcher.lock().await = Some(distribution_watcher);
        *inner.instances_watcher.lock().await = Some(instances_watcher);

        let service = Service::new(inner.client.clone(), format!("producer.{}", inner.name));
        let this = self.clone();
        service
            .method::<serde_json::Value, SubscribeResult, _, _>(
                "subscribe",
                inner.trapdoor.clone(),
                move |params| {
                    let this = this.clone();
                    async move { this.handle_subscribe(params).await }
                },
            )
            .await?;
        *inner.service.lock().await = Some(service);

        let this = self.clone();
        let timer = Timer::start(
            "producer.heartbeat",
            inner.config.heartbeat_interval,
            inner.trapdoor.clone(),
            move || {
                let this = this.clone();
                async move { this.heartbeat().await }
            },
        );
        *inner.heartbeat.lock().await = Some(timer);

        info!(producer = %inner.name, peer = %inner.peer_id, "producer initialized");
        Ok(())
    }

    async fn heartbeat(&self) -> Result<(), FabricError> {
        self.inner.instances.put(&self.inner.peer_id, &InstanceRecord::now()).await?;
        Ok(())
    }

    async fn on_instances_update(&self, update: ProducerUpdate<InstanceRecord>) -> Result<(), FabricError> {
        let inner = &self.inner;
        let revision = update.revision();
        let instances_prefix_dot = format!("{}.", names::instances_prefix());

        let disbalanced = {
            let mut crowd = inner.crowd.lock().await;
            match update {
                ProducerUpdate::Put { key, value, .. } => {
                    let peer = key.strip_prefix(&instances_prefix_dot).unwrap_or(&key).to_string();
                    let newly = !crowd.contains_key(&peer);
                    crowd.insert(peer, value);
                    newly
                }
                ProducerUpdate::Del { key, .. } => {
                    let peer = key.strip_prefix(&instances_prefix_dot).unwrap_or(&key).to_string();
                    crowd.remove(&peer).is_some()
                }
            }
        };

        if disbalanced && *inner.online.lock().await {
            self.rebalance(revision).await;
        }
        Ok(())
    }

    async fn on_distribution_update(&self, update: ProducerUpdate<DistributionRecord>) -> Result<(), FabricError> {
        if let ProducerUpdate::Put { value, .. } = update {
            if let Some(shards) = value.shards_for(&self.inner.peer_id) {
                let desired: BTreeMap<String, ()> = shards.iter().cloned().map(|s| (s, ())).collect();
                self.inner.shard_spawner.reset_items(desired).await;
            }
        }
        Ok(())
    }

    async fn handle_subscribe(&self, params: serde_json::Value) -> Result<SubscribeResult, FabricError> {
        let inner = &self.inner;
        let param_hash = hash_of(&params);
        let shard_idx = shard_index(&param_hash, inner.config.shards.len());
        let shard = &inner.config.shards[shard_idx];
        let stream = names::subscription_stream_name(&inner.name, &param_hash);
        let subject = names::subscription_subject(&inner.name, &param_hash);

        ensure_subscription_stream(&inner.js, &subject, inner.config.stream_limits).await?;

        let subscriptions = inner
            .bucket
            .slice::<SubscriptionRecord>(names::subscriptions_shard_prefix(shard));
        subscriptions
            .put(
                &param_hash,
                &SubscriptionRecord {
                    seen: Utc::now(),
                    stream: stream.clone(),
                    params,
                },
            )
            .await?;

        Ok(SubscribeResult { stream })
    }

    /// Concurrent rebalances racing on the same `distribution` key are
    /// routine (spec §4.9.3); `mutate_using` retries the compare-and-swap
    /// conflict itself, so only an exhausted retry reaches the trapdoor.
    async fn rebalance(&self, rev: u64) {
        let inner = &self.inner;
        let peers: Vec<String> = inner.crowd.lock().await.keys().cloned().collect();
        let shards = inner.config.shards.clone();
        let replicas = inner.config.replicas;
        let own_id = inner.peer_id.clone();

        let result = inner
            .distribution
            .mutate_using(&inner.autoabortable, move |entry| {
                let peers = peers.clone();
                let shards = shards.clone();
                let own_id = own_id.clone();
                async move {
                    if let Some(current) = &entry.value {
                        if current.revision >= rev {
                            return None;
                        }
                    }
                    let distribution = distribute(&peers, &shards, replicas);
                    Some(DistributionRecord {
                        shards,
                        replicas,
                        distribution,
                        revision: rev,
                        author: own_id,
                    })
                }
            })
            .await;

        if let Err(err) = result {
            inner.trapdoor.report("producer.rebalance", &err);
        }
    }

    /// Removes the own heartbeat and tears down children in reverse
    /// construction order (spec Lifecycle).
    pub async fn destroy(self) {
        let inner = self.inner;
        if let Some(timer) = inner.heartbeat.lock().await.take() {
            timer.destroy().await;
        }
        if let Some(service) = inner.service.lock().await.take() {
            service.destroy().await;
        }
        if let Some(watcher) = inner.instances_watcher.lock().await.take() {
            watcher.destroy().await;
        }
        if let Some(watcher) = inner.distribution_watcher.lock().await.take() {
            watcher.destroy().await;
        }
        inner.shard_spawner.destroy().await;
        let _ = inner.instances.delete(&inner.peer_id).await;
        inner.bucket.shutdown();
        inner.autoabortable.shutdown();
    }
}

fn shard_index(param_hash: &str, shard_count: usize) -> usize {
    if shard_count == 0 {
        return 0;
    }
    let tail = if param_hash.len() >= 8 {
        &param_hash[param_hash.len() - 8..]
    } else {
        param_hash
    };
    let value = u64::from_str_radix(tail, 16).unwrap_or(0);
    (value % shard_count as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_index_is_stable_and_within_range() {
        let a = shard_index("deadbeefcafefeed", 12);
        let b = shard_index("deadbeefcafefeed", 12);
        assert_eq!(a, b);
        assert!(a < 12);
    }

    #[test]
    fn shard_index_handles_short_hashes() {
        assert_eq!(shard_index("ab", 12), shard_index("ab", 12));
        assert!(shard_index("ab", 12) < 12);
    }
}
