//! Consumer (spec §4.10): drives a JetStream pull consumer against the
//! stream a `Producer`'s subscribe RPC hands back, re-subscribing on a
//! heartbeat and nak-ing with capped exponential back-off on callback
//! failure.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{AckKind, Context};
use async_nats::Client;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use fabric_bus::stream::ensure_pull_consumer;
use fabric_core::cancel::Autoabortable;
use fabric_core::error::{Envelope, FabricError};
use fabric_core::names;
use fabric_core::retry::RetryPolicy;
use fabric_core::trapdoor::{SharedTrapdoor, Trapdoor};

use crate::destroy::Destroy;
use crate::producer::SubscribeResult;
use crate::summoner::Summoner;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub heartbeat_interval: Duration,
    /// Resolved Open Question (spec §9, §4.10): 60s production cap,
    /// overridable via FABRIC_NAK_MAX_DELAY_MS.
    pub nak_max_delay: Duration,
    pub subscribe_retry: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            heartbeat_interval: Duration::from_secs(15),
            nak_max_delay: Duration::from_secs(60),
            subscribe_retry: RetryPolicy {
                retries: 2,
                min_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(4),
                factor: 2.0,
                jitter: 0.0,
            },
        }
    }
}

/// The running message pump for one `SubscribeResult`. `degraded` is set
/// when the idle-gap watchdog stands in for the real
/// `HeartbeatsMissed(count>=2)` status event (SPEC_FULL.md §4.10: the
/// library's status-event surface isn't stable across async-nats 0.3x, so
/// two consecutive missed poll windows approximate it).
struct JetStreamConsumerChild {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl Destroy for JetStreamConsumerChild {
    async fn destroy(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

type EventCallback<T> = Arc<dyn Fn(T) -> BoxFuture<Result<(), FabricError>> + Send + Sync>;

struct ConsumerInner<T: DeserializeOwned + Send + 'static> {
    producer_name: String,
    consumer_name: String,
    client: Client,
    js: Context,
    params: serde_json::Value,
    config: ConsumerConfig,
    trapdoor: SharedTrapdoor,
    autoabortable: Autoabortable,
    degraded: Arc<AtomicBool>,
    summoner: Summoner<SubscribeResult, JetStreamConsumerChild>,
    timer: tokio::sync::Mutex<Option<fabric_bus::timer::Timer>>,
    _event: std::marker::PhantomData<fn(T)>,
}

/// Subscribes to one producer's event stream and re-subscribes as the
/// producer rehashes or reshards it (spec §4.10).
#[derive(Clone)]
pub struct Consumer<T: DeserializeOwned + Send + 'static> {
    inner: Arc<ConsumerInner<T>>,
}

impl<T: DeserializeOwned + Send + Sync + 'static> Consumer<T> {
    pub fn new<F, Fut>(
        producer_name: impl Into<String>,
        consumer_name: impl Into<String>,
        params: serde_json::Value,
        client: Client,
        config: ConsumerConfig,
        callback: F,
    ) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), FabricError>> + Send + 'static,
    {
        let js = async_nats::jetstream::new(client.clone());
        let callback: EventCallback<T> = Arc::new(move |event| Box::pin(callback(event)));
        let degraded = Arc::new(AtomicBool::new(false));

        let consumer_name = consumer_name.into();
        let consumer_name_for_factory = consumer_name.clone();
        let nak_max_delay = config.nak_max_delay;
        let js_for_factory = js.clone();
        let trapdoor = Arc::new(Trapdoor::new());
        let trapdoor_for_factory = trapdoor.clone();
        let callback_for_factory = callback;
        let degraded_for_factory = degraded.clone();

        let summoner: Summoner<SubscribeResult, JetStreamConsumerChild> = Summoner::new(move |result: SubscribeResult| {
            let consumer_name = consumer_name_for_factory.clone();
            let js = js_for_factory.clone();
            let trapdoor = trapdoor_for_factory.clone();
            let callback = callback_for_factory.clone();
            let degraded = degraded_for_factory.clone();
            async move { spawn_consumer_child(result, consumer_name, js, trapdoor, callback, nak_max_delay, degraded).await }
        });

        let inner = Arc::new(ConsumerInner {
            producer_name: producer_name.into(),
            consumer_name,
            client,
            js,
            params,
            config,
            trapdoor,
            autoabortable: Autoabortable::new(),
            degraded,
            summoner,
            timer: tokio::sync::Mutex::new(None),
            _event: std::marker::PhantomData,
        });

        Consumer { inner }
    }

    pub fn trapdoor(&self) -> SharedTrapdoor {
        self.inner.trapdoor.clone()
    }

    /// Runs the initial subscribe, then starts the heartbeat timer that
    /// re-runs it on every tick (spec §4.10).
    pub async fn init(&self) -> Result<(), FabricError> {
        self.subscribe_tick().await;

        let this = self.clone();
        let timer = fabric_bus::timer::Timer::start(
            "consumer.heartbeat",
            self.inner.config.heartbeat_interval,
            self.inner.trapdoor.clone(),
            move || {
                let this = this.clone();
                async move {
                    this.subscribe_tick().await;
                    Ok(())
                }
            },
        );
        *self.inner.timer.lock().await = Some(timer);
        Ok(())
    }

    async fn subscribe_tick(&self) {
        let inner = &self.inner;

        if inner.degraded.swap(false, Ordering::SeqCst) {
            inner.summoner.kill().await;
        }

        let token = inner.autoabortable.child();
        let policy = inner.config.subscribe_retry;
        let client = inner.client.clone();
        let producer_name = inner.producer_name.clone();
        let params = inner.params.clone();

        let result = policy
            .run(&token, |_err: &FabricError, _attempt| true, || {
                let client = client.clone();
                let producer_name = producer_name.clone();
                let params = params.clone();
                async move { request_subscribe(&client, &producer_name, &params).await }
            })
            .await;

        match result {
            Ok(subscribe_result) => inner.summoner.spawn(subscribe_result).await,
            Err(_) => inner.summoner.kill().await,
        }
    }

    pub async fn destroy(self) {
        let inner = self.inner;
        if let Some(timer) = inner.timer.lock().await.take() {
            timer.destroy().await;
        }
        inner.summoner.kill().await;
        inner.autoabortable.shutdown();
    }
}

async fn request_subscribe(
    client: &Client,
    producer_name: &str,
    params: &serde_json::Value,
) -> Result<SubscribeResult, FabricError> {
    let payload = serde_json::to_vec(params).map_err(|e| FabricError::internal_from("failed to encode subscribe params", e))?;
    let message = client
        .request(names::subscribe_subject(producer_name), payload.into())
        .await
        .map_err(|e| FabricError::internal_from("subscribe request failed", e))?;
    let envelope: Envelope<SubscribeResult> = serde_json::from_slice(&message.payload)
        .map_err(|e| FabricError::internal_from("failed to decode subscribe response", e))?;
    envelope.into_result()
}

async fn spawn_consumer_child<T: DeserializeOwned + Send + Sync + 'static>(
    result: SubscribeResult,
    consumer_name: String,
    js: Context,
    trapdoor: SharedTrapdoor,
    callback: EventCallback<T>,
    nak_max_delay: Duration,
    degraded: Arc<AtomicBool>,
) -> JetStreamConsumerChild {
    let token = CancellationToken::new();
    let loop_token = token.clone();
    let stream_name = result.stream.clone();

    let handle = tokio::spawn(async move {
        let consumer = match ensure_pull_consumer(&js, &stream_name, &consumer_name).await {
            Ok(consumer) => consumer,
            Err(err) => {
                trapdoor.report("consumer.pump", &err);
                return;
            }
        };
        let mut messages = match consumer.messages().await {
            Ok(messages) => messages,
            Err(err) => {
                trapdoor.report("consumer.pump", &FabricError::internal_from("failed to start consumer pull", err));
                return;
            }
        };

        let idle_window = Duration::from_secs(30);
        let mut consecutive_idle = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = loop_token.cancelled() => break,
                next = tokio::time::timeout(idle_window, messages.next()) => {
                    let message = match next {
                        Err(_elapsed) => {
                            consecutive_idle += 1;
                            if consecutive_idle >= 2 {
                                degraded.store(true, Ordering::SeqCst);
                                break;
                            }
                            continue;
                        }
                        Ok(None) => break,
                        Ok(Some(Err(err))) => {
                            trapdoor.report("consumer.pump", &FabricError::internal_from("consumer pull failed", err));
                            break;
                        }
                        Ok(Some(Ok(message))) => {
                            consecutive_idle = 0;
                            message
                        }
                    };

                    let redelivered = message
                        .info()
                        .map(|info| info.delivered.saturating_sub(1))
                        .unwrap_or(0);

                    let decoded = serde_json::from_slice::<T>(&message.payload);
                    match decoded {
                        Ok(event) => match callback(event).await {
                            Ok(()) => {
                                if let Err(err) = message.ack().await {
                                    trapdoor.report("consumer.ack", &FabricError::internal_from("failed to ack message", err));
                                }
                            }
                            Err(err) => {
                                trapdoor.report("consumer.callback", &err);
                                let delay = nak_delay(redelivered as u32, nak_max_delay);
                                if let Err(err) = message.ack_with(AckKind::Nak(Some(delay))).await {
                                    trapdoor.report("consumer.nak", &FabricError::internal_from("failed to nak message", err));
                                }
                            }
                        },
                        Err(err) => {
                            trapdoor.report(
                                "consumer.decode",
                                &FabricError::internal_from("failed to decode consumer event", err),
                            );
                            let delay = nak_delay(redelivered as u32, nak_max_delay);
                            let _ = message.ack_with(AckKind::Nak(Some(delay))).await;
                        }
                    }
                }
            }
        }
    });

    JetStreamConsumerChild { token, handle }
}

/// `min(1000 * 2^redeliveryCount, cap)` ms (spec §4.10).
fn nak_delay(redelivery_count: u32, cap: Duration) -> Duration {
    let millis = 1000u64.saturating_mul(1u64 << redelivery_count.min(20));
    Duration::from_millis(millis).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nak_delay_doubles_per_redelivery_and_caps() {
        let cap = Duration::from_secs(60);
        assert_eq!(nak_delay(0, cap), Duration::from_millis(1000));
        assert_eq!(nak_delay(1, cap), Duration::from_millis(2000));
        assert_eq!(nak_delay(6, cap), cap);
    }
}
