//! Subscription and Service (spec §4.7): plain-subject pub/sub and
//! request/reply, with a Service binding method handlers under a queue
//! group equal to the full subject so exactly one peer answers each
//! request.

use std::future::Future;
use std::sync::Arc;

use async_nats::{Client, Message};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use fabric_core::error::{Envelope, FabricError};
use fabric_core::trapdoor::SharedTrapdoor;

use crate::error::internal;

/// A handle for replying to a request/reply message. Absent for plain
/// pub/sub deliveries (no `reply` subject).
#[derive(Clone)]
pub struct Responder {
    client: Client,
    reply: String,
}

impl Responder {
    pub async fn respond<R: Serialize>(&self, value: &R) -> Result<(), FabricError> {
        let payload = serde_json::to_vec(value).map_err(|e| internal("failed to encode response", e))?;
        self.client
            .publish(self.reply.clone(), payload.into())
            .await
            .map_err(|e| internal("failed to publish response", e))
    }
}

/// A bound NATS subscription draining into a user callback. Errors in the
/// callback are reported via the trapdoor but do not unsubscribe (spec
/// §4.7).
pub struct Subscription {
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    /// Bind a subject with optional queue group, decode each message as
    /// `T`, and invoke `callback(value, responder)`.
    pub async fn bind<T, F, Fut>(
        client: &Client,
        subject: impl Into<String>,
        queue_group: Option<String>,
        trapdoor: SharedTrapdoor,
        mut callback: F,
    ) -> Result<Self, FabricError>
    where
        T: DeserializeOwned + Send + 'static,
        F: FnMut(T, Option<Responder>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), FabricError>> + Send,
    {
        let client = client.clone();
        Self::bind_raw(client.clone(), subject.into(), queue_group, trapdoor, move |message| {
            let client = client.clone();
            let decoded = serde_json::from_slice::<T>(&message.payload);
            let reply = message.reply.map(|r| Responder {
                client,
                reply: r.to_string(),
            });
            let fut = match decoded {
                Ok(value) => Some(callback(value, reply)),
                Err(_) => None,
            };
            async move {
                match fut {
                    Some(fut) => fut.await,
                    None => Err(FabricError::internal("failed to decode subscription message")),
                }
            }
        })
        .await
    }

    async fn bind_raw<F, Fut>(
        client: Client,
        subject: String,
        queue_group: Option<String>,
        trapdoor: SharedTrapdoor,
        mut callback: F,
    ) -> Result<Self, FabricError>
    where
        F: FnMut(Message) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), FabricError>> + Send,
    {
        let mut subscriber = match &queue_group {
            Some(queue) => client.queue_subscribe(subject.clone(), queue.clone()).await,
            None => client.subscribe(subject.clone()).await,
        }
        .map_err(|e| internal("failed to subscribe", e))?;

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let component = "subscription";

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = loop_token.cancelled() => break,
                    next = subscriber.next() => {
                        match next {
                            None => break,
                            Some(message) => {
                                if let Err(err) = callback(message).await {
                                    trapdoor.report(component, &err);
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(Subscription {
            token,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub async fn destroy(self) {
        self.stop();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

/// A method name bound under a Service, for bookkeeping/logging.
#[derive(Debug, Clone, Copy)]
pub struct ServiceMethod {
    pub name: &'static str,
}

/// Registers method handlers under `<serviceName>.<methodName>`, each with
/// queue group equal to the full subject (spec §4.7). Owns every bound
/// `Subscription` and tears them down on its own `destroy`.
pub struct Service {
    client: Client,
    name: String,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
}

impl Service {
    pub fn new(client: Client, name: impl Into<String>) -> Self {
        Service {
            client,
            name: name.into(),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register one method. The handler catches nothing itself — any
    /// `Err` it returns is serialized into `{error: {code, message,
    /// details?}}`; success yields `{result: ...}}`.
    pub async fn method<P, R, F, Fut>(
        &self,
        method: &'static str,
        trapdoor: SharedTrapdoor,
        handler: F,
    ) -> Result<(), FabricError>
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, FabricError>> + Send,
    {
        let subject = format!("{}.{}", self.name, method);
        let service_name = self.name.clone();
        let client = self.client.clone();
        let handler = Arc::new(handler);

        let subscription = Subscription::bind_raw(
            client.clone(),
            subject.clone(),
            Some(subject.clone()),
            trapdoor,
            move |message| {
                let client = client.clone();
                let handler = handler.clone();
                let service_name = service_name.clone();
                let subject = subject.clone();
                async move {
                    debug!(service = %service_name, method, subject = %subject, "handling request");
                    let outcome: Result<R, FabricError> = match serde_json::from_slice::<P>(&message.payload) {
                        Ok(params) => handler(params).await,
                        Err(err) => Err(FabricError::client("invalid request parameters")
                            .with_detail("cause", err.to_string())),
                    };
                    let envelope = match outcome {
                        Ok(value) => Envelope::ok(value),
                        Err(err) => Envelope::<R>::err(&err),
                    };
                    if let Some(reply) = message.reply {
                        let payload = serde_json::to_vec(&envelope)
                            .map_err(|e| internal("failed to encode service reply", e))?;
                        client
                            .publish(reply, payload.into())
                            .await
                            .map_err(|e| internal("failed to publish service reply", e))?;
                    }
                    Ok(())
                }
            },
        )
        .await?;

        self.subscriptions.lock().await.push(subscription);
        Ok(())
    }

    pub async fn destroy(self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().await);
        for subscription in subscriptions {
            subscription.destroy().await;
        }
    }
}
