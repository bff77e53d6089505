//! Watcher (spec §4.2): turns a KV watch into a callback stream with an
//! `online` flag that flips once the initial snapshot has been replayed.
//!
//! `async-nats`'s KV watch replays current state before live updates but
//! doesn't expose a distinct "caught up" event in every released version,
//! so `online` is derived the way the teacher's `dynamo kv_router`
//! subscriber tracks "latest known state" (a `tokio::sync::watch` the
//! caller can await): snapshot the live key set via `keys()`, then shrink
//! that set as matching updates arrive; it emptying (or starting empty)
//! flips `online`. The watch is started *before* the snapshot is read, and
//! anything it delivers while the snapshot is in flight is buffered and
//! replayed once the snapshot resolves — snapshotting first would let a
//! delete landing in that gap go unobserved, so `pending` would never
//! empty and `online` would never flip.

use std::collections::HashSet;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_nats::jetstream::kv::{Operation as KvWireOperation, Store};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use fabric_core::error::FabricError;
use fabric_core::records::ProducerUpdate;
use fabric_core::trapdoor::SharedTrapdoor;

use crate::error::internal;

pub type WatcherUpdate<T> = ProducerUpdate<T>;

#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    /// If true, the caller owns the returned `Watcher` and must `destroy`
    /// it; otherwise the owning component is expected to co-own and tear
    /// it down on its own teardown (spec §4.4, §5 resource ownership).
    pub detach: bool,
}

/// A running (or not-yet-started) watch over a key (`Cell`) or a
/// `prefix.>` filter (`Slice`).
pub struct Watcher<T> {
    store: Store,
    filter: String,
    trapdoor: SharedTrapdoor,
    opts: WatchOptions,
    token: CancellationToken,
    online_tx: watch::Sender<bool>,
    online_rx: watch::Receiver<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    _marker: PhantomData<T>,
}

impl<T: DeserializeOwned + Send + Sync + 'static> Watcher<T> {
    /// `token` is the watch loop's own cancellation source: a fresh,
    /// independent token for a detached watcher, or a child of the owning
    /// `Bucket`'s token so the bucket's own teardown stops it too (spec
    /// §4.4, §5).
    pub(crate) fn new(
        store: Store,
        filter: String,
        trapdoor: SharedTrapdoor,
        opts: WatchOptions,
        token: CancellationToken,
    ) -> Self {
        let (online_tx, online_rx) = watch::channel(false);
        Watcher {
            store,
            filter,
            trapdoor,
            opts,
            token,
            online_tx,
            online_rx,
            handle: Mutex::new(None),
            _marker: PhantomData,
        }
    }

    pub fn is_detached(&self) -> bool {
        self.opts.detach
    }

    /// A receiver observers can poll or await for the online transition
    /// (spec P6: transitions false to true exactly once).
    pub fn online(&self) -> watch::Receiver<bool> {
        self.online_rx.clone()
    }

    /// Start the watch and block until `online` is true, so callers can
    /// rely on having seen the initial state before proceeding (spec
    /// §4.2). `callback` is invoked for every `PUT`/`DEL`, in revision
    /// order, for the lifetime of the watcher.
    pub async fn init<F, Fut>(&self, mut callback: F) -> Result<(), FabricError>
    where
        F: FnMut(WatcherUpdate<T>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), FabricError>> + Send,
    {
        let component = "watcher";

        let mut watch_stream = self
            .store
            .watch(&self.filter)
            .await
            .map_err(|e| internal("failed to start kv watch", e))?;

        let mut buffered = Vec::new();
        let mut pending = {
            let mut snapshot_fut = Box::pin(snapshot_keys(&self.store, &self.filter));
            loop {
                tokio::select! {
                    biased;
                    snapshot = &mut snapshot_fut => break snapshot?,
                    item = watch_stream.next() => buffered.push(item),
                }
            }
        };

        for item in buffered {
            match item {
                None => break,
                Some(Err(err)) => {
                    self.trapdoor.report(component, &internal("kv watch stream failed", err));
                    break;
                }
                Some(Ok(entry)) => {
                    let key = entry.key.clone();
                    if !pending.is_empty() {
                        pending.remove(&key);
                    }
                    if let Some(update) = decode_watch_item::<T>(entry, &self.trapdoor, component) {
                        if let Err(err) = callback(update).await {
                            self.trapdoor.report(component, &err);
                        }
                    }
                }
            }
        }
        if pending.is_empty() {
            let _ = self.online_tx.send(true);
        }

        let token = self.token.clone();
        let trapdoor = self.trapdoor.clone();
        let online_tx = self.online_tx.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    item = watch_stream.next() => {
                        match item {
                            None => break,
                            Some(Err(err)) => {
                                trapdoor.report(component, &internal("kv watch stream failed", err));
                                break;
                            }
                            Some(Ok(entry)) => {
                                let key = entry.key.clone();

                                if !pending.is_empty() {
                                    pending.remove(&key);
                                    if pending.is_empty() {
                                        let _ = online_tx.send(true);
                                    }
                                }

                                if let Some(update) = decode_watch_item::<T>(entry, &trapdoor, component) {
                                    if let Err(err) = callback(update).await {
                                        trapdoor.report(component, &err);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });

        *self.handle.lock().await = Some(handle);

        let mut rx = self.online_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Close the watch (spec §4.2's `stop`); `destroy` then awaits the
    /// task's natural completion (spec §4.1).
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

/// Decode one watch entry into a [`WatcherUpdate`], reporting (and
/// skipping) a value that fails to deserialize rather than killing the
/// watch loop over it.
fn decode_watch_item<T: DeserializeOwned>(
    entry: async_nats::jetstream::kv::Entry,
    trapdoor: &SharedTrapdoor,
    component: &'static str,
) -> Option<WatcherUpdate<T>> {
    let key = entry.key.clone();
    let revision = entry.revision;
    match entry.operation {
        KvWireOperation::Put => match serde_json::from_slice::<T>(&entry.value) {
            Ok(value) => Some(ProducerUpdate::Put { key, revision, value }),
            Err(err) => {
                trapdoor.report(
                    component,
                    &FabricError::internal_from("failed to decode watcher entry", err)
                        .with_detail("key", &key)
                        .with_detail("raw_len", entry.value.len()),
                );
                None
            }
        },
        KvWireOperation::Delete | KvWireOperation::Purge => Some(ProducerUpdate::Del { key, revision }),
    }
}

async fn snapshot_keys(store: &Store, filter: &str) -> Result<HashSet<String>, FabricError> {
    let mut stream = store
        .keys()
        .await
        .map_err(|e| internal("failed to snapshot kv keys for watch", e))?;
    let mut set = HashSet::new();
    while let Some(key) = stream.next().await {
        let key = key.map_err(|e| internal("failed to read kv key", e))?;
        if key_matches_filter(&key, filter) {
            set.insert(key);
        }
    }
    debug!(filter, count = set.len(), "watcher snapshot taken");
    Ok(set)
}

fn key_matches_filter(key: &str, filter: &str) -> bool {
    match filter.strip_suffix(".>") {
        Some(prefix) => key.starts_with(prefix) && key[prefix.len()..].starts_with('.'),
        None => key == filter,
    }
}

/// Convenience for components that need to share a `Watcher` behind an
/// `Arc` (e.g. co-owned by a `Bucket`).
pub type SharedWatcher<T> = Arc<Watcher<T>>;
