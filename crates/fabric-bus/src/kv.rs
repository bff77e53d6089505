//! Typed KV façade: `Bucket` is the untyped physical handle, `Slice<T>` and
//! `Cell<T>` are typed virtual lenses over a prefix or a single key (spec
//! §4.4). Grounded on the teacher's stream/consumer get-or-create idiom
//! (`sr_adapters::nats::ensure_stream`) applied to `jetstream::kv::Store`,
//! which the teacher repo doesn't itself use.

use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use async_nats::jetstream::kv::{Config as KvConfig, Operation as KvWireOperation, Store};
use async_nats::jetstream::stream::StorageType;
use async_nats::jetstream::Context;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use fabric_core::cancel::Autoabortable;
use fabric_core::error::FabricError;
use fabric_core::records::KvOperation;
use fabric_core::trapdoor::SharedTrapdoor;

use crate::error::{internal, is_wrong_last_sequence};
use crate::watcher::{WatchOptions, Watcher};

/// A decoded entry: the value (absent for a tombstone) plus the KV
/// revision a caller needs for compare-and-swap writes.
#[derive(Debug, Clone)]
pub struct Entry<T> {
    pub value: Option<T>,
    pub revision: u64,
}

/// Untyped physical KV handle. Storage mode mirrors spec §6: the `locks`
/// bucket is memory-backed with a per-key TTL; producer buckets are
/// durable file storage.
#[derive(Clone)]
pub struct Bucket {
    store: Store,
    name: String,
    /// Root of the cancellation tree shared with every non-detached
    /// `Watcher` this bucket hands out, so `Bucket::shutdown` stops them
    /// without the caller having to track and destroy each one itself
    /// (spec §4.4, §5: the bucket co-owns non-detached watchers).
    autoabortable: Autoabortable,
}

impl Bucket {
    /// Get or create a file-storage bucket (spec §3's `producer.<name>`).
    pub async fn open_file(js: &Context, name: &str) -> Result<Self, FabricError> {
        Self::open(js, name, StorageType::File, None).await
    }

    /// Get or create a memory-storage bucket with a per-key TTL (spec
    /// §4.3's `locks` bucket).
    pub async fn open_memory(js: &Context, name: &str, ttl: Duration) -> Result<Self, FabricError> {
        Self::open(js, name, StorageType::Memory, Some(ttl)).await
    }

    async fn open(
        js: &Context,
        name: &str,
        storage: StorageType,
        ttl: Option<Duration>,
    ) -> Result<Self, FabricError> {
        match js.get_key_value(name).await {
            Ok(store) => Ok(Bucket {
                store,
                name: name.to_string(),
                autoabortable: Autoabortable::new(),
            }),
            Err(_) => {
                debug!(bucket = name, "creating kv bucket");
                let config = KvConfig {
                    bucket: name.to_string(),
                    storage,
                    max_age: ttl.unwrap_or_default(),
                    history: 1,
                    ..Default::default()
                };
                let store = js
                    .create_key_value(config)
                    .await
                    .map_err(|e| internal("failed to create kv bucket", e))?;
                Ok(Bucket {
                    store,
                    name: name.to_string(),
                    autoabortable: Autoabortable::new(),
                })
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Stops every non-detached `Watcher` handed out by this bucket's
    /// `Cell`/`Slice` lenses. Does not await their tasks' completion — a
    /// caller that needs that still calls `destroy` on the `Watcher` it
    /// holds; this only guarantees the loop stops even if it never does.
    pub fn shutdown(&self) {
        self.autoabortable.shutdown();
    }

    /// A typed, single-key lens (spec §4.4).
    pub fn cell<T>(&self, key: impl Into<String>) -> Cell<T> {
        Cell {
            store: self.store.clone(),
            key: key.into(),
            autoabortable: self.autoabortable.clone(),
            _marker: PhantomData,
        }
    }

    /// A typed, prefix-scoped lens (spec §4.4).
    pub fn slice<T>(&self, prefix: impl Into<String>) -> Slice<T> {
        Slice {
            store: self.store.clone(),
            prefix: prefix.into(),
            autoabortable: self.autoabortable.clone(),
            _marker: PhantomData,
        }
    }
}

fn decode<T: DeserializeOwned>(key: &str, raw: &[u8]) -> Result<T, FabricError> {
    serde_json::from_slice(raw).map_err(|e| {
        FabricError::internal_from("failed to decode kv entry", e)
            .with_detail("key", key)
            .with_detail("raw_len", raw.len())
    })
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, FabricError> {
    serde_json::to_vec(value).map_err(|e| FabricError::internal_from("failed to encode kv value", e))
}

/// A cell: a typed lens pinned to one full key.
#[derive(Clone)]
pub struct Cell<T> {
    store: Store,
    key: String,
    autoabortable: Autoabortable,
    _marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned + Send + Sync + 'static> Cell<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn get(&self) -> Result<Entry<T>, FabricError> {
        get_raw(&self.store, &self.key).await
    }

    pub async fn put(&self, value: &T) -> Result<u64, FabricError> {
        put_raw(&self.store, &self.key, value).await
    }

    pub async fn delete(&self) -> Result<(), FabricError> {
        delete_raw(&self.store, &self.key).await
    }

    /// Read-modify-write: `f` receives the current entry and a `write`
    /// closure; calling `write` issues a compare-and-swap create/update
    /// against the revision that was read. `f` may choose not to call it.
    pub async fn mutate<F, Fut>(&self, f: F) -> Result<Option<u64>, FabricError>
    where
        F: FnOnce(Entry<T>) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        mutate_raw(&self.store, &self.key, f).await
    }

    /// Same as [`Cell::mutate`], wrapped in a bounded retry on KV code
    /// 10071 (spec §4.4's canonical compare-and-swap loop).
    pub async fn mutate_using<F, Fut>(
        &self,
        autoabortable: &Autoabortable,
        f: F,
    ) -> Result<Option<u64>, FabricError>
    where
        F: Fn(Entry<T>) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        mutate_using_raw(&self.store, &self.key, autoabortable, f).await
    }

    /// `opts.detach == false` (the default) ties the watcher's lifetime to
    /// this cell's bucket: its loop stops when the bucket shuts down, even
    /// if the caller never calls `destroy` on it. `detach == true` hands
    /// the caller a fully independent watcher instead.
    pub fn watch(&self, trapdoor: SharedTrapdoor, opts: WatchOptions) -> Watcher<T> {
        let token = watch_token(&self.autoabortable, opts);
        Watcher::new(self.store.clone(), self.key.clone(), trapdoor, opts, token)
    }
}

/// A slice: a typed lens scoped to `prefix.*`.
#[derive(Clone)]
pub struct Slice<T> {
    store: Store,
    prefix: String,
    autoabortable: Autoabortable,
    _marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned + Send + Sync + 'static> Slice<T> {
    fn full_key(&self, subkey: &str) -> String {
        format!("{}.{}", self.prefix, subkey)
    }

    pub fn filter(&self) -> String {
        format!("{}.>", self.prefix)
    }

    pub async fn get(&self, subkey: &str) -> Result<Entry<T>, FabricError> {
        get_raw(&self.store, &self.full_key(subkey)).await
    }

    pub async fn put(&self, subkey: &str, value: &T) -> Result<u64, FabricError> {
        put_raw(&self.store, &self.full_key(subkey), value).await
    }

    pub async fn delete(&self, subkey: &str) -> Result<(), FabricError> {
        delete_raw(&self.store, &self.full_key(subkey)).await
    }

    /// Lazily enumerated then collected key suffixes (with the prefix and
    /// its trailing `.` stripped) currently live under this slice.
    pub async fn keys(&self) -> Result<Vec<String>, FabricError> {
        let prefix_dot = format!("{}.", self.prefix);
        let mut stream = self
            .store
            .keys()
            .await
            .map_err(|e| internal("failed to list kv keys", e))?;
        let mut out = Vec::new();
        while let Some(key) = stream.next().await {
            let key = key.map_err(|e| internal("failed to read kv key", e))?;
            if let Some(subkey) = key.strip_prefix(&prefix_dot) {
                out.push(subkey.to_string());
            }
        }
        Ok(out)
    }

    /// See [`Cell::watch`] for the `detach` ownership contract.
    pub fn watch(&self, trapdoor: SharedTrapdoor, opts: WatchOptions) -> Watcher<T> {
        let token = watch_token(&self.autoabortable, opts);
        Watcher::new(self.store.clone(), self.filter(), trapdoor, opts, token)
    }
}

fn watch_token(autoabortable: &Autoabortable, opts: WatchOptions) -> CancellationToken {
    if opts.detach {
        CancellationToken::new()
    } else {
        autoabortable.child()
    }
}

async fn get_raw<T: DeserializeOwned>(store: &Store, key: &str) -> Result<Entry<T>, FabricError> {
    match store
        .entry(key)
        .await
        .map_err(|e| internal("failed to read kv entry", e))?
    {
        None => Ok(Entry {
            value: None,
            revision: 0,
        }),
        Some(entry) if matches!(entry.operation, KvWireOperation::Delete | KvWireOperation::Purge) => {
            Ok(Entry {
                value: None,
                revision: entry.revision,
            })
        }
        Some(entry) => Ok(Entry {
            value: Some(decode(key, &entry.value)?),
            revision: entry.revision,
        }),
    }
}

async fn put_raw<T: Serialize>(store: &Store, key: &str, value: &T) -> Result<u64, FabricError> {
    let payload = encode(value)?;
    store
        .put(key, payload.into())
        .await
        .map_err(|e| internal("failed to put kv value", e))
}

async fn delete_raw(store: &Store, key: &str) -> Result<(), FabricError> {
    store
        .delete(key)
        .await
        .map_err(|e| internal("failed to delete kv value", e))
}

async fn mutate_raw<T, F, Fut>(store: &Store, key: &str, f: F) -> Result<Option<u64>, FabricError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce(Entry<T>) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let current = get_raw(store, key).await?;
    let revision = current.revision;
    let had_value = current.value.is_some();
    match f(current).await {
        None => Ok(None),
        Some(next) => {
            let payload = encode(&next)?;
            let new_revision = if had_value {
                store
                    .update(key, payload.into(), revision)
                    .await
                    .map_err(|e| internal("failed to update kv value", e))?
            } else {
                store
                    .create(key, payload.into())
                    .await
                    .map_err(|e| internal("failed to create kv value", e))?
            };
            Ok(Some(new_revision))
        }
    }
}

async fn mutate_using_raw<T, F, Fut>(
    store: &Store,
    key: &str,
    autoabortable: &Autoabortable,
    f: F,
) -> Result<Option<u64>, FabricError>
where
    T: Serialize + DeserializeOwned,
    F: Fn(Entry<T>) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    use fabric_core::retry::{RetryOutcome, RetryPolicy};

    let token = autoabortable.child();
    let policy = RetryPolicy::default();
    let result = policy
        .run(
            &token,
            |err: &FabricError, _attempt| {
                err.details()
                    .get("retryable")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
            },
            || async {
                mutate_raw(store, key, &f).await.map_err(|err| {
                    if is_cas_conflict(&err) {
                        err.with_detail("retryable", true)
                    } else {
                        err
                    }
                })
            },
        )
        .await;

    match result {
        Ok(value) => Ok(value),
        Err(RetryOutcome::Exhausted(err)) => Err(err),
        Err(RetryOutcome::Cancelled(err)) => Err(err),
    }
}

fn is_cas_conflict(err: &FabricError) -> bool {
    match err {
        FabricError::Internal { source: Some(source), .. } => is_wrong_last_sequence(source.as_ref()),
        _ => false,
    }
}

/// Convert a JetStream KV `Operation` into the fabric's tagged
/// [`KvOperation`] (spec §9: no `typeof`-style dispatch).
pub fn kv_operation_of(op: KvWireOperation) -> KvOperation {
    match op {
        KvWireOperation::Put => KvOperation::Put,
        KvWireOperation::Delete | KvWireOperation::Purge => KvOperation::Delete,
    }
}
