//! Distributed mutex (spec §4.3): TTL-scoped lock on a key in a
//! memory-storage KV bucket, acquired via atomic `create` and released via
//! a revision-guarded delete.

use std::future::Future;
use std::time::Duration;

use async_nats::jetstream::Context;
use tracing::warn;

use fabric_core::cancel::Autoabortable;
use fabric_core::error::FabricError;
use fabric_core::names::locks_bucket;
use fabric_core::retry::{RetryOutcome, RetryPolicy};

use crate::error::is_wrong_last_sequence;
use crate::kv::Bucket;

#[derive(Debug, Clone, Copy)]
pub struct MutexConfig {
    pub lock_timeout: Duration,
}

impl Default for MutexConfig {
    fn default() -> Self {
        MutexConfig {
            lock_timeout: Duration::from_secs(10),
        }
    }
}

/// TTL-scoped distributed lock over the shared `locks` bucket (spec §4.3,
/// §6). One `DistributedMutex` per process serves every key.
pub struct DistributedMutex {
    bucket: Bucket,
    config: MutexConfig,
}

impl DistributedMutex {
    pub async fn open(js: &Context, config: MutexConfig) -> Result<Self, FabricError> {
        let bucket = Bucket::open_memory(js, locks_bucket(), config.lock_timeout).await?;
        Ok(DistributedMutex { bucket, config })
    }

    /// Acquire `key`, run `f`, then release — even if `f` fails (spec P7:
    /// release after failure of `f` still unlocks).
    pub async fn lock<F, Fut, R>(
        &self,
        key: &str,
        autoabortable: &Autoabortable,
        f: F,
    ) -> Result<R, FabricError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let revision = self.acquire(key, autoabortable).await?;
        let result = f().await;
        self.release(key, revision).await;
        Ok(result)
    }

    async fn acquire(&self, key: &str, autoabortable: &Autoabortable) -> Result<u64, FabricError> {
        let token = autoabortable.child();
        let policy = RetryPolicy {
            retries: 8,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 1.5,
            jitter: 0.1,
        };

        let mut attempts = 0u32;
        let result = policy
            .run(
                &token,
                |err: &async_nats::jetstream::kv::CreateError, _attempt| is_wrong_last_sequence(err),
                || {
                    attempts += 1;
                    self.bucket.store().create(key, Vec::<u8>::new())
                },
            )
            .await;

        match result {
            Ok(revision) => Ok(revision),
            Err(RetryOutcome::Exhausted(err)) => Err(FabricError::client("cannot acquire lock")
                .with_detail("key", key)
                .with_detail("attempts", attempts)
                .with_detail("cause", err.to_string())),
            Err(RetryOutcome::Cancelled(err)) => Err(err),
        }
    }

    /// Revision-guarded delete. If the live entry has already moved past
    /// `revision` — another holder inherited the key after TTL expiry —
    /// the delete is rejected with a wrong-last-sequence error, which is a
    /// no-op here (spec §4.3: "a wrong last sequence on delete is
    /// ignored").
    async fn release(&self, key: &str, revision: u64) {
        if let Err(err) = self
            .bucket
            .store()
            .delete_expect_revision(key, Some(revision))
            .await
        {
            if !is_wrong_last_sequence(&err) {
                warn!(key, error = %err, "failed to release lock");
            }
        }
    }
}
