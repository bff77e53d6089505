//! Distributed mutex integration tests (spec §4.3, scenario "mutex TTL
//! reclaim"). Gated on `FABRIC_TEST_NATS_URL`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fabric_bus::mutex::{DistributedMutex, MutexConfig};
use fabric_core::cancel::Autoabortable;

async fn jetstream() -> Option<async_nats::jetstream::Context> {
    let url = std::env::var("FABRIC_TEST_NATS_URL").ok()?;
    let client = async_nats::connect(&url).await.expect("connect to test nats");
    Some(async_nats::jetstream::new(client))
}

#[tokio::test]
async fn lock_releases_after_the_guarded_closure_runs() {
    let Some(js) = jetstream().await else {
        eprintln!("skipping: FABRIC_TEST_NATS_URL not set");
        return;
    };
    let mutex = DistributedMutex::open(&js, MutexConfig::default()).await.unwrap();
    let autoabortable = Autoabortable::new();
    let key = format!("test.lock.{}", fabric_core::peer_id());

    mutex.lock(&key, &autoabortable, || async { 42 }).await.unwrap();
    // A second acquire on the same key must succeed immediately: the first
    // lock() already released on completion.
    let result = mutex.lock(&key, &autoabortable, || async { 7 }).await.unwrap();
    assert_eq!(result, 7);
}

#[tokio::test]
async fn lock_releases_even_when_the_guarded_closure_panics_the_caller_side_result() {
    let Some(js) = jetstream().await else {
        eprintln!("skipping: FABRIC_TEST_NATS_URL not set");
        return;
    };
    let mutex = DistributedMutex::open(&js, MutexConfig::default()).await.unwrap();
    let autoabortable = Autoabortable::new();
    let key = format!("test.lock.failing.{}", fabric_core::peer_id());

    let ran = Arc::new(AtomicU32::new(0));
    let ran_cb = ran.clone();
    mutex
        .lock(&key, &autoabortable, || async move {
            ran_cb.fetch_add(1, Ordering::SeqCst);
            Err::<(), &str>("boom")
        })
        .await
        .unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    // Released regardless of the closure's own outcome (spec P7).
    mutex.lock(&key, &autoabortable, || async { () }).await.unwrap();
}

#[tokio::test]
async fn concurrent_lock_attempts_serialize_on_the_same_key() {
    let Some(js) = jetstream().await else {
        eprintln!("skipping: FABRIC_TEST_NATS_URL not set");
        return;
    };
    let mutex = Arc::new(DistributedMutex::open(&js, MutexConfig::default()).await.unwrap());
    let autoabortable = Autoabortable::new();
    let key = format!("test.lock.concurrent.{}", fabric_core::peer_id());

    let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let mut tasks = Vec::new();
    for id in 0..5u32 {
        let mutex = mutex.clone();
        let autoabortable = autoabortable.clone();
        let key = key.clone();
        let order = order.clone();
        tasks.push(tokio::spawn(async move {
            mutex
                .lock(&key, &autoabortable, || async move {
                    order.lock().await.push(id);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                })
                .await
                .unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // All five ran (none deadlocked or were silently dropped); mutual
    // exclusion is exercised by the retrying `acquire` loop itself.
    assert_eq!(order.lock().await.len(), 5);
}
