//! Spawner<K,V,Child> (spec §4.5): a keyed registry of owned child
//! lifetimes. Every mutation is serialized through one in-process mutex
//! (spec §5), held across the factory/destroy awaits so a logical
//! operation — including `resetItems`'s union/diff — is atomic.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use fabric_core::canon::hash_of;
use fabric_core::error::FabricError;

use crate::destroy::Destroy;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

struct Slot<V, C> {
    hash: String,
    value: V,
    child: C,
}

pub struct Spawner<K, V, C> {
    factory: Arc<dyn Fn(K, V) -> BoxFuture<C> + Send + Sync>,
    children: Mutex<BTreeMap<K, Slot<V, C>>>,
}

impl<K, V, C> Spawner<K, V, C>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Serialize + Clone + Send + Sync + 'static,
    C: Destroy + Send + 'static,
{
    pub fn new<F, Fut>(factory: F) -> Self
    where
        F: Fn(K, V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = C> + Send + 'static,
    {
        Spawner {
            factory: Arc::new(move |k, v| Box::pin(factory(k, v)) as BoxFuture<C>),
            children: Mutex::new(BTreeMap::new()),
        }
    }

    /// Fails if `key` already exists.
    pub async fn spawn_item(&self, key: K, value: V) -> Result<(), FabricError> {
        let mut children = self.children.lock().await;
        self.spawn_locked(&mut children, key, value).await
    }

    async fn spawn_locked(
        &self,
        children: &mut BTreeMap<K, Slot<V, C>>,
        key: K,
        value: V,
    ) -> Result<(), FabricError> {
        if children.contains_key(&key) {
            return Err(FabricError::client("spawner: key already exists"));
        }
        let hash = hash_of(&value);
        let child = (self.factory)(key.clone(), value.clone()).await;
        children.insert(key, Slot { hash, value, child });
        Ok(())
    }

    async fn destroy_locked(&self, children: &mut BTreeMap<K, Slot<V, C>>, key: &K) {
        if let Some(slot) = children.remove(key) {
            slot.child.destroy().await;
        }
    }

    /// Idempotent for unknown keys.
    pub async fn destroy_item(&self, key: &K) {
        let mut children = self.children.lock().await;
        self.destroy_locked(&mut children, key).await;
    }

    /// No-op if absent → spawn, present with equal hash → no-op, present
    /// with a different hash → destroy then spawn.
    pub async fn maybe_respawn_item(&self, key: K, value: V) {
        let mut children = self.children.lock().await;
        let existing_hash = children.get(&key).map(|slot| slot.hash.clone());
        let hash = hash_of(&value);
        match existing_hash {
            None => {
                let _ = self.spawn_locked(&mut children, key, value).await;
            }
            Some(current) if current == hash => {}
            Some(_) => {
                self.destroy_locked(&mut children, &key).await;
                let _ = self.spawn_locked(&mut children, key, value).await;
            }
        }
    }

    /// Respawn for every key in `desired`, destroy every key not in
    /// `desired`.
    pub async fn reset_items(&self, desired: BTreeMap<K, V>) {
        let mut children = self.children.lock().await;

        let stale: Vec<K> = children
            .keys()
            .filter(|key| !desired.contains_key(key))
            .cloned()
            .collect();
        for key in stale {
            self.destroy_locked(&mut children, &key).await;
        }

        for (key, value) in desired {
            let existing_hash = children.get(&key).map(|slot| slot.hash.clone());
            let hash = hash_of(&value);
            match existing_hash {
                None => {
                    let _ = self.spawn_locked(&mut children, key, value).await;
                }
                Some(current) if current == hash => {}
                Some(_) => {
                    self.destroy_locked(&mut children, &key).await;
                    let _ = self.spawn_locked(&mut children, key, value).await;
                }
            }
        }
    }

    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V),
    {
        let children = self.children.lock().await;
        for (key, slot) in children.iter() {
            f(key, &slot.value);
        }
    }

    pub async fn keys(&self) -> Vec<K> {
        self.children.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.children.lock().await.len()
    }

    pub async fn destroy(&self) {
        let mut children = self.children.lock().await;
        let keys: Vec<K> = children.keys().cloned().collect();
        for key in keys {
            self.destroy_locked(&mut children, &key).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counted {
        destroyed: Arc<AtomicU32>,
    }

    impl Destroy for Counted {
        async fn destroy(self) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn spawner(destroyed: Arc<AtomicU32>) -> Spawner<String, u32, Counted> {
        Spawner::new(move |_k: String, _v: u32| {
            let destroyed = destroyed.clone();
            async move { Counted { destroyed } }
        })
    }

    #[tokio::test]
    async fn spawn_item_fails_when_key_already_present() {
        let spawner = spawner(Arc::new(AtomicU32::new(0)));
        spawner.spawn_item("a".into(), 1).await.unwrap();
        let result = spawner.spawn_item("a".into(), 2).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn maybe_respawn_is_a_no_op_for_an_unchanged_value() {
        let destroyed = Arc::new(AtomicU32::new(0));
        let spawner = spawner(destroyed.clone());
        spawner.maybe_respawn_item("a".into(), 1).await;
        spawner.maybe_respawn_item("a".into(), 1).await;
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);
        assert_eq!(spawner.len().await, 1);
    }

    #[tokio::test]
    async fn maybe_respawn_destroys_and_recreates_on_changed_value() {
        let destroyed = Arc::new(AtomicU32::new(0));
        let spawner = spawner(destroyed.clone());
        spawner.maybe_respawn_item("a".into(), 1).await;
        spawner.maybe_respawn_item("a".into(), 2).await;
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(spawner.len().await, 1);
    }

    #[tokio::test]
    async fn reset_items_converges_to_exactly_the_given_key_set() {
        let destroyed = Arc::new(AtomicU32::new(0));
        let spawner = spawner(destroyed.clone());
        spawner.spawn_item("a".into(), 1).await.unwrap();
        spawner.spawn_item("b".into(), 1).await.unwrap();

        let mut desired = BTreeMap::new();
        desired.insert("b".to_string(), 1u32);
        desired.insert("c".to_string(), 1u32);
        spawner.reset_items(desired).await;

        let mut keys = spawner.keys().await;
        keys.sort();
        assert_eq!(keys, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn destroy_empties_the_spawner_and_destroys_every_child() {
        let destroyed = Arc::new(AtomicU32::new(0));
        let spawner = spawner(destroyed.clone());
        spawner.spawn_item("a".into(), 1).await.unwrap();
        spawner.spawn_item("b".into(), 1).await.unwrap();
        spawner.destroy().await;
        assert_eq!(spawner.len().await, 0);
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
    }
}
