//! Summoner<P,Child> (spec §4.6): single-slot variant of Spawner keyed by
//! a value rather than a key, via user-supplied equality.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use fabric_core::canon::hash_of;

use crate::destroy::Destroy;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

struct Slot<P, C> {
    params: P,
    child: C,
}

pub struct Summoner<P, C> {
    factory: Arc<dyn Fn(P) -> BoxFuture<C> + Send + Sync>,
    compare: Arc<dyn Fn(&P, &P) -> bool + Send + Sync>,
    current: Mutex<Option<Slot<P, C>>>,
}

impl<P, C> Summoner<P, C>
where
    P: Serialize + Clone + Send + Sync + 'static,
    C: Destroy + Send + 'static,
{
    /// Default `compare` is canonical-hash equality (spec §4.6).
    pub fn new<F, Fut>(factory: F) -> Self
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = C> + Send + 'static,
    {
        Self::with_compare(factory, |a: &P, b: &P| hash_of(a) == hash_of(b))
    }

    pub fn with_compare<F, Fut, Cmp>(factory: F, compare: Cmp) -> Self
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = C> + Send + 'static,
        Cmp: Fn(&P, &P) -> bool + Send + Sync + 'static,
    {
        Summoner {
            factory: Arc::new(move |p| Box::pin(factory(p)) as BoxFuture<C>),
            compare: Arc::new(compare),
            current: Mutex::new(None),
        }
    }

    /// If no current child, create one. If `compare(current, p)` is true,
    /// no-op. Otherwise destroy then create.
    pub async fn spawn(&self, params: P) {
        let mut current = self.current.lock().await;
        let should_replace = match &*current {
            None => true,
            Some(slot) => !(self.compare)(&slot.params, &params),
        };
        if !should_replace {
            return;
        }
        if let Some(slot) = current.take() {
            slot.child.destroy().await;
        }
        let child = (self.factory)(params.clone()).await;
        *current = Some(Slot { params, child });
    }

    pub async fn kill(&self) {
        let mut current = self.current.lock().await;
        if let Some(slot) = current.take() {
            slot.child.destroy().await;
        }
    }

    pub async fn params(&self) -> Option<P> {
        self.current.lock().await.as_ref().map(|slot| slot.params.clone())
    }

    pub async fn is_alive(&self) -> bool {
        self.current.lock().await.is_some()
    }
}
