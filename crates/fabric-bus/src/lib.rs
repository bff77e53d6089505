//! NATS/JetStream-backed fabric primitives.
//!
//! Builds the bus-facing layer spec.md calls out in §4.1-4.4, §4.7-4.8:
//! Listener, Watcher, Bucket/Slice/Cell, the distributed Mutex,
//! Subscription/Service, and Timer/Scheduler. Everything here assumes a
//! connected [`async_nats::Client`] and (where JetStream is needed) a
//! [`async_nats::jetstream::Context`] — both are fixed external
//! collaborators per spec.md §1, not swapped out behind a trait.

pub mod error;
pub mod kv;
pub mod listener;
pub mod mutex;
pub mod pubsub;
pub mod stream;
pub mod timer;
pub mod watcher;

pub use error::BusError;
pub use kv::{Bucket, Cell, Slice};
pub use listener::Listener;
pub use mutex::{DistributedMutex, MutexConfig};
pub use pubsub::{Service, ServiceMethod, Subscription};
pub use timer::{Scheduler, Timer};
pub use watcher::{Watcher, WatcherUpdate};
