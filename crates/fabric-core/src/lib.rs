//! Fabric domain core
//!
//! Pure types and algorithms shared by `fabric-bus` and `fabric-producer`.
//! Per the design notes, this crate has no NATS dependency: the bus is a
//! fixed external collaborator, not a swappable port, so there is nothing
//! here to abstract over it.

pub mod canon;
pub mod cancel;
pub mod distribute;
pub mod error;
pub mod ids;
pub mod names;
pub mod records;
pub mod retry;
pub mod trapdoor;

pub use canon::{canonicalize, hash_of};
pub use cancel::Autoabortable;
pub use distribute::distribute;
pub use error::{Envelope, ErrorCode, FabricError};
pub use ids::{peer_id, shard_sequence};
pub use records::{DistributionRecord, InstanceRecord, KvOperation, SubscriptionRecord};
pub use retry::{RetryPolicy, RetryableError};
pub use trapdoor::Trapdoor;
