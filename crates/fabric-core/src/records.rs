//! Wire/KV record shapes (spec §3, §6).
//!
//! Per spec §9 ("dynamic dispatch on value shape ... must become tagged
//! variants"), `KvOperation` and `ProducerUpdate` are proper enums rather
//! than `typeof`-style checks on a shared struct.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A KV watch entry's operation, per spec §4.2/§6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KvOperation {
    Put,
    Delete,
}

/// `distribution` cell value (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionRecord {
    /// Ordered list of shard names.
    pub shards: Vec<String>,
    /// Desired replica count per shard.
    pub replicas: usize,
    /// Peer id -> shards assigned to that peer.
    pub distribution: BTreeMap<String, Vec<String>>,
    /// Monotonically increasing generation (sourced from the KV revision
    /// at the time of rebalance).
    pub revision: u64,
    /// Peer id that wrote this record.
    pub author: String,
}

impl DistributionRecord {
    pub fn empty(shards: Vec<String>, replicas: usize) -> Self {
        DistributionRecord {
            shards,
            replicas,
            distribution: BTreeMap::new(),
            revision: 0,
            author: String::new(),
        }
    }

    pub fn shards_for(&self, peer_id: &str) -> Option<&[String]> {
        self.distribution.get(peer_id).map(|v| v.as_slice())
    }
}

/// `instances.<peerId>` value (spec §3). TTL is implicit via periodic
/// re-put from the heartbeat timer; absence means offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub seen: DateTime<Utc>,
}

impl InstanceRecord {
    pub fn now() -> Self {
        InstanceRecord { seen: Utc::now() }
    }
}

/// `subscriptions.<shard>.<paramHash>` value (spec §3). Overwritten (not
/// mutated) on every subscribe call so `seen` renews.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub seen: DateTime<Utc>,
    pub stream: String,
    pub params: serde_json::Value,
}

/// A decoded update from the instances/distribution watchers, tagged by
/// operation rather than checked by value shape (spec §9).
#[derive(Debug, Clone)]
pub enum ProducerUpdate<T> {
    Put { key: String, revision: u64, value: T },
    Del { key: String, revision: u64 },
}

impl<T> ProducerUpdate<T> {
    pub fn revision(&self) -> u64 {
        match self {
            ProducerUpdate::Put { revision, .. } => *revision,
            ProducerUpdate::Del { revision, .. } => *revision,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            ProducerUpdate::Put { key, .. } => key,
            ProducerUpdate::Del { key, .. } => key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribution_record_shards_for_missing_peer_is_none() {
        let record = DistributionRecord::empty(vec!["a".into()], 2);
        assert!(record.shards_for("nobody").is_none());
    }

    #[test]
    fn producer_update_exposes_revision_and_key_for_both_variants() {
        let put: ProducerUpdate<u32> = ProducerUpdate::Put {
            key: "k".into(),
            revision: 5,
            value: 1,
        };
        let del: ProducerUpdate<u32> = ProducerUpdate::Del {
            key: "k".into(),
            revision: 6,
        };
        assert_eq!(put.revision(), 5);
        assert_eq!(del.revision(), 6);
        assert_eq!(put.key(), "k");
        assert_eq!(del.key(), "k");
    }
}
