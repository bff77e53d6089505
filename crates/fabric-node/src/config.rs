//! Node configuration. All values come from the environment, following
//! the teacher's `sr-governor::config::GovernorConfig` pattern.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub nats_url: String,
    pub producer_name: String,
    pub peer_id: String,
    pub shards: Vec<String>,
    pub replicas: usize,
    pub heartbeat_interval_ms: u64,
    pub nak_max_delay_ms: u64,
    pub health_port: u16,
    pub log_level: String,
    pub service_name: String,
    pub consumer_params: serde_json::Value,
}

impl NodeConfig {
    pub fn from_env() -> Self {
        Self {
            nats_url: std::env::var("FABRIC_NATS_URL")
                .unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            producer_name: std::env::var("FABRIC_PRODUCER_NAME")
                .unwrap_or_else(|_| "default".to_string()),
            peer_id: std::env::var("FABRIC_PEER_ID").unwrap_or_else(|_| fabric_core::peer_id()),
            shards: std::env::var("FABRIC_SHARDS")
                .ok()
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect::<Vec<_>>()
                })
                .filter(|shards| !shards.is_empty())
                .unwrap_or_else(|| fabric_core::shard_sequence(12)),
            replicas: std::env::var("FABRIC_REPLICAS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),
            heartbeat_interval_ms: std::env::var("FABRIC_HEARTBEAT_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(15_000),
            nak_max_delay_ms: std::env::var("FABRIC_NAK_MAX_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60_000),
            health_port: std::env::var("FABRIC_HEALTH_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8080),
            log_level: std::env::var("FABRIC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            service_name: std::env::var("FABRIC_SERVICE_NAME")
                .unwrap_or_else(|_| "fabric-node".to_string()),
            consumer_params: std::env::var("FABRIC_CONSUMER_PARAMS")
                .ok()
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_else(|| serde_json::json!({})),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn nak_max_delay(&self) -> Duration {
        Duration::from_millis(self.nak_max_delay_ms)
    }
}
