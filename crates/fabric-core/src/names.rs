//! Subject and bucket naming (spec §6), kept in one place so producer,
//! consumer, and node binaries never hand-format a subject string twice
//! (grounded on the teacher's `sr_adapters::nats::{subjects, streams}`
//! modules).

/// `.` inside a component name is replaced by `_` when naming streams and
/// consumers (spec §6).
pub fn sanitize_for_stream(name: &str) -> String {
    name.replace('.', "_")
}

pub fn producer_bucket(producer: &str) -> String {
    sanitize_for_stream(&format!("producer.{producer}"))
}

pub fn locks_bucket() -> &'static str {
    "locks"
}

pub fn instance_key(peer_id: &str) -> String {
    format!("instances.{peer_id}")
}

pub fn instances_prefix() -> &'static str {
    "instances"
}

pub const DISTRIBUTION_KEY: &str = "distribution";

pub fn subscription_key(shard: &str, param_hash: &str) -> String {
    format!("subscriptions.{shard}.{param_hash}")
}

pub fn subscriptions_shard_prefix(shard: &str) -> String {
    format!("subscriptions.{shard}")
}

pub fn subscribe_subject(producer: &str) -> String {
    format!("producer.{producer}.subscribe")
}

pub fn subscription_stream_name(producer: &str, param_hash: &str) -> String {
    sanitize_for_stream(&format!("producer.{producer}.{param_hash}"))
}

pub fn subscription_subject(producer: &str, param_hash: &str) -> String {
    format!("producer.{producer}.{param_hash}")
}

pub fn app_topic(client: &str, topic: &str) -> String {
    format!("app.{client}.{topic}")
}

pub fn app_service_method(client: &str, service: &str, method: &str) -> String {
    format!("app.{client}.{service}.{method}")
}
