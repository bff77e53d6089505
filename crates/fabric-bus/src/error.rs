//! Bus-level error wrapping.
//!
//! `async-nats` exposes one error type per operation kind (connect, publish,
//! KV get/put/create/update, consumer creation, ...). Rather than match on
//! the concrete error enums for every call site (they differ across
//! operations), `BusError` normalizes all of them into a
//! [`fabric_core::error::FabricError`] at the point they're produced,
//! following the teacher's `sr-adapters::nats` convention of mapping every
//! `async_nats`/`jetstream` error into the adapter's own error type with
//! `format!("...: {}", e)` (see `NatsMessageBus::ensure_stream`).

use fabric_core::error::FabricError;

/// JetStream KV API error code for a failed compare-and-swap ("wrong last
/// sequence"), the canonical retryable case (spec §5, §7).
pub const WRONG_LAST_SEQUENCE: &str = "10071";

/// True if `err`'s display text carries the JetStream KV "wrong last
/// sequence" signal. `async-nats`'s KV error kinds don't expose the raw
/// JetStream API error code as a typed variant in every release, so this
/// follows the teacher's string-matching convention (`nats.rs` maps errors
/// via `format!("...: {}", e)` rather than downcasting) applied to the one
/// code this fabric actually branches on.
pub fn is_wrong_last_sequence(err: &(dyn std::error::Error + 'static)) -> bool {
    let text = err.to_string();
    text.contains(WRONG_LAST_SEQUENCE) || text.contains("wrong last sequence")
}

pub fn internal(context: &str, err: impl std::error::Error + Send + Sync + 'static) -> FabricError {
    FabricError::internal_from(format!("{context}: {err}"), err)
}
