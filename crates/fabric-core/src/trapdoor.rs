//! The process-wide uncaught-exception sink ("trapdoor").
//!
//! Listeners, timers, and schedulers never let a callback failure tear down
//! their loop (spec §7 rule 2); instead the failure is tagged with the
//! component that produced it and pushed here. Shutdown-driven cancellation
//! is filtered out before it reaches the sink (spec §7 rule 3) so a clean
//! teardown never reads as a fault in the logs.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::FabricError;

/// A failure reported to the trapdoor, tagged with the component that
/// caught it.
#[derive(Debug, Clone)]
pub struct TrappedError {
    pub component: &'static str,
    pub message: String,
}

/// Process-wide uncaught-exception sink. One instance lives per `Backend`
/// (spec §9: never a process singleton); cloning is cheap and shares the
/// broadcast channel.
#[derive(Clone)]
pub struct Trapdoor {
    tx: broadcast::Sender<TrappedError>,
}

impl Trapdoor {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Trapdoor { tx }
    }

    /// Report a failure from `component`. `AutoabortableError`-rooted
    /// failures are swallowed (logged at debug, not pushed to subscribers).
    pub fn report(&self, component: &'static str, err: &FabricError) {
        if err.is_cancellation() {
            debug!(component, "swallowed cancellation during shutdown");
            return;
        }
        warn!(component, error = %err, "uncaught error reported to trapdoor");
        let _ = self.tx.send(TrappedError {
            component,
            message: err.to_string(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrappedError> {
        self.tx.subscribe()
    }
}

impl Default for Trapdoor {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle, convenient for components that only need to report.
pub type SharedTrapdoor = Arc<Trapdoor>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_not_forwarded_to_subscribers() {
        let trapdoor = Trapdoor::new();
        let mut rx = trapdoor.subscribe();
        trapdoor.report("test", &FabricError::cancelled());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn ordinary_errors_reach_subscribers() {
        let trapdoor = Trapdoor::new();
        let mut rx = trapdoor.subscribe();
        trapdoor.report("test", &FabricError::internal("boom"));
        let trapped = rx.try_recv().unwrap();
        assert_eq!(trapped.component, "test");
        assert_eq!(trapped.message, "boom");
    }
}
