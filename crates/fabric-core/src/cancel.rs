//! Process-wide (per-`Backend`) cancellation registry.
//!
//! Spec §5: "`destroy` signals all of them with an `AutoabortableError`.
//! Retry loops accept a token and exit with that error when signaled."
//! Rust's idiom for this is a `CancellationToken` tree: `Autoabortable` owns
//! the root, every owned component gets a child token via `child()`, and
//! `shutdown()` cancels the whole tree in one call. Children inherit
//! cancellation from their parent but can also be cancelled individually
//! (used by `destroy()` on leaf components without tearing down siblings).

use tokio_util::sync::CancellationToken;

use crate::error::FabricError;

/// Owns the root cancellation token for one `Backend` instance. Never a
/// process singleton: one `Autoabortable` per backend, explicit init and
/// teardown.
#[derive(Clone)]
pub struct Autoabortable {
    root: CancellationToken,
}

impl Autoabortable {
    pub fn new() -> Self {
        Autoabortable {
            root: CancellationToken::new(),
        }
    }

    /// A token that cancels when this backend shuts down, independently
    /// cancellable without affecting siblings.
    pub fn child(&self) -> CancellationToken {
        self.root.child_token()
    }

    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }
}

impl Default for Autoabortable {
    fn default() -> Self {
        Self::new()
    }
}

/// Race a future against a cancellation token, mapping cancellation to
/// [`FabricError::cancelled`]. Used by retry loops and any suspension point
/// that must respect shutdown (spec §5: "every `await` on a user callback
/// is a suspension point").
pub async fn cancellable<F, T>(token: &CancellationToken, fut: F) -> Result<T, FabricError>
where
    F: std::future::Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(FabricError::cancelled()),
        value = fut => Ok(value),
    }
}
