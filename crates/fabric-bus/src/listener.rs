//! Listener (spec §4.1): drains an async sequence into a user callback.
//! Callback failures are reported to the trapdoor without stopping the
//! loop; a failure of the sequence itself stops the loop (and is also
//! reported). `destroy` awaits natural completion rather than cancelling —
//! callers close the underlying sequence (or its cancellation token) first.

use std::future::Future;

use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use fabric_core::error::FabricError;
use fabric_core::trapdoor::SharedTrapdoor;

pub struct Listener {
    handle: JoinHandle<()>,
}

impl Listener {
    /// Spawn a task draining `stream` into `callback`. `Some(Err(_))` from
    /// the stream is treated as sequence-level failure (reported, loop
    /// stops); `callback` returning `Err(_)` is reported but the loop keeps
    /// running. Cancelling `token` stops the loop without reporting
    /// anything (shutdown is not a failure, spec §7 rule 3).
    pub fn spawn<S, T, F, Fut>(
        component: &'static str,
        token: CancellationToken,
        trapdoor: SharedTrapdoor,
        mut stream: S,
        mut callback: F,
    ) -> Self
    where
        S: Stream<Item = Result<T, FabricError>> + Send + Unpin + 'static,
        T: Send + 'static,
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), FabricError>> + Send,
    {
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    item = stream.next() => {
                        match item {
                            None => break,
                            Some(Err(err)) => {
                                trapdoor.report(component, &err);
                                break;
                            }
                            Some(Ok(value)) => {
                                if let Err(err) = callback(value).await {
                                    trapdoor.report(component, &err);
                                }
                            }
                        }
                    }
                }
            }
        });
        Listener { handle }
    }

    pub async fn destroy(self) {
        let _ = self.handle.await;
    }
}
