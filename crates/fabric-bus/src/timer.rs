//! Timer and Scheduler (spec §4.8): a drift-free periodic timer and a
//! debounced, re-armable one-shot.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use fabric_core::error::FabricError;
use fabric_core::trapdoor::SharedTrapdoor;

/// Periodic callback at interval `I`. Ticks stay aligned to the original
/// epoch modulo `I` (`delay = I - ((now - started) mod I)`) so a slow
/// callback does not accumulate drift (spec §4.8, scenario 6). `destroy`
/// cancels the pending tick; a tick already in flight runs to completion
/// and then does not reschedule.
pub struct Timer {
    token: CancellationToken,
    handle: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub fn start<F, Fut>(
        component: &'static str,
        interval: Duration,
        trapdoor: SharedTrapdoor,
        mut callback: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), FabricError>> + Send,
    {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let started = Instant::now();

        let handle = tokio::spawn(async move {
            loop {
                let delay = next_aligned_delay(started, interval);
                tokio::select! {
                    biased;
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                if loop_token.is_cancelled() {
                    break;
                }
                if let Err(err) = callback().await {
                    trapdoor.report(component, &err);
                }
            }
        });

        Timer {
            token,
            handle: AsyncMutex::new(Some(handle)),
        }
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub async fn destroy(self) {
        self.stop();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

fn next_aligned_delay(started: Instant, interval: Duration) -> Duration {
    if interval.is_zero() {
        return Duration::ZERO;
    }
    let elapsed = Instant::now().saturating_duration_since(started);
    let drift_nanos = elapsed.as_nanos() % interval.as_nanos();
    interval - Duration::from_nanos(drift_nanos as u64)
}

/// A debounced, re-armable one-shot. `schedule(delay)` arms if not already
/// armed and not destroyed; calls before firing are no-ops. The callback
/// receives `(now, scheduler)` so it can re-arm itself with the next
/// computed delay (spec §4.8).
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    token: CancellationToken,
    armed: StdMutex<bool>,
    handle: StdMutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            inner: Arc::new(SchedulerInner {
                token: CancellationToken::new(),
                armed: StdMutex::new(false),
                handle: StdMutex::new(None),
            }),
        }
    }

    pub fn schedule<F, Fut>(
        &self,
        delay: Duration,
        component: &'static str,
        trapdoor: SharedTrapdoor,
        callback: F,
    ) where
        F: Fn(DateTime<Utc>, Scheduler) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), FabricError>> + Send,
    {
        {
            let mut armed = self.inner.armed.lock().unwrap();
            if *armed || self.inner.token.is_cancelled() {
                return;
            }
            *armed = true;
        }

        let inner = self.inner.clone();
        let this = self.clone();
        let token = self.inner.token.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    *inner.armed.lock().unwrap() = false;
                    if !token.is_cancelled() {
                        if let Err(err) = callback(Utc::now(), this).await {
                            trapdoor.report(component, &err);
                        }
                    }
                }
            }
        });

        *self.inner.handle.lock().unwrap() = Some(handle);
    }

    pub fn is_armed(&self) -> bool {
        *self.inner.armed.lock().unwrap()
    }

    pub fn stop(&self) {
        self.inner.token.cancel();
    }

    pub async fn destroy(self) {
        self.stop();
        let handle = self.inner.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_delay_targets_the_next_interval_boundary() {
        let started = Instant::now() - Duration::from_millis(400);
        let delay = next_aligned_delay(started, Duration::from_millis(1000));
        assert!(delay <= Duration::from_millis(600));
        assert!(delay > Duration::from_millis(500));
    }

    #[tokio::test]
    async fn scheduler_debounces_to_the_first_requested_delay() {
        use fabric_core::trapdoor::Trapdoor;
        use std::sync::atomic::{AtomicU32, Ordering};

        let trapdoor = Arc::new(Trapdoor::new());
        let scheduler = Scheduler::new();
        let fires = Arc::new(AtomicU32::new(0));

        let fires_cb = fires.clone();
        scheduler.schedule(Duration::from_millis(20), "test", trapdoor.clone(), move |_now, _sched| {
            let fires = fires_cb.clone();
            async move {
                fires.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        assert!(scheduler.is_armed());

        // A second call before firing is a no-op.
        scheduler.schedule(Duration::from_millis(1), "test", trapdoor.clone(), move |_now, _sched| async { Ok(()) });

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fires.load(Ordering::SeqCst), 1);
    }
}
