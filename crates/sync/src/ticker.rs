use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// PERIODIC TICKER
// ================================================================================================

/// Repeatedly invokes a unit of work, sleeping `interval` between
/// invocations.
///
/// The sleep is interruptible: [`PeriodicTicker::stop`] cancels a pending
/// sleep immediately and waits for an in-flight invocation to finish. The
/// work closure is expected to swallow its own errors; whatever it returns,
/// the ticker simply waits out the interval and invokes it again.
pub struct PeriodicTicker {
    interval: Duration,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTicker {
    pub fn new(interval: Duration) -> Self {
        Self { interval, cancel: CancellationToken::new(), handle: None }
    }

    /// Starts the tick loop. Calling `start` on a ticker that is already
    /// running is a no-op.
    pub fn start<F, Fut>(&mut self, mut work: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.handle.is_some() {
            return;
        }

        let cancel = self.cancel.clone();
        let interval = self.interval;
        self.handle = Some(tokio::spawn(async move {
            loop {
                work().await;
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {},
                }
            }
        }));
    }

    /// Cancels the loop and waits for an in-flight invocation to finish.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;

    #[tokio::test]
    async fn work_is_invoked_repeatedly() {
        let count = Arc::new(AtomicU32::new(0));
        let mut ticker = PeriodicTicker::new(Duration::from_millis(5));
        {
            let count = count.clone();
            ticker.start(move || {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        tokio::time::sleep(Duration::from_millis(60)).await;
        ticker.stop().await;

        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn stop_interrupts_the_sleep() {
        let mut ticker = PeriodicTicker::new(Duration::from_secs(3600));
        ticker.start(|| async {});

        // Let the first invocation complete so the ticker is parked in its
        // hour-long sleep.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = Instant::now();
        ticker.stop().await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let count = Arc::new(AtomicU32::new(0));
        let mut ticker = PeriodicTicker::new(Duration::from_secs(3600));
        for _ in 0..2 {
            let count = count.clone();
            ticker.start(move || {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        ticker.stop().await;

        // A second loop would have produced a second immediate invocation.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
