//! Forced reporting before the Lambda deadline.
//!
//! When a function runs into its timeout, Lambda freezes the process and nothing
//! after that point runs. The [`DeadlineGuard`] schedules a callback shortly before
//! the deadline so a report is still attempted. Normal completion cancels it.
//!
//! Cancellation can race with the timer firing. The guard only reports who won;
//! the caller decides what happens with a report that was already sent.

use crate::constants::defaults;
use crate::logger::Logger;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

static LOGGER: Logger = Logger::const_new("deadline");

/// Seconds reserved before the deadline.
///
/// An explicit buffer always wins. Otherwise 10% of the remaining time, kept
/// between 0.5 and 3 seconds.
pub fn timeout_buffer(remaining: Duration, explicit: Option<f64>) -> Duration {
    let seconds = match explicit {
        Some(buffer) => buffer,
        None => (defaults::TIMEOUT_BUFFER_RATIO * remaining.as_secs_f64()).clamp(
            defaults::MIN_TIMEOUT_BUFFER_SECS,
            defaults::MAX_TIMEOUT_BUFFER_SECS,
        ),
    };
    Duration::try_from_secs_f64(seconds).unwrap_or_default()
}

/// A one-shot timer task that runs a callback unless cancelled first.
#[derive(Debug)]
pub struct DeadlineGuard {
    cancel_tx: Option<oneshot::Sender<()>>,
    fired: Arc<AtomicBool>,
}

impl DeadlineGuard {
    /// Schedules `callback` to run after `delay`.
    ///
    /// Returns `None` when there is no tokio runtime to run the timer on.
    pub fn arm<F, Fut>(delay: Duration, callback: F) -> Option<Self>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            LOGGER.warn("No tokio runtime available, the deadline guard is not armed");
            return None;
        };

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let fired = Arc::new(AtomicBool::new(false));
        let task_fired = fired.clone();

        handle.spawn(async move {
            tokio::select! {
                biased;
                _ = cancel_rx => {}
                _ = tokio::time::sleep(delay) => {
                    task_fired.store(true, Ordering::SeqCst);
                    LOGGER.info("Deadline reached, flushing spans");
                    callback().await;
                }
            }
        });

        LOGGER.debug(format!("Deadline guard armed for {delay:?}"));
        Some(Self {
            cancel_tx: Some(cancel_tx),
            fired,
        })
    }

    /// Whether the callback has started.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Cancels the timer. Returns `true` if the callback had not started yet.
    pub fn cancel(&mut self) -> bool {
        let Some(tx) = self.cancel_tx.take() else {
            return false;
        };
        // A send error means the task already finished.
        let delivered = tx.send(()).is_ok();
        delivered && !self.has_fired()
    }
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_guard(delay: Duration, counter: Arc<AtomicUsize>) -> DeadlineGuard {
        DeadlineGuard::arm(delay, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap()
    }

    #[test]
    fn test_timeout_buffer() {
        assert_eq!(timeout_buffer(Duration::from_secs(10), None), Duration::from_secs(1));
        assert_eq!(timeout_buffer(Duration::from_secs(1), None), Duration::from_millis(500));
        assert_eq!(timeout_buffer(Duration::from_secs(100), None), Duration::from_secs(3));
        assert_eq!(timeout_buffer(Duration::from_secs(100), Some(0.2)), Duration::from_millis(200));
        assert_eq!(timeout_buffer(Duration::from_secs(1), Some(5.0)), Duration::from_secs(5));
    }

    #[test]
    fn test_negative_explicit_buffer_is_zero() {
        assert_eq!(timeout_buffer(Duration::from_secs(1), Some(-1.0)), Duration::ZERO);
    }

    #[test]
    fn test_not_armed_without_runtime() {
        assert!(DeadlineGuard::arm(Duration::from_secs(1), || async {}).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut guard = counting_guard(Duration::from_secs(5), counter.clone());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(guard.has_fired());
        assert!(!guard.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_deadline() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut guard = counting_guard(Duration::from_secs(5), counter.clone());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(guard.cancel());
        assert!(!guard.cancel());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let counter = Arc::new(AtomicUsize::new(0));
        drop(counting_guard(Duration::from_secs(5), counter.clone()));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
