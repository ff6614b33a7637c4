//! Cancellable single-shot timers
//!
//! Re-arming cancels the previous arming atomically: every arming gets a
//! generation number and the callback only runs if its generation is still
//! the current one when the sleep completes.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A single-shot timer that can be cancelled and re-armed
#[derive(Clone, Default)]
pub struct OneShotTimer {
    generation: Arc<AtomicU64>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl OneShotTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer, cancelling any earlier arming.
    ///
    /// `on_fire` runs once after `duration` unless the timer is cancelled or
    /// re-armed first.
    pub fn arm<F>(&self, duration: Duration, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut task = self.task.lock();
        if let Some(previous) = task.take() {
            previous.abort();
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let current = self.generation.clone();
        let slot = self.task.clone();

        *task = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            {
                // Detach before firing so the callback may re-arm this timer
                let mut slot = slot.lock();
                if current.load(Ordering::SeqCst) != generation {
                    return;
                }
                slot.take();
            }
            on_fire.await;
        }));
    }

    /// Cancel the timer. Safe to call when not armed.
    pub fn cancel(&self) {
        let mut task = self.task.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(previous) = task.take() {
            previous.abort();
        }
    }

    /// True while an arming is pending
    pub fn is_armed(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }
}

impl std::fmt::Debug for OneShotTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneShotTimer")
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .field("armed", &self.is_armed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_callback(counter: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once() {
        let timer = OneShotTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        timer.arm(Duration::from_secs(5), counter_callback(&fired));
        assert!(timer.is_armed());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let timer = OneShotTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        timer.arm(Duration::from_secs(5), counter_callback(&fired));
        timer.cancel();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous() {
        let timer = OneShotTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        timer.arm(Duration::from_secs(5), counter_callback(&fired));
        tokio::time::sleep(Duration::from_secs(3)).await;
        timer.arm(Duration::from_secs(5), counter_callback(&fired));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_can_rearm() {
        let timer = OneShotTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let inner_timer = timer.clone();
        let inner_fired = fired.clone();
        timer.arm(Duration::from_secs(1), async move {
            inner_fired.fetch_add(1, Ordering::SeqCst);
            inner_timer.arm(Duration::from_secs(1), counter_callback(&inner_fired));
        });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
