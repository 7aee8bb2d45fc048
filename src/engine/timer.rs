use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

/// Handle to a scheduled timer. Dropping or canceling it stops the
/// underlying task; firing callbacks run on the tokio runtime.
#[derive(Debug)]
pub struct Timer {
    handle: JoinHandle<()>,
}

impl Timer {
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct TimerQueue;

impl TimerQueue {
    /// Fire `f` once after `due`, then every `interval` if one is given.
    pub fn make_timer<F>(due: Duration, interval: Option<Duration>, mut f: F) -> Timer
    where
        F: FnMut() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            time::sleep(due).await;
            f();
            if let Some(every) = interval {
                let mut ticker = time::interval(every);
                // the first tick completes immediately
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    f();
                }
            }
        });
        Timer { handle }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_timer() {
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        let timer = TimerQueue::make_timer(Duration::from_millis(50), None, move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(timer.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_timer_repeats_until_cancel() {
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        let timer = TimerQueue::make_timer(
            Duration::from_millis(10),
            Some(Duration::from_millis(10)),
            move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        time::sleep(Duration::from_millis(100)).await;
        let seen = fired.load(Ordering::SeqCst);
        assert!(seen >= 3, "timer fired {} times", seen);

        timer.cancel();
        let after_cancel = fired.load(Ordering::SeqCst);
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), after_cancel);
    }
}
