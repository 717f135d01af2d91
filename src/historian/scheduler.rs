//! Self-rearming flush timer of one thing
//!
//! `arm` only ever moves the deadline earlier. The timer task exits when a
//! tick reports nothing left to flush and nobody re-armed it meanwhile.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{error, trace};

/// Tick body: flush, then return the delay until the next tick (`None` = dispose)
pub type TimerTick = Arc<dyn Fn() -> Option<Duration> + Send + Sync>;

#[derive(Debug, Default)]
struct TimerState {
    deadline: Option<Instant>,
    running: bool,
}

pub struct FlushScheduler {
    state: Arc<Mutex<TimerState>>,
    notify: Arc<Notify>,
    handle: Option<Handle>,
    tick: TimerTick,
    retry_after: Duration,
}

impl FlushScheduler {
    /// Without a runtime handle the scheduler is inert
    pub fn new(handle: Option<Handle>, tick: TimerTick, retry_after: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(TimerState::default())),
            notify: Arc::new(Notify::new()),
            handle,
            tick,
            retry_after,
        }
    }

    /// Ensure a tick happens within `after`
    pub fn arm(&self, after: Duration) {
        let Some(handle) = &self.handle else {
            return;
        };

        let deadline = Instant::now() + after;
        let mut state = self.state.lock();
        match state.deadline {
            Some(current) if current <= deadline => {}
            _ => state.deadline = Some(deadline),
        }

        if state.running {
            self.notify.notify_one();
        } else {
            state.running = true;
            handle.spawn(run_timer(
                self.state.clone(),
                self.notify.clone(),
                self.tick.clone(),
                self.retry_after,
            ));
        }
    }

    /// Cancel the pending tick; the timer task exits
    pub fn disarm(&self) {
        self.state.lock().deadline = None;
        self.notify.notify_one();
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().deadline.is_some()
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        self.disarm();
    }
}

async fn run_timer(
    state: Arc<Mutex<TimerState>>,
    notify: Arc<Notify>,
    tick: TimerTick,
    retry_after: Duration,
) {
    loop {
        let deadline = {
            let mut st = state.lock();
            match st.deadline {
                Some(deadline) => deadline,
                None => {
                    st.running = false;
                    return;
                }
            }
        };

        tokio::select! {
            _ = sleep_until(deadline) => {}
            _ = notify.notified() => continue,
        }

        {
            let mut st = state.lock();
            match st.deadline {
                Some(current) if current > Instant::now() => continue,
                _ => st.deadline = None,
            }
        }

        let next = match panic::catch_unwind(AssertUnwindSafe(|| tick())) {
            Ok(next) => next,
            Err(_) => {
                error!("Flush timer tick panicked, re-arming");
                Some(retry_after)
            }
        };

        if let Some(after) = next {
            trace!(?after, "Re-arming flush timer");
            let deadline = Instant::now() + after;
            let mut st = state.lock();
            match st.deadline {
                Some(current) if current <= deadline => {}
                _ => st.deadline = Some(deadline),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_tick(count: Arc<AtomicUsize>, rearm: usize) -> TimerTick {
        Arc::new(move || {
            let n = count.fetch_add(1, Ordering::SeqCst) + 1;
            if n < rearm {
                Some(Duration::from_millis(5))
            } else {
                None
            }
        })
    }

    #[test]
    fn test_inert_without_runtime() {
        let count = Arc::new(AtomicUsize::new(0));
        let scheduler = FlushScheduler::new(None, counting_tick(count, 1), Duration::from_millis(5));
        scheduler.arm(Duration::from_millis(1));
        assert!(!scheduler.is_armed());
    }

    #[tokio::test]
    async fn test_rearms_until_tick_disposes() {
        let count = Arc::new(AtomicUsize::new(0));
        let scheduler = FlushScheduler::new(
            Some(Handle::current()),
            counting_tick(count.clone(), 3),
            Duration::from_millis(5),
        );

        scheduler.arm(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(!scheduler.is_armed());
    }

    #[tokio::test]
    async fn test_disarm_cancels_tick() {
        let count = Arc::new(AtomicUsize::new(0));
        let scheduler = FlushScheduler::new(
            Some(Handle::current()),
            counting_tick(count.clone(), 1),
            Duration::from_millis(5),
        );

        scheduler.arm(Duration::from_millis(100));
        scheduler.disarm();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_tick_is_retried() {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        let tick: TimerTick = Arc::new(move || {
            if inner.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("boom");
            }
            None
        });
        let scheduler = FlushScheduler::new(Some(Handle::current()), tick, Duration::from_millis(5));

        scheduler.arm(Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
