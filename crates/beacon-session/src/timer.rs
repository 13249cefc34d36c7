//! One-shot timers with race-free cancellation.
//!
//! The callback fires at most once. Cancellation races with expiry are
//! resolved by "first cancel wins": whoever flips the flag first decides
//! whether the callback runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Handle to a scheduled callback.
#[derive(Debug)]
pub struct TimerHandle {
    settled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Cancels the timer. Returns `true` when the cancel won the race and
    /// the callback will never run; `false` when the callback already fired
    /// or another cancel got there first.
    pub fn cancel(&self) -> bool {
        let won = !self.settled.swap(true, Ordering::SeqCst);
        self.task.abort();
        won
    }
}

/// Schedules `callback` to run once after `delay`.
pub fn schedule<F>(delay: Duration, callback: F) -> TimerHandle
where
    F: FnOnce() + Send + 'static,
{
    let settled = Arc::new(AtomicBool::new(false));
    let task_settled = settled.clone();
    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if !task_settled.swap(true, Ordering::SeqCst) {
            callback();
        }
    });
    TimerHandle { settled, task }
}
