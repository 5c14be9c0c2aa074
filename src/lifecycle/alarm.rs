//! Single re-armable alarm per session (SPEC_FULL.md §4.4a), the same
//! "one timer, always cancel-then-spawn" idiom the teacher's instance
//! actor uses for its housekeeping tick.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};

/// Wakes the owning actor's command loop on a fixed cadence. Re-arming
/// replaces the previous timer rather than stacking another one, so a
/// session never accumulates more than one pending wakeup.
pub struct Alarm<M> {
    handle: Option<JoinHandle<()>>,
    tx: mpsc::Sender<M>,
}

impl<M: Send + 'static> Alarm<M> {
    pub fn new(tx: mpsc::Sender<M>) -> Self {
        Self { handle: None, tx }
    }

    /// Cancels any pending wakeup and schedules a new one `delay_ms` from
    /// now, sending `message` into the owning actor's channel.
    pub fn rearm(&mut self, delay_ms: i64, message: M) {
        if let Some(h) = self.handle.take() {
            h.abort();
        }
        let delay_ms = delay_ms.max(0) as u64;
        let tx = self.tx.clone();
        self.handle = Some(tokio::spawn(async move {
            sleep(Duration::from_millis(delay_ms)).await;
            let _ = tx.send(message).await;
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(h) = self.handle.take() {
            h.abort();
        }
    }
}

impl<M> Drop for Alarm<M> {
    fn drop(&mut self) {
        if let Some(h) = self.handle.take() {
            h.abort();
        }
    }
}
