//! Cancellable one-shot timers.
//!
//! Every timer the engine arms (ping interval, pong timeout, reconnect
//! delay, typing expiry) is a [`Timer`] owned by the state struct that
//! needs it. Dropping the handle aborts the task, so teardown on
//! disconnect cancels outstanding timers structurally instead of by
//! convention. A leaked timer here means phantom reconnects or stuck
//! typing indicators, so ownership is the whole point.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A one-shot timer that delivers `msg` on the channel after `delay`.
/// Dropping the handle cancels it.
pub struct Timer {
    handle: JoinHandle<()>,
}

impl Timer {
    pub fn spawn<T: Send + 'static>(
        delay: Duration,
        tx: mpsc::UnboundedSender<T>,
        msg: T,
    ) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(msg);
        });
        Timer { handle }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _timer = Timer::spawn(Duration::from_secs(5), tx, 7u32);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(rx.try_recv().unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_cancels() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timer = Timer::spawn(Duration::from_secs(5), tx, 7u32);
        drop(timer);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }
}
