//! Signal-of-Stop: cooperative cancellation token.
//!
//! One token per batch (and one for the whole process in the binary).
//! Clones share state, so cancelling any clone wakes every waiter.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, Default)]
pub struct SignalOfStop {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    stopped: AtomicBool,
    notify: Notify,
}

impl SignalOfStop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn cancelled(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Resolves once cancelled (immediately if already cancelled).
    pub async fn wait(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before re-checking so a concurrent cancel is not missed.
        notified.as_mut().enable();
        if self.cancelled() {
            return;
        }
        notified.await;
    }

    /// Race a future against cancellation; `None` if cancelled first.
    pub async fn select<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.wait() => None,
            res = fut => Some(res),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn clones_share_cancellation() {
        let sos = SignalOfStop::new();
        let other = sos.clone();
        assert!(!other.cancelled());

        let waiter = tokio::spawn(async move { other.wait().await });
        tokio::task::yield_now().await;
        sos.cancel();
        waiter.await.unwrap();
        assert!(sos.cancelled());
    }

    #[tokio::test]
    async fn select_returns_none_when_cancelled() {
        let sos = SignalOfStop::new();
        sos.cancel();
        let res = sos.select(tokio::time::sleep(Duration::from_secs(60))).await;
        assert!(res.is_none());
    }

    #[tokio::test]
    async fn select_passes_through_result() {
        let sos = SignalOfStop::new();
        assert_eq!(sos.select(async { 7 }).await, Some(7));
    }
}
