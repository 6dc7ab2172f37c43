//! Signal-of-Stop: cooperative cancellation primitive.
//!
//! One token stops the whole node (ctrl-c in the binary); each outgoing
//! transfer gets its own so a single file can be cancelled without
//! touching the session.

use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A cooperative cancellation token.
///
/// Clones share the same underlying state, so cancelling any clone
/// notifies all waiters.
#[derive(Debug, Clone, Default)]
pub struct SignalOfStop {
    internal: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    notify: Notify,
}

impl SignalOfStop {
    /// Create a new, uncancelled signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to all waiters. Idempotent.
    pub fn cancel(&self) {
        self.internal.closing.store(true, Ordering::Release);
        self.internal.notify.notify_waiters();
    }

    /// Check if cancellation has been signaled.
    pub fn cancelled(&self) -> bool {
        self.internal.closing.load(Ordering::Acquire)
    }

    /// Wait for cancellation to be signaled.
    ///
    /// Returns immediately if already cancelled. The waiter is registered
    /// before the flag is checked, so a `cancel()` racing with this call
    /// is never missed.
    pub async fn wait(&self) {
        let mut notified = pin!(self.internal.notify.notified());
        loop {
            notified.as_mut().enable();
            if self.cancelled() {
                return;
            }
            notified.as_mut().await;
            if self.cancelled() {
                return;
            }
            notified.set(self.internal.notify.notified());
        }
    }

    /// Race a future against cancellation.
    ///
    /// Returns `Some(T)` if the future completes first, `None` if
    /// cancellation is signaled first.
    pub async fn select<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
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
    async fn test_cancel_wakes_clone() {
        let sos = SignalOfStop::new();
        let waiter = sos.clone();
        let task = tokio::spawn(async move { waiter.wait().await });
        tokio::task::yield_now().await;
        sos.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_after_cancel_returns() {
        let sos = SignalOfStop::new();
        sos.cancel();
        assert!(sos.cancelled());
        tokio::time::timeout(Duration::from_millis(100), sos.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_select() {
        let sos = SignalOfStop::new();
        assert_eq!(sos.select(async { 7 }).await, Some(7));
        sos.cancel();
        assert_eq!(sos.select(std::future::pending::<u8>()).await, None);
    }
}
