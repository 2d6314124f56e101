//! Cancellation tokens for suspendable operations.

use std::future::Future;
use std::sync::Arc;

use sea_orm::DbErr;
use tokio::sync::watch;

use crate::error::Error;

/// A cloneable signal that aborts in-progress waits.
///
/// All clones observe the same state. Cancelling more than once is a no-op.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    notify: Arc<watch::Sender<bool>>,
}

impl CancellationToken {
    /// Create a token that has not been cancelled.
    pub fn new() -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            notify: Arc::new(notify),
        }
    }

    /// Cancel the token and wake every waiter.
    pub fn cancel(&self) {
        self.notify.send_replace(true);
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.notify.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut watcher = self.notify.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = watcher.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a driver call until it finishes or `cancel` fires, whichever is first.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, call: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, DbErr>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = call => result.map_err(Error::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());

        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::default();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .expect("task should not panic");
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(50), token.cancelled())
            .await
            .expect("already cancelled");
    }

    #[tokio::test]
    async fn test_cancellable_prefers_cancellation() {
        let token = CancellationToken::new();
        assert_eq!(cancellable(&token, async { Ok::<_, DbErr>(5) }).await.expect("runs"), 5);

        token.cancel();
        let err = cancellable(&token, async { Ok::<_, DbErr>(5) })
            .await
            .expect_err("cancelled");
        assert!(err.is_cancelled());
    }
}
