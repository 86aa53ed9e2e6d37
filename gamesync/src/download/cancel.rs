//! Cooperative cancellation shared by every transfer of one operation.
//!
//! A [`CancelToken`] wraps a `CancellationToken` and keeps a registry of the
//! requests that are currently on the wire. Cancelling flips the flag and
//! fires each live request's own token, so every `select!` waiting on a
//! socket drops its request immediately instead of at the next retry check.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::{DownloadError, DownloadResult};

#[derive(Debug, Default)]
struct Inner {
    token: CancellationToken,
    live: Mutex<HashMap<u64, CancellationToken>>,
    next_id: AtomicU64,
}

/// Shared cancellation handle for one download operation.
///
/// Cheap to clone; every clone observes and controls the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Create a token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the operation.
    ///
    /// Idempotent. Sets the flag, aborts every registered request, then
    /// clears the registry.
    pub fn cancel(&self) {
        self.inner.token.cancel();
        let live = std::mem::take(&mut *self.inner.live.lock());
        if !live.is_empty() {
            debug!(requests = live.len(), "Aborting live requests");
        }
        for (_, request) in live {
            request.cancel();
        }
    }

    /// Whether `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Return `Err(Cancelled)` once the token has fired.
    pub fn check(&self) -> DownloadResult<()> {
        if self.is_cancelled() {
            Err(DownloadError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// Register a request that is about to go on the wire.
    ///
    /// The returned guard deregisters itself when dropped. Registering on a
    /// cancelled token yields a request that is already cancelled.
    pub fn register(&self) -> LiveRequest {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.inner.token.child_token();
        if !token.is_cancelled() {
            self.inner.live.lock().insert(id, token.clone());
        }
        LiveRequest {
            id,
            token,
            owner: Arc::clone(&self.inner),
        }
    }

    /// Number of requests currently registered.
    pub fn live_requests(&self) -> usize {
        self.inner.live.lock().len()
    }
}

/// Registration of one in-flight request with a [`CancelToken`].
#[derive(Debug)]
pub struct LiveRequest {
    id: u64,
    token: CancellationToken,
    owner: Arc<Inner>,
}

impl LiveRequest {
    /// Wait until this request is aborted.
    pub async fn aborted(&self) {
        self.token.cancelled().await
    }

    /// Whether this request has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for LiveRequest {
    fn drop(&mut self) {
        self.owner.live.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_token_is_not_cancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
        assert_eq!(token.live_requests(), 0);
    }

    #[test]
    fn test_register_and_drop() {
        let token = CancelToken::new();

        let first = token.register();
        let second = token.register();
        assert_eq!(token.live_requests(), 2);

        drop(first);
        assert_eq!(token.live_requests(), 1);

        drop(second);
        assert_eq!(token.live_requests(), 0);
    }

    #[test]
    fn test_cancel_aborts_live_requests_and_clears() {
        let token = CancelToken::new();
        let request = token.register();

        token.cancel();

        assert!(request.is_aborted());
        assert_eq!(token.live_requests(), 0);
        assert!(matches!(token.check(), Err(DownloadError::Cancelled)));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_register_after_cancel_is_already_aborted() {
        let token = CancelToken::new();
        token.cancel();

        let request = token.register();
        assert!(request.is_aborted());
        assert_eq!(token.live_requests(), 0);
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        let _request = clone.register();

        assert_eq!(token.live_requests(), 1);
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_from_another_task_wakes_request() {
        let token = CancelToken::new();
        let request = token.register();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        tokio::time::timeout(Duration::from_secs(2), request.aborted())
            .await
            .expect("request should be aborted");
    }
}
