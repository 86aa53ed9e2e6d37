//! At-most-one-in-flight coordination per file.
//!
//! Two `download_all` calls sharing a session may plan the same file. The
//! first to [`claim`](InFlightMap::claim) a key becomes its owner; later
//! callers get a receiver and wait for the owner's [`FileOutcome`] instead of
//! fetching the file a second time.
//!
//! ```text
//! caller A: claim("a.bin") ──► Owner(guard) ── download ── guard.complete(Downloaded)
//! caller B: claim("a.bin") ──► Joined(rx)  ──────── wait(rx) ──► Downloaded
//! ```
//!
//! An owner that is dropped without completing (cancelled, panicked)
//! publishes [`FileOutcome::Cancelled`] so joiners never hang.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::trace;

/// Terminal result of one file, as seen by other callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// Fetched and verified.
    Downloaded { bytes: u64 },
    /// Already valid on disk.
    Skipped { bytes: u64 },
    /// Permanently failed.
    Failed { reason: String },
    /// The owner stopped before finishing.
    Cancelled,
}

/// Receiver side of an owner's outcome.
pub type Slot = watch::Receiver<Option<FileOutcome>>;

/// Result of claiming a key.
#[derive(Debug)]
pub enum Claim {
    /// This caller owns the key and must complete the guard.
    Owner(InFlightGuard),
    /// Another caller owns the key; wait on this receiver.
    Joined(Slot),
}

/// Map of install targets currently being processed.
#[derive(Debug, Clone, Default)]
pub struct InFlightMap {
    entries: Arc<DashMap<String, Slot>>,
}

impl InFlightMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a key, or join its current owner.
    pub fn claim(&self, key: &str) -> Claim {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                trace!(key, "Joining in-flight download");
                Claim::Joined(entry.get().clone())
            }
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(rx);
                Claim::Owner(InFlightGuard {
                    key: key.to_string(),
                    tx,
                    entries: Arc::clone(&self.entries),
                    done: false,
                })
            }
        }
    }

    /// Whether a key is currently owned.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of owned keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wait for an owner's outcome.
    pub async fn wait(mut slot: Slot) -> FileOutcome {
        match slot.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(FileOutcome::Cancelled),
            // Sender gone without a value.
            Err(_) => FileOutcome::Cancelled,
        }
    }

    /// Wait until none of `keys` is in flight.
    pub async fn wait_idle<'a, I>(&self, keys: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for key in keys {
            let slot = self.entries.get(key).map(|entry| entry.value().clone());
            if let Some(slot) = slot {
                Self::wait(slot).await;
            }
        }
    }
}

/// Ownership of one in-flight key.
///
/// Dropping the guard without calling [`complete`](Self::complete) publishes
/// [`FileOutcome::Cancelled`].
#[derive(Debug)]
pub struct InFlightGuard {
    key: String,
    tx: watch::Sender<Option<FileOutcome>>,
    entries: Arc<DashMap<String, Slot>>,
    done: bool,
}

impl InFlightGuard {
    /// The claimed key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Publish the outcome and release the key.
    pub fn complete(mut self, outcome: FileOutcome) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: FileOutcome) {
        if self.done {
            return;
        }
        self.done = true;
        // Remove first so a caller woken by the send can re-claim at once.
        self.entries.remove(&self.key);
        self.tx.send_replace(Some(outcome));
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.finish(FileOutcome::Cancelled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn owner(claim: Claim) -> InFlightGuard {
        match claim {
            Claim::Owner(guard) => guard,
            Claim::Joined(_) => panic!("expected to own the key"),
        }
    }

    fn joined(claim: Claim) -> Slot {
        match claim {
            Claim::Joined(slot) => slot,
            Claim::Owner(_) => panic!("expected to join the key"),
        }
    }

    #[test]
    fn test_first_claim_owns() {
        let map = InFlightMap::new();
        let guard = owner(map.claim("a.bin"));
        assert_eq!(guard.key(), "a.bin");
        assert!(map.contains("a.bin"));
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn test_joiner_receives_outcome() {
        let map = InFlightMap::new();
        let guard = owner(map.claim("a.bin"));
        let slot = joined(map.claim("a.bin"));

        let waiter = tokio::spawn(InFlightMap::wait(slot));
        tokio::time::sleep(Duration::from_millis(10)).await;
        guard.complete(FileOutcome::Downloaded { bytes: 5 });

        assert_eq!(
            waiter.await.unwrap(),
            FileOutcome::Downloaded { bytes: 5 }
        );
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_owner_publishes_cancelled() {
        let map = InFlightMap::new();
        let guard = owner(map.claim("a.bin"));
        let slot = joined(map.claim("a.bin"));

        drop(guard);

        assert_eq!(InFlightMap::wait(slot).await, FileOutcome::Cancelled);
        assert!(!map.contains("a.bin"));
    }

    #[tokio::test]
    async fn test_key_is_reclaimable_after_completion() {
        let map = InFlightMap::new();
        owner(map.claim("a.bin")).complete(FileOutcome::Failed {
            reason: "HTTP 404".to_string(),
        });

        let _again = owner(map.claim("a.bin"));
    }

    #[tokio::test]
    async fn test_late_joiner_sees_completed_value() {
        let map = InFlightMap::new();
        let guard = owner(map.claim("a.bin"));
        let slot = joined(map.claim("a.bin"));
        guard.complete(FileOutcome::Skipped { bytes: 3 });

        assert_eq!(InFlightMap::wait(slot).await, FileOutcome::Skipped { bytes: 3 });
    }

    #[tokio::test]
    async fn test_wait_idle_returns_when_drained() {
        let map = InFlightMap::new();
        let guard = owner(map.claim("a.bin"));

        let waiter = {
            let map = map.clone();
            tokio::spawn(async move { map.wait_idle(["a.bin", "b.bin"]).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        guard.complete(FileOutcome::Downloaded { bytes: 1 });
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
