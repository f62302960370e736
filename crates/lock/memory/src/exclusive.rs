use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use ncps_lock::error::LockError;
use ncps_lock::locker::Locker;
use ncps_lock::metrics::{AcquisitionResult, FailureReason, LockMetrics, LockMode, LockType, NoopMetrics};

/// Per-key entry: a one-permit semaphore plus the number of holders and
/// waiters currently referencing it.
struct KeyEntry {
    sem: Arc<Semaphore>,
    refs: usize,
}

/// In-process exclusive [`Locker`].
///
/// Each key gets its own one-permit semaphore, so locking one key never
/// contends with another — keys are not shard-hashed, which also rules out
/// shard-collision deadlocks when a holder of one key acquires a second.
/// Entries are reference-counted and removed as soon as no holder or waiter
/// references them, so the map is bounded by the number of keys currently
/// held or awaited.
#[derive(Clone)]
pub struct MemoryLocker {
    entries: Arc<DashMap<String, KeyEntry>>,
    held_since: Arc<DashMap<String, Instant>>,
    metrics: Arc<dyn LockMetrics>,
}

impl Default for MemoryLocker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLocker {
    /// Create a locker with no metrics sink.
    #[must_use]
    pub fn new() -> Self {
        Self::with_metrics(Arc::new(NoopMetrics))
    }

    /// Create a locker emitting to the given sink.
    #[must_use]
    pub fn with_metrics(metrics: Arc<dyn LockMetrics>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            held_since: Arc::new(DashMap::new()),
            metrics,
        }
    }

    /// Find-or-create the entry for `key` and take a reference on it.
    fn take_reference(&self, key: &str) -> Arc<Semaphore> {
        let mut entry = self.entries.entry(key.to_owned()).or_insert_with(|| KeyEntry {
            sem: Arc::new(Semaphore::new(1)),
            refs: 0,
        });
        entry.refs += 1;
        Arc::clone(&entry.sem)
    }

    /// Drop one reference on `key`, removing the entry at zero.
    fn drop_reference(&self, key: &str) {
        if let Entry::Occupied(mut occupied) = self.entries.entry(key.to_owned()) {
            let refs = {
                let entry = occupied.get_mut();
                entry.refs = entry.refs.saturating_sub(1);
                entry.refs
            };
            if refs == 0 {
                occupied.remove();
            }
        }
    }
}

#[async_trait]
impl Locker for MemoryLocker {
    async fn lock(
        &self,
        cancel: &CancellationToken,
        key: &str,
        _ttl: Duration,
    ) -> Result<(), LockError> {
        if cancel.is_cancelled() {
            return Err(LockError::Cancelled);
        }

        let sem = self.take_reference(key);

        let acquired = tokio::select! {
            () = cancel.cancelled() => {
                self.drop_reference(key);
                self.metrics.failure(
                    LockType::Exclusive,
                    LockMode::Local,
                    FailureReason::ContextCanceled,
                );
                return Err(LockError::Cancelled);
            }
            permit = sem.acquire() => permit,
        };

        match acquired {
            Ok(permit) => permit.forget(),
            Err(_) => {
                self.drop_reference(key);
                return Err(LockError::Backend("lock primitive closed".into()));
            }
        }

        self.held_since.insert(key.to_owned(), Instant::now());
        self.metrics
            .acquisition(LockType::Exclusive, LockMode::Local, AcquisitionResult::Success);
        Ok(())
    }

    async fn unlock(&self, _cancel: &CancellationToken, key: &str) -> Result<(), LockError> {
        // The hold stamp gates the release: a second unlock for the same hold
        // must not inject a spare permit while a new holder is in place.
        let Some((_, started)) = self.held_since.remove(key) else {
            return Err(LockError::UnknownKey(key.to_owned()));
        };
        self.metrics
            .hold_duration(LockType::Exclusive, LockMode::Local, started.elapsed());

        let Entry::Occupied(mut occupied) = self.entries.entry(key.to_owned()) else {
            // Unreachable while the hold stamp existed; tolerate it anyway.
            return Err(LockError::UnknownKey(key.to_owned()));
        };
        occupied.get().sem.add_permits(1);
        let refs = {
            let entry = occupied.get_mut();
            entry.refs = entry.refs.saturating_sub(1);
            entry.refs
        };
        if refs == 0 {
            occupied.remove();
        }
        Ok(())
    }

    async fn try_lock(
        &self,
        cancel: &CancellationToken,
        key: &str,
        _ttl: Duration,
    ) -> Result<bool, LockError> {
        if cancel.is_cancelled() {
            return Err(LockError::Cancelled);
        }

        let sem = self.take_reference(key);

        match sem.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.held_since.insert(key.to_owned(), Instant::now());
                self.metrics.acquisition(
                    LockType::Exclusive,
                    LockMode::Local,
                    AcquisitionResult::Success,
                );
                Ok(true)
            }
            Err(tokio::sync::TryAcquireError::NoPermits) => {
                self.drop_reference(key);
                self.metrics.acquisition(
                    LockType::Exclusive,
                    LockMode::Local,
                    AcquisitionResult::Contention,
                );
                Ok(false)
            }
            Err(tokio::sync::TryAcquireError::Closed) => {
                self.drop_reference(key);
                Err(LockError::Backend("lock primitive closed".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use ncps_lock::testing::run_locker_conformance_tests;

    use super::*;

    #[tokio::test]
    async fn conformance() {
        let locker = MemoryLocker::new();
        run_locker_conformance_tests(&locker)
            .await
            .expect("conformance tests should pass");
    }

    #[tokio::test]
    async fn mutual_exclusion_under_contention() {
        let locker = MemoryLocker::new();
        let counter = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locker = locker.clone();
            let counter = Arc::clone(&counter);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    locker
                        .lock(&cancel, "shared-counter", Duration::from_secs(10))
                        .await
                        .unwrap();
                    // Non-atomic read-modify-write protected only by the lock.
                    let current = counter.load(Ordering::Relaxed);
                    tokio::task::yield_now().await;
                    counter.store(current + 1, Ordering::Relaxed);
                    locker.unlock(&cancel, "shared-counter").await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(counter.load(Ordering::Relaxed), 8 * 50);
    }

    #[tokio::test]
    async fn balanced_usage_leaves_no_entries() {
        let locker = MemoryLocker::new();
        let cancel = CancellationToken::new();

        for key in ["a", "b", "c"] {
            locker.lock(&cancel, key, Duration::from_secs(1)).await.unwrap();
        }
        for key in ["a", "b", "c"] {
            locker.unlock(&cancel, key).await.unwrap();
        }

        assert_eq!(locker.entries.len(), 0);
        assert_eq!(locker.held_since.len(), 0);
    }

    #[tokio::test]
    async fn try_lock_failure_releases_reference() {
        let locker = MemoryLocker::new();
        let cancel = CancellationToken::new();

        locker.lock(&cancel, "held", Duration::from_secs(1)).await.unwrap();
        assert!(!locker.try_lock(&cancel, "held", Duration::from_secs(1)).await.unwrap());

        // Only the holder's reference remains.
        assert_eq!(locker.entries.get("held").unwrap().refs, 1);

        locker.unlock(&cancel, "held").await.unwrap();
        assert_eq!(locker.entries.len(), 0);
    }

    #[tokio::test]
    async fn unlock_of_unknown_key_errors() {
        let locker = MemoryLocker::new();
        let cancel = CancellationToken::new();

        let err = locker.unlock(&cancel, "never-locked").await.unwrap_err();
        assert!(matches!(err, LockError::UnknownKey(_)));
    }

    #[tokio::test]
    async fn distinct_keys_held_concurrently() {
        let locker = MemoryLocker::new();
        let cancel = CancellationToken::new();

        // Keys with the same hash residue under small shard counts must not
        // contend: each key owns its own primitive.
        let narinfo = "download:narinfo:6wpnygxh29xzn5pkav0x66jxhfh9d6hj";
        let nar = "download:nar:0rwy6f0xg45wxlcz4cd2qwb88xfvskvadpv0pc7k5c1b18qal4yh";

        locker.lock(&cancel, narinfo, Duration::from_secs(1)).await.unwrap();
        assert!(locker.try_lock(&cancel, nar, Duration::from_secs(1)).await.unwrap());

        locker.unlock(&cancel, nar).await.unwrap();
        locker.unlock(&cancel, narinfo).await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_while_waiting_drops_reference() {
        let locker = MemoryLocker::new();
        let cancel = CancellationToken::new();

        locker.lock(&cancel, "blocked", Duration::from_secs(1)).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        let waiter = {
            let locker = locker.clone();
            let waiter_cancel = waiter_cancel.clone();
            tokio::spawn(async move {
                locker.lock(&waiter_cancel, "blocked", Duration::from_secs(1)).await
            })
        };

        tokio::task::yield_now().await;
        waiter_cancel.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, LockError::Cancelled));

        // The waiter's reference is gone; only the holder's remains.
        locker.unlock(&cancel, "blocked").await.unwrap();
        assert_eq!(locker.entries.len(), 0);
    }
}
