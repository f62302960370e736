use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use ncps_lock::error::LockError;
use ncps_lock::locker::{Locker, RwLocker};
use ncps_lock::metrics::{AcquisitionResult, FailureReason, LockMetrics, LockMode, LockType, NoopMetrics};

/// Permit budget of the shared primitive. A read hold takes one permit, a
/// write hold takes all of them, so writers exclude readers and each other.
const MAX_READERS: u32 = 1024;

#[derive(Default)]
struct Bookkeeping {
    /// Write acquisition times, keyed by lock key. At most one entry exists
    /// at a time; the map gates double release and feeds the write-hold
    /// metric.
    write_held: HashMap<String, Instant>,
    /// Active read holds per key. Entries gate `read_unlock` so releasing a
    /// key that was never read-locked cannot restore another key's permit.
    readers: HashMap<String, usize>,
}

/// In-process reader–writer [`RwLocker`].
///
/// A single semaphore governs all keys: callers that need per-key write
/// parallelism should use one instance per key space or a distributed
/// backend. Writers queue ahead of later readers (tokio semaphores are FIFO),
/// so a waiting writer is not starved by a stream of new readers. Hold
/// bookkeeping is per-key on both sides, so releasing a key that is not held
/// errors instead of corrupting the permit budget.
///
/// Read-hold duration is not instrumented — concurrent readers share the
/// primitive and a per-key start time would be overwritten by later readers.
/// Only write holds are timed.
#[derive(Clone)]
pub struct MemoryRwLocker {
    sem: Arc<Semaphore>,
    state: Arc<Mutex<Bookkeeping>>,
    metrics: Arc<dyn LockMetrics>,
}

impl Default for MemoryRwLocker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRwLocker {
    /// Create a locker with no metrics sink.
    #[must_use]
    pub fn new() -> Self {
        Self::with_metrics(Arc::new(NoopMetrics))
    }

    /// Create a locker emitting to the given sink.
    #[must_use]
    pub fn with_metrics(metrics: Arc<dyn LockMetrics>) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(MAX_READERS as usize)),
            state: Arc::new(Mutex::new(Bookkeeping::default())),
            metrics,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, Bookkeeping> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Locker for MemoryRwLocker {
    async fn lock(
        &self,
        cancel: &CancellationToken,
        key: &str,
        _ttl: Duration,
    ) -> Result<(), LockError> {
        if cancel.is_cancelled() {
            return Err(LockError::Cancelled);
        }

        let acquired = tokio::select! {
            () = cancel.cancelled() => {
                self.metrics.failure(
                    LockType::Write,
                    LockMode::Local,
                    FailureReason::ContextCanceled,
                );
                return Err(LockError::Cancelled);
            }
            permit = self.sem.acquire_many(MAX_READERS) => permit,
        };

        match acquired {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(LockError::Backend("lock primitive closed".into())),
        }

        self.state().write_held.insert(key.to_owned(), Instant::now());
        self.metrics
            .acquisition(LockType::Write, LockMode::Local, AcquisitionResult::Success);
        Ok(())
    }

    async fn unlock(&self, _cancel: &CancellationToken, key: &str) -> Result<(), LockError> {
        // The bookkeeping lookup gates the permit restore so a concurrent
        // double unlock of the same key errors instead of corrupting the
        // permit budget.
        let started = {
            let mut state = self.state();
            match state.write_held.remove(key) {
                Some(started) => started,
                None => return Err(LockError::UnknownKey(key.to_owned())),
            }
        };

        self.metrics
            .hold_duration(LockType::Write, LockMode::Local, started.elapsed());
        self.sem.add_permits(MAX_READERS as usize);
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

        match self.sem.try_acquire_many(MAX_READERS) {
            Ok(permit) => {
                permit.forget();
                self.state().write_held.insert(key.to_owned(), Instant::now());
                self.metrics
                    .acquisition(LockType::Write, LockMode::Local, AcquisitionResult::Success);
                Ok(true)
            }
            Err(tokio::sync::TryAcquireError::NoPermits) => {
                self.metrics.acquisition(
                    LockType::Write,
                    LockMode::Local,
                    AcquisitionResult::Contention,
                );
                Ok(false)
            }
            Err(tokio::sync::TryAcquireError::Closed) => {
                Err(LockError::Backend("lock primitive closed".into()))
            }
        }
    }
}

#[async_trait]
impl RwLocker for MemoryRwLocker {
    async fn read_lock(
        &self,
        cancel: &CancellationToken,
        key: &str,
        _ttl: Duration,
    ) -> Result<(), LockError> {
        if cancel.is_cancelled() {
            return Err(LockError::Cancelled);
        }

        let acquired = tokio::select! {
            () = cancel.cancelled() => {
                self.metrics.failure(
                    LockType::Read,
                    LockMode::Local,
                    FailureReason::ContextCanceled,
                );
                return Err(LockError::Cancelled);
            }
            permit = self.sem.acquire() => permit,
        };

        match acquired {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(LockError::Backend("lock primitive closed".into())),
        }

        *self.state().readers.entry(key.to_owned()).or_insert(0) += 1;
        self.metrics
            .acquisition(LockType::Read, LockMode::Local, AcquisitionResult::Success);
        Ok(())
    }

    async fn read_unlock(&self, _cancel: &CancellationToken, key: &str) -> Result<(), LockError> {
        {
            let mut state = self.state();
            let Some(count) = state.readers.get_mut(key) else {
                return Err(LockError::UnknownReadKey(key.to_owned()));
            };
            *count -= 1;
            if *count == 0 {
                state.readers.remove(key);
            }
        }

        self.sem.add_permits(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use ncps_lock::testing::run_rw_locker_conformance_tests;

    use super::*;

    // The exclusive conformance suite asserts per-key independence, which a
    // keyless primitive intentionally does not provide; only the rw suite
    // applies here.
    #[tokio::test]
    async fn conformance() {
        let locker = MemoryRwLocker::new();
        run_rw_locker_conformance_tests(&locker)
            .await
            .expect("rw conformance should pass");
    }

    #[tokio::test]
    async fn readers_run_concurrently() {
        let locker = MemoryRwLocker::new();
        let cancel = CancellationToken::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let locker = locker.clone();
            let cancel = cancel.clone();
            let inside = Arc::clone(&inside);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                locker.read_lock(&cancel, "shared", Duration::from_secs(5)).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                locker.read_unlock(&cancel, "shared").await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(
            peak.load(Ordering::SeqCst) >= 2,
            "readers should overlap, peak was {}",
            peak.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn writer_bars_new_readers() {
        let locker = MemoryRwLocker::new();
        let cancel = CancellationToken::new();
        let flag = Arc::new(AtomicBool::new(true));

        locker.lock(&cancel, "barrier", Duration::from_secs(5)).await.unwrap();

        let reader = {
            let locker = locker.clone();
            let cancel = cancel.clone();
            let flag = Arc::clone(&flag);
            tokio::spawn(async move {
                locker.read_lock(&cancel, "barrier", Duration::from_secs(5)).await.unwrap();
                // The writer clears the flag before releasing; a reader that
                // enters early would still see it set.
                let observed = flag.load(Ordering::SeqCst);
                locker.read_unlock(&cancel, "barrier").await.unwrap();
                observed
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        flag.store(false, Ordering::SeqCst);
        locker.unlock(&cancel, "barrier").await.unwrap();

        assert!(!reader.await.unwrap(), "reader entered before writer released");
    }

    #[tokio::test]
    async fn double_write_unlock_errors_without_panic() {
        let locker = MemoryRwLocker::new();
        let cancel = CancellationToken::new();

        locker.lock(&cancel, "once", Duration::from_secs(1)).await.unwrap();
        locker.unlock(&cancel, "once").await.unwrap();

        let err = locker.unlock(&cancel, "once").await.unwrap_err();
        assert!(matches!(err, LockError::UnknownKey(_)));

        // The permit budget is intact: a writer can still acquire.
        assert!(locker.try_lock(&cancel, "once", Duration::from_secs(1)).await.unwrap());
        locker.unlock(&cancel, "once").await.unwrap();
    }

    #[tokio::test]
    async fn read_unlock_without_hold_errors() {
        let locker = MemoryRwLocker::new();
        let cancel = CancellationToken::new();

        let err = locker.read_unlock(&cancel, "nothing").await.unwrap_err();
        assert!(matches!(err, LockError::UnknownReadKey(_)));
    }

    #[tokio::test]
    async fn read_unlock_of_wrong_key_does_not_release_another_hold() {
        let locker = MemoryRwLocker::new();
        let cancel = CancellationToken::new();

        locker.read_lock(&cancel, "held", Duration::from_secs(5)).await.unwrap();

        let err = locker.read_unlock(&cancel, "never-held").await.unwrap_err();
        assert!(matches!(err, LockError::UnknownReadKey(_)));

        // The hold on "held" is intact: a writer still cannot enter.
        assert!(!locker.try_lock(&cancel, "held", Duration::from_secs(5)).await.unwrap());

        locker.read_unlock(&cancel, "held").await.unwrap();
        assert!(locker.try_lock(&cancel, "held", Duration::from_secs(5)).await.unwrap());
        locker.unlock(&cancel, "held").await.unwrap();
    }

    #[tokio::test]
    async fn writer_waits_for_readers_to_drain() {
        let locker = MemoryRwLocker::new();
        let cancel = CancellationToken::new();

        locker.read_lock(&cancel, "drain", Duration::from_secs(5)).await.unwrap();
        assert!(!locker.try_lock(&cancel, "drain", Duration::from_secs(5)).await.unwrap());

        locker.read_unlock(&cancel, "drain").await.unwrap();
        assert!(locker.try_lock(&cancel, "drain", Duration::from_secs(5)).await.unwrap());
        locker.unlock(&cancel, "drain").await.unwrap();
    }
}
