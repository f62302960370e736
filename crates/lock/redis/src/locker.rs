use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use ncps_lock::breaker::CircuitBreaker;
use ncps_lock::error::LockError;
use ncps_lock::locker::Locker;
use ncps_lock::metrics::{
    AcquisitionResult, FailureReason, LockMetrics, LockMode, LockType, NoopMetrics,
};
use ncps_lock::retry::RetryConfig;
use ncps_lock_memory::MemoryLocker;

use crate::config::RedisLockConfig;
use crate::redlock::{AcquireOutcome, Redlock};

/// Consecutive failures before the breaker opens.
const BREAKER_THRESHOLD: u32 = 5;

/// How long the breaker blocks before admitting a probe.
const BREAKER_TIMEOUT: Duration = Duration::from_secs(30);

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A held Redlock mutex: the owner value plus the acquisition time.
struct HeldMutex {
    owner: String,
    acquired_at: Instant,
}

/// Redlock-based exclusive [`Locker`] over N independent Redis masters.
///
/// `ttl` is the `SET NX PX` expiry on every node — the hard upper bound on
/// how long a crashed holder can block other instances.
///
/// With `allow_degraded_mode`, an open circuit breaker transparently reroutes
/// calls to an embedded in-process lock, suspending cross-instance exclusion
/// for as long as the breaker stays open.
pub struct RedisLocker {
    redlock: Redlock,
    config: RedisLockConfig,
    retry: RetryConfig,
    breaker: CircuitBreaker,
    allow_degraded: bool,
    fallback: MemoryLocker,
    metrics: Arc<dyn LockMetrics>,
    /// Held mutexes keyed by the caller's logical key.
    mutexes: Mutex<HashMap<String, HeldMutex>>,
}

impl std::fmt::Debug for RedisLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLocker")
            .field("config", &self.config)
            .field("allow_degraded", &self.allow_degraded)
            .finish_non_exhaustive()
    }
}

impl RedisLocker {
    /// Connect to every configured node and verify the quorum.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NoBackendConfigured`] without addresses,
    /// [`LockError::InsufficientQuorum`] when fewer than a strict majority of
    /// nodes are reachable. See [`connect`](Self::connect) for the
    /// degraded-mode construction path.
    pub async fn new(
        config: RedisLockConfig,
        retry: RetryConfig,
        allow_degraded_mode: bool,
    ) -> Result<Self, LockError> {
        if config.addrs.is_empty() {
            return Err(LockError::NoBackendConfigured);
        }
        config
            .validate()
            .map_err(|e| LockError::Backend(format!("invalid redis config: {e}")))?;
        retry
            .validate()
            .map_err(|e| LockError::Backend(format!("invalid retry config: {e}")))?;

        let redlock = Redlock::connect(&config).await?;

        Ok(Self {
            redlock,
            config,
            retry,
            breaker: CircuitBreaker::new(BREAKER_THRESHOLD, BREAKER_TIMEOUT),
            allow_degraded: allow_degraded_mode,
            fallback: MemoryLocker::new(),
            metrics: Arc::new(NoopMetrics),
            mutexes: Mutex::new(HashMap::new()),
        })
    }

    /// Construction entry point honouring degraded mode: when the quorum is
    /// unreachable and `allow_degraded_mode` is set, an in-process lock is
    /// returned transparently instead.
    pub async fn connect(
        config: RedisLockConfig,
        retry: RetryConfig,
        allow_degraded_mode: bool,
    ) -> Result<Box<dyn Locker>, LockError> {
        match Self::new(config, retry, allow_degraded_mode).await {
            Ok(locker) => Ok(Box::new(locker)),
            Err(e @ (LockError::InsufficientQuorum { .. } | LockError::Connection(_)))
                if allow_degraded_mode =>
            {
                warn!(error = %e, "redis quorum unreachable, degrading to in-process locks");
                Ok(Box::new(MemoryLocker::new()))
            }
            Err(e) => Err(e),
        }
    }

    /// Replace the metrics sink (and the embedded fallback's).
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn LockMetrics>) -> Self {
        self.fallback = MemoryLocker::with_metrics(Arc::clone(&metrics));
        self.metrics = metrics;
        self
    }

    /// The breaker guarding this backend, for observation and tests.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Nodes that connected at startup.
    pub fn node_count(&self) -> usize {
        self.redlock.node_count()
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.config.key_prefix)
    }

    fn should_degrade(&self) -> bool {
        self.allow_degraded && self.breaker.is_open()
    }
}

#[async_trait]
impl Locker for RedisLocker {
    async fn lock(
        &self,
        cancel: &CancellationToken,
        key: &str,
        ttl: Duration,
    ) -> Result<(), LockError> {
        if cancel.is_cancelled() {
            return Err(LockError::Cancelled);
        }

        if !self.breaker.allow_request() {
            if self.allow_degraded {
                warn!(key, "redis breaker open, using in-process fallback");
                return self.fallback.lock(cancel, key, ttl).await;
            }
            self.metrics.failure(
                LockType::Exclusive,
                LockMode::Distributed,
                FailureReason::CircuitBreaker,
            );
            return Err(LockError::CircuitBreakerOpen);
        }

        let full_key = self.full_key(key);
        let owner = Uuid::new_v4().simple().to_string();
        let mut last_err = LockError::Contention(key.to_owned());

        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                self.metrics.retry(LockType::Exclusive);
                if let Err(e) = self.retry.sleep(attempt, cancel).await {
                    self.metrics.failure(
                        LockType::Exclusive,
                        LockMode::Distributed,
                        FailureReason::ContextCanceled,
                    );
                    return Err(e);
                }
            }

            match self.redlock.try_acquire(&full_key, &owner, ttl).await {
                Ok(AcquireOutcome::Acquired) => {
                    self.breaker.record_success();
                    guard(&self.mutexes).insert(
                        key.to_owned(),
                        HeldMutex {
                            owner: owner.clone(),
                            acquired_at: Instant::now(),
                        },
                    );
                    self.metrics.acquisition(
                        LockType::Exclusive,
                        LockMode::Distributed,
                        AcquisitionResult::Success,
                    );
                    return Ok(());
                }
                Ok(AcquireOutcome::Contended) => {
                    // Plain contention never touches the breaker.
                    last_err = LockError::Contention(key.to_owned());
                }
                Err(e) if e.is_connection_error() => {
                    self.breaker.record_failure();
                    self.metrics.failure(
                        LockType::Exclusive,
                        LockMode::Distributed,
                        FailureReason::RedisError,
                    );
                    if self.should_degrade() {
                        warn!(key, "redis breaker tripped mid-acquire, using in-process fallback");
                        return self.fallback.lock(cancel, key, ttl).await;
                    }
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }

        self.metrics.failure(
            LockType::Exclusive,
            LockMode::Distributed,
            FailureReason::MaxRetries,
        );
        Err(LockError::AcquisitionFailed {
            attempts: self.retry.max_attempts,
            source: Box::new(last_err),
        })
    }

    async fn unlock(&self, cancel: &CancellationToken, key: &str) -> Result<(), LockError> {
        let removed = guard(&self.mutexes).remove(key);
        let Some(held) = removed else {
            // Either the acquire failed, or it landed on the fallback.
            if self.allow_degraded {
                match self.fallback.unlock(cancel, key).await {
                    Ok(()) | Err(LockError::UnknownKey(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            return Ok(());
        };

        self.metrics.hold_duration(
            LockType::Exclusive,
            LockMode::Distributed,
            held.acquired_at.elapsed(),
        );

        let full_key = self.full_key(key);
        if let Err(e) = self.redlock.release(&full_key, &held.owner).await {
            // The per-node TTL guarantees eventual release.
            warn!(key, error = %e, "redlock release failed, relying on TTL expiry");
        }
        Ok(())
    }

    async fn try_lock(
        &self,
        cancel: &CancellationToken,
        key: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        if cancel.is_cancelled() {
            return Err(LockError::Cancelled);
        }

        if !self.breaker.allow_request() {
            if self.allow_degraded {
                return self.fallback.try_lock(cancel, key, ttl).await;
            }
            self.metrics.failure(
                LockType::Exclusive,
                LockMode::Distributed,
                FailureReason::CircuitBreaker,
            );
            return Err(LockError::CircuitBreakerOpen);
        }

        let full_key = self.full_key(key);
        let owner = Uuid::new_v4().simple().to_string();

        match self.redlock.try_acquire(&full_key, &owner, ttl).await {
            Ok(AcquireOutcome::Acquired) => {
                self.breaker.record_success();
                guard(&self.mutexes).insert(
                    key.to_owned(),
                    HeldMutex {
                        owner,
                        acquired_at: Instant::now(),
                    },
                );
                self.metrics.acquisition(
                    LockType::Exclusive,
                    LockMode::Distributed,
                    AcquisitionResult::Success,
                );
                Ok(true)
            }
            Ok(AcquireOutcome::Contended) => {
                self.metrics.acquisition(
                    LockType::Exclusive,
                    LockMode::Distributed,
                    AcquisitionResult::Contention,
                );
                Ok(false)
            }
            Err(e) if e.is_connection_error() => {
                self.breaker.record_failure();
                self.metrics.failure(
                    LockType::Exclusive,
                    LockMode::Distributed,
                    FailureReason::RedisError,
                );
                if self.should_degrade() {
                    return self.fallback.try_lock(cancel, key, ttl).await;
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config(addrs: Vec<String>) -> RedisLockConfig {
        RedisLockConfig {
            addrs,
            connect_timeout: Duration::from_millis(500),
            ..RedisLockConfig::default()
        }
    }

    #[tokio::test]
    async fn empty_addrs_is_not_configured() {
        let err = RedisLocker::new(RedisLockConfig::default(), RetryConfig::default(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::NoBackendConfigured));
    }

    #[tokio::test]
    async fn unreachable_quorum_fails_strict_construction() {
        let config = unreachable_config(vec!["127.0.0.1:1".into()]);
        let err = RedisLocker::new(config, RetryConfig::default(), false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LockError::InsufficientQuorum {
                connected: 0,
                required: 1
            }
        ));
    }

    #[tokio::test]
    async fn unreachable_quorum_degrades_to_in_process() {
        let config = unreachable_config(vec!["127.0.0.1:1".into()]);
        let locker = RedisLocker::connect(config, RetryConfig::default(), true)
            .await
            .expect("degraded construction should succeed");

        let cancel = CancellationToken::new();
        locker.lock(&cancel, "k", Duration::from_secs(1)).await.unwrap();
        assert!(!locker.try_lock(&cancel, "k", Duration::from_secs(1)).await.unwrap());
        locker.unlock(&cancel, "k").await.unwrap();
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use ncps_lock::testing::run_locker_conformance_tests;

    use super::*;

    fn test_config() -> RedisLockConfig {
        let addr =
            std::env::var("REDIS_ADDR").unwrap_or_else(|_| "127.0.0.1:6379".to_string());
        RedisLockConfig {
            addrs: vec![addr],
            key_prefix: format!("ncps-test-{}:", Uuid::new_v4().simple()),
            ..RedisLockConfig::default()
        }
    }

    #[tokio::test]
    async fn conformance() {
        let locker = RedisLocker::new(test_config(), RetryConfig::default(), false)
            .await
            .expect("redis should be reachable");
        run_locker_conformance_tests(&locker)
            .await
            .expect("conformance should pass");
    }

    #[tokio::test]
    async fn lock_succeeds_once_background_holder_releases() {
        let config = test_config();
        let holder = RedisLocker::new(config.clone(), RetryConfig::default(), false)
            .await
            .unwrap();
        let contender = RedisLocker::new(
            config,
            RetryConfig {
                max_attempts: 5,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                jitter: true,
                jitter_factor: 0.5,
            },
            false,
        )
        .await
        .unwrap();
        let cancel = CancellationToken::new();
        let key = "redis-background-release";

        holder.lock(&cancel, key, Duration::from_secs(30)).await.unwrap();

        let holder = Arc::new(holder);
        let release = {
            let holder = Arc::clone(&holder);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                holder.unlock(&cancel, "redis-background-release").await.unwrap();
            })
        };

        let started = std::time::Instant::now();
        contender.lock(&cancel, key, Duration::from_secs(30)).await.unwrap();
        let elapsed = started.elapsed();

        assert!(
            elapsed > Duration::from_millis(900) && elapsed < Duration::from_secs(3),
            "elapsed {elapsed:?}"
        );

        release.await.unwrap();
        contender.unlock(&cancel, key).await.unwrap();
    }

    #[tokio::test]
    async fn ttl_self_heals_after_crashed_holder() {
        let config = test_config();
        let holder = RedisLocker::new(config.clone(), RetryConfig::default(), false)
            .await
            .unwrap();
        let contender = RedisLocker::new(config, RetryConfig::default(), false)
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let key = "redis-ttl-heal";

        // Simulate a crash: acquire with a short TTL and never release.
        holder.lock(&cancel, key, Duration::from_millis(500)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(contender.try_lock(&cancel, key, Duration::from_secs(5)).await.unwrap());
        contender.unlock(&cancel, key).await.unwrap();
    }
}
