use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, MySql, MySqlConnection, MySqlPool};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ncps_lock::breaker::CircuitBreaker;
use ncps_lock::error::{LockError, classify_backend_error};
use ncps_lock::locker::{Locker, RwLocker};
use ncps_lock::metrics::{
    AcquisitionResult, FailureReason, LockMetrics, LockMode, LockType, NoopMetrics,
};
use ncps_lock::retry::RetryConfig;
use ncps_lock_memory::MemoryRwLocker;

use crate::config::MysqlLockConfig;
use crate::key::named_lock_id;

/// Consecutive failures before the breaker opens.
const BREAKER_THRESHOLD: u32 = 5;

/// How long the breaker blocks before admitting a probe.
const BREAKER_TIMEOUT: Duration = Duration::from_secs(30);

/// Lock name exercised by the startup probe.
const STARTUP_PROBE_LOCK: &str = "ncps_test_lock";

const GET_LOCK_SQL: &str = "SELECT GET_LOCK(?, 0)";
const RELEASE_LOCK_SQL: &str = "SELECT RELEASE_LOCK(?)";

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// MySQL/MariaDB named-lock backend implementing [`Locker`] and [`RwLocker`].
///
/// Each successful acquire checks a dedicated connection out of the pool and
/// parks it in a binding map until release; losing that connection releases
/// the lock server-side.
///
/// The [`RwLocker`] surface is exclusive-only: MySQL has no shared advisory
/// locks, so `read_lock`/`read_unlock` delegate to `lock`/`unlock`.
///
/// With `allow_degraded_mode`, an open circuit breaker transparently reroutes
/// calls to an embedded in-process reader–writer lock, suspending
/// cross-instance exclusion for as long as the breaker stays open.
pub struct MysqlLocker {
    pool: MySqlPool,
    config: MysqlLockConfig,
    retry: RetryConfig,
    breaker: CircuitBreaker,
    allow_degraded: bool,
    fallback: MemoryRwLocker,
    metrics: Arc<dyn LockMetrics>,
    /// Dedicated connection per held lock.
    connections: Mutex<HashMap<String, PoolConnection<MySql>>>,
    /// Hold start times for the hold-duration metric.
    held_since: Mutex<HashMap<String, Instant>>,
}

impl MysqlLocker {
    /// Create a backend over a caller-supplied pool and probe the server's
    /// named-lock support.
    ///
    /// # Errors
    ///
    /// Returns an error when the retry config is invalid or the startup probe
    /// cannot reach the server. See [`connect`](Self::connect) for the
    /// degraded-mode construction path.
    pub async fn new(
        pool: MySqlPool,
        config: MysqlLockConfig,
        retry: RetryConfig,
        allow_degraded_mode: bool,
    ) -> Result<Self, LockError> {
        retry
            .validate()
            .map_err(|e| LockError::Backend(format!("invalid retry config: {e}")))?;

        warn!("mysql backend has no shared locks; read locks collapse to exclusive");

        let locker = Self {
            pool,
            config,
            retry,
            breaker: CircuitBreaker::new(BREAKER_THRESHOLD, BREAKER_TIMEOUT),
            allow_degraded: allow_degraded_mode,
            fallback: MemoryRwLocker::new(),
            metrics: Arc::new(NoopMetrics),
            connections: Mutex::new(HashMap::new()),
            held_since: Mutex::new(HashMap::new()),
        };
        locker.startup_probe().await?;
        Ok(locker)
    }

    /// Construction entry point honouring degraded mode: when the server is
    /// unreachable and `allow_degraded_mode` is set, an in-process
    /// reader–writer lock is returned transparently instead.
    pub async fn connect(
        pool: MySqlPool,
        config: MysqlLockConfig,
        retry: RetryConfig,
        allow_degraded_mode: bool,
    ) -> Result<Box<dyn RwLocker>, LockError> {
        match Self::new(pool, config, retry, allow_degraded_mode).await {
            Ok(locker) => Ok(Box::new(locker)),
            Err(e) if allow_degraded_mode && e.is_connection_error() => {
                warn!(error = %e, "mysql unreachable, degrading to in-process locks");
                Ok(Box::new(MemoryRwLocker::new()))
            }
            Err(e) => Err(e),
        }
    }

    /// Replace the metrics sink (and the embedded fallback's).
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn LockMetrics>) -> Self {
        self.fallback = MemoryRwLocker::with_metrics(Arc::clone(&metrics));
        self.metrics = metrics;
        self
    }

    /// The breaker guarding this backend, for observation and tests.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Acquire and release a throwaway named lock to verify connectivity and
    /// server support.
    async fn startup_probe(&self) -> Result<(), LockError> {
        let mut conn = self.checkout().await?;
        let acquired = get_lock(&mut conn, STARTUP_PROBE_LOCK).await?;
        if acquired {
            let _ = release_lock(&mut conn, STARTUP_PROBE_LOCK).await?;
        }
        debug!("mysql named lock probe succeeded");
        Ok(())
    }

    async fn checkout(&self) -> Result<PoolConnection<MySql>, LockError> {
        self.pool
            .acquire()
            .await
            .map_err(|e| classify_backend_error(e.to_string()))
    }

    fn should_degrade(&self) -> bool {
        self.allow_degraded && self.breaker.is_open()
    }

    async fn acquire_loop(
        &self,
        cancel: &CancellationToken,
        key: &str,
    ) -> Result<PoolConnection<MySql>, LockError> {
        let lock_name = named_lock_id(&self.config.key_prefix, key);
        let mut last_err = LockError::Contention(key.to_owned());

        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                self.metrics.retry(LockType::Exclusive);
                if let Err(e) = self.retry.sleep(attempt, cancel).await {
                    self.metrics.failure(
                        LockType::Exclusive,
                        LockMode::DistributedMysql,
                        FailureReason::ContextCanceled,
                    );
                    return Err(e);
                }
            }

            let mut conn = match self.checkout().await {
                Ok(conn) => conn,
                Err(e) => {
                    self.breaker.record_failure();
                    self.metrics.failure(
                        LockType::Exclusive,
                        LockMode::DistributedMysql,
                        FailureReason::DatabaseError,
                    );
                    if self.should_degrade() {
                        return Err(LockError::CircuitBreakerOpen);
                    }
                    last_err = e;
                    continue;
                }
            };

            match get_lock(&mut conn, &lock_name).await {
                Ok(true) => {
                    self.breaker.record_success();
                    self.metrics.acquisition(
                        LockType::Exclusive,
                        LockMode::DistributedMysql,
                        AcquisitionResult::Success,
                    );
                    return Ok(conn);
                }
                Ok(false) => {
                    drop(conn);
                    last_err = LockError::Contention(key.to_owned());
                }
                Err(e) => {
                    let _ = conn.detach().close().await;
                    self.breaker.record_failure();
                    self.metrics.failure(
                        LockType::Exclusive,
                        LockMode::DistributedMysql,
                        FailureReason::DatabaseError,
                    );
                    if self.should_degrade() {
                        return Err(LockError::CircuitBreakerOpen);
                    }
                    last_err = e;
                }
            }
        }

        self.metrics.failure(
            LockType::Exclusive,
            LockMode::DistributedMysql,
            FailureReason::MaxRetries,
        );
        Err(LockError::AcquisitionFailed {
            attempts: self.retry.max_attempts,
            source: Box::new(last_err),
        })
    }
}

/// `GET_LOCK` with zero wait: `1` acquired, `0` contention, `NULL` error.
async fn get_lock(conn: &mut MySqlConnection, name: &str) -> Result<bool, LockError> {
    let result: Option<i64> = sqlx::query_scalar(GET_LOCK_SQL)
        .bind(name)
        .fetch_one(conn)
        .await
        .map_err(|e| classify_backend_error(e.to_string()))?;

    match result {
        Some(1) => Ok(true),
        Some(_) => Ok(false),
        None => Err(LockError::Backend(format!(
            "GET_LOCK({name}) returned NULL"
        ))),
    }
}

/// `RELEASE_LOCK`: `1` released, `0` held by another session, `NULL` unknown.
async fn release_lock(conn: &mut MySqlConnection, name: &str) -> Result<bool, LockError> {
    let result: Option<i64> = sqlx::query_scalar(RELEASE_LOCK_SQL)
        .bind(name)
        .fetch_one(conn)
        .await
        .map_err(|e| classify_backend_error(e.to_string()))?;

    Ok(result == Some(1))
}

#[async_trait]
impl Locker for MysqlLocker {
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
                warn!(key, "mysql breaker open, using in-process fallback");
                return self.fallback.lock(cancel, key, ttl).await;
            }
            self.metrics.failure(
                LockType::Exclusive,
                LockMode::DistributedMysql,
                FailureReason::CircuitBreaker,
            );
            return Err(LockError::CircuitBreakerOpen);
        }

        match self.acquire_loop(cancel, key).await {
            Ok(conn) => {
                guard(&self.connections).insert(key.to_owned(), conn);
                guard(&self.held_since).insert(key.to_owned(), Instant::now());
                Ok(())
            }
            Err(LockError::CircuitBreakerOpen) if self.allow_degraded => {
                warn!(key, "mysql breaker tripped mid-acquire, using in-process fallback");
                self.fallback.lock(cancel, key, ttl).await
            }
            Err(e) => Err(e),
        }
    }

    async fn unlock(&self, cancel: &CancellationToken, key: &str) -> Result<(), LockError> {
        if let Some(started) = guard(&self.held_since).remove(key) {
            self.metrics.hold_duration(
                LockType::Exclusive,
                LockMode::DistributedMysql,
                started.elapsed(),
            );
        }

        let removed = guard(&self.connections).remove(key);
        let Some(mut conn) = removed else {
            // Either the acquire failed, or it landed on the fallback.
            if self.allow_degraded {
                match self.fallback.unlock(cancel, key).await {
                    Ok(()) | Err(LockError::UnknownKey(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            return Ok(());
        };

        let lock_name = named_lock_id(&self.config.key_prefix, key);
        match release_lock(&mut conn, &lock_name).await {
            Ok(released) => {
                if !released {
                    warn!(key, "named lock was not held at release time");
                }
                drop(conn);
            }
            Err(e) => {
                // Server-side state is authoritative: ending the session
                // releases the lock, so a failed unlock is not surfaced.
                warn!(key, error = %e, "named lock release failed, closing connection");
                let _ = conn.detach().close().await;
            }
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
                LockMode::DistributedMysql,
                FailureReason::CircuitBreaker,
            );
            return Err(LockError::CircuitBreakerOpen);
        }

        let lock_name = named_lock_id(&self.config.key_prefix, key);
        let mut conn = match self.checkout().await {
            Ok(conn) => conn,
            Err(e) => {
                self.breaker.record_failure();
                if self.should_degrade() {
                    return self.fallback.try_lock(cancel, key, ttl).await;
                }
                return Err(e);
            }
        };

        match get_lock(&mut conn, &lock_name).await {
            Ok(true) => {
                self.breaker.record_success();
                guard(&self.connections).insert(key.to_owned(), conn);
                guard(&self.held_since).insert(key.to_owned(), Instant::now());
                self.metrics.acquisition(
                    LockType::Exclusive,
                    LockMode::DistributedMysql,
                    AcquisitionResult::Success,
                );
                Ok(true)
            }
            Ok(false) => {
                drop(conn);
                self.metrics.acquisition(
                    LockType::Exclusive,
                    LockMode::DistributedMysql,
                    AcquisitionResult::Contention,
                );
                Ok(false)
            }
            Err(e) => {
                let _ = conn.detach().close().await;
                self.breaker.record_failure();
                if self.should_degrade() {
                    return self.fallback.try_lock(cancel, key, ttl).await;
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl RwLocker for MysqlLocker {
    /// Collapses to the exclusive path: MySQL has no shared advisory locks.
    async fn read_lock(
        &self,
        cancel: &CancellationToken,
        key: &str,
        ttl: Duration,
    ) -> Result<(), LockError> {
        self.lock(cancel, key, ttl).await
    }

    async fn read_unlock(&self, cancel: &CancellationToken, key: &str) -> Result<(), LockError> {
        self.unlock(cancel, key).await
    }
}
