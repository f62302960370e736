use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, PgConnection, PgPool, Postgres};
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

use crate::config::PostgresLockConfig;
use crate::key::advisory_lock_id;

/// Consecutive failures before the breaker opens.
const BREAKER_THRESHOLD: u32 = 5;

/// How long the breaker blocks before admitting a probe.
const BREAKER_TIMEOUT: Duration = Duration::from_secs(30);

/// Advisory lock id exercised by the startup probe.
const STARTUP_PROBE_LOCK_ID: i64 = 123_456_789;

const TRY_LOCK_SQL: &str = "SELECT pg_try_advisory_lock($1)";
const UNLOCK_SQL: &str = "SELECT pg_advisory_unlock($1)";
const TRY_LOCK_SHARED_SQL: &str = "SELECT pg_try_advisory_lock_shared($1)";
const UNLOCK_SHARED_SQL: &str = "SELECT pg_advisory_unlock_shared($1)";

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// PostgreSQL advisory-lock backend implementing [`Locker`] and [`RwLocker`].
///
/// Each successful acquire checks a dedicated connection out of the pool and
/// parks it in a binding map until release; losing that connection releases
/// the lock server-side. Read locks take one dedicated connection per reader.
///
/// With `allow_degraded_mode`, an open circuit breaker transparently reroutes
/// calls to an embedded in-process reader–writer lock. Cross-instance
/// exclusion is suspended for as long as the breaker stays open — this trades
/// consistency for availability and is acceptable only when callers can
/// tolerate duplicate work.
pub struct PostgresLocker {
    pool: PgPool,
    config: PostgresLockConfig,
    retry: RetryConfig,
    breaker: CircuitBreaker,
    allow_degraded: bool,
    fallback: MemoryRwLocker,
    metrics: Arc<dyn LockMetrics>,
    /// Dedicated connection per held exclusive lock.
    connections: Mutex<HashMap<String, PoolConnection<Postgres>>>,
    /// Dedicated connections per held read lock, one per reader.
    read_connections: Mutex<HashMap<String, Vec<PoolConnection<Postgres>>>>,
    /// Exclusive-hold start times for the hold-duration metric.
    held_since: Mutex<HashMap<String, Instant>>,
}

impl PostgresLocker {
    /// Create a backend over a caller-supplied pool and probe the server's
    /// advisory-lock support.
    ///
    /// # Errors
    ///
    /// Returns an error when the retry config is invalid or the startup probe
    /// cannot reach the server. See [`connect`](Self::connect) for the
    /// degraded-mode construction path.
    pub async fn new(
        pool: PgPool,
        config: PostgresLockConfig,
        retry: RetryConfig,
        allow_degraded_mode: bool,
    ) -> Result<Self, LockError> {
        retry
            .validate()
            .map_err(|e| LockError::Backend(format!("invalid retry config: {e}")))?;

        let locker = Self {
            pool,
            config,
            retry,
            breaker: CircuitBreaker::new(BREAKER_THRESHOLD, BREAKER_TIMEOUT),
            allow_degraded: allow_degraded_mode,
            fallback: MemoryRwLocker::new(),
            metrics: Arc::new(NoopMetrics),
            connections: Mutex::new(HashMap::new()),
            read_connections: Mutex::new(HashMap::new()),
            held_since: Mutex::new(HashMap::new()),
        };
        locker.startup_probe().await?;
        Ok(locker)
    }

    /// Construction entry point honouring degraded mode: when the server is
    /// unreachable and `allow_degraded_mode` is set, an in-process
    /// reader–writer lock is returned transparently instead.
    pub async fn connect(
        pool: PgPool,
        config: PostgresLockConfig,
        retry: RetryConfig,
        allow_degraded_mode: bool,
    ) -> Result<Box<dyn RwLocker>, LockError> {
        match Self::new(pool, config, retry, allow_degraded_mode).await {
            Ok(locker) => Ok(Box::new(locker)),
            Err(e) if allow_degraded_mode && e.is_connection_error() => {
                warn!(error = %e, "postgres unreachable, degrading to in-process locks");
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

    /// Acquire and release a throwaway advisory lock to verify connectivity
    /// and server support.
    async fn startup_probe(&self) -> Result<(), LockError> {
        let mut conn = self.checkout().await?;
        let acquired = try_advisory(&mut conn, TRY_LOCK_SQL, STARTUP_PROBE_LOCK_ID).await?;
        if acquired {
            let _ = try_advisory(&mut conn, UNLOCK_SQL, STARTUP_PROBE_LOCK_ID).await?;
        }
        debug!("postgres advisory lock probe succeeded");
        Ok(())
    }

    async fn checkout(&self) -> Result<PoolConnection<Postgres>, LockError> {
        self.pool
            .acquire()
            .await
            .map_err(|e| classify_backend_error(e.to_string()))
    }

    fn should_degrade(&self) -> bool {
        self.allow_degraded && self.breaker.is_open()
    }

    /// Shared acquire loop for the exclusive and shared primitives.
    ///
    /// Returns the dedicated connection now owning the server-side lock.
    async fn acquire_loop(
        &self,
        cancel: &CancellationToken,
        key: &str,
        lock_type: LockType,
        acquire_sql: &str,
    ) -> Result<PoolConnection<Postgres>, LockError> {
        let lock_id = advisory_lock_id(&self.config.key_prefix, key);
        let mut last_err = LockError::Contention(key.to_owned());

        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                self.metrics.retry(lock_type);
                if let Err(e) = self.retry.sleep(attempt, cancel).await {
                    self.metrics.failure(
                        lock_type,
                        LockMode::DistributedPostgres,
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
                        lock_type,
                        LockMode::DistributedPostgres,
                        FailureReason::DatabaseError,
                    );
                    if self.should_degrade() {
                        return Err(LockError::CircuitBreakerOpen);
                    }
                    last_err = e;
                    continue;
                }
            };

            match try_advisory(&mut conn, acquire_sql, lock_id).await {
                Ok(true) => {
                    self.breaker.record_success();
                    self.metrics.acquisition(
                        lock_type,
                        LockMode::DistributedPostgres,
                        AcquisitionResult::Success,
                    );
                    return Ok(conn);
                }
                Ok(false) => {
                    // Back to the pool; the session holds nothing.
                    drop(conn);
                    last_err = LockError::Contention(key.to_owned());
                }
                Err(e) => {
                    // The session state is unknown; kill the connection.
                    let _ = conn.detach().close().await;
                    self.breaker.record_failure();
                    self.metrics.failure(
                        lock_type,
                        LockMode::DistributedPostgres,
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
            lock_type,
            LockMode::DistributedPostgres,
            FailureReason::MaxRetries,
        );
        Err(LockError::AcquisitionFailed {
            attempts: self.retry.max_attempts,
            source: Box::new(last_err),
        })
    }
}

/// Run one of the advisory-lock statements, classifying driver errors.
async fn try_advisory(
    conn: &mut PgConnection,
    sql: &str,
    lock_id: i64,
) -> Result<bool, LockError> {
    sqlx::query_scalar::<_, bool>(sql)
        .bind(lock_id)
        .fetch_one(conn)
        .await
        .map_err(|e| classify_backend_error(e.to_string()))
}

#[async_trait]
impl Locker for PostgresLocker {
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
                warn!(key, "postgres breaker open, using in-process fallback");
                return self.fallback.lock(cancel, key, ttl).await;
            }
            self.metrics.failure(
                LockType::Exclusive,
                LockMode::DistributedPostgres,
                FailureReason::CircuitBreaker,
            );
            return Err(LockError::CircuitBreakerOpen);
        }

        match self
            .acquire_loop(cancel, key, LockType::Exclusive, TRY_LOCK_SQL)
            .await
        {
            Ok(conn) => {
                guard(&self.connections).insert(key.to_owned(), conn);
                guard(&self.held_since).insert(key.to_owned(), Instant::now());
                Ok(())
            }
            Err(LockError::CircuitBreakerOpen) if self.allow_degraded => {
                warn!(key, "postgres breaker tripped mid-acquire, using in-process fallback");
                self.fallback.lock(cancel, key, ttl).await
            }
            Err(e) => Err(e),
        }
    }

    async fn unlock(&self, cancel: &CancellationToken, key: &str) -> Result<(), LockError> {
        if let Some(started) = guard(&self.held_since).remove(key) {
            self.metrics.hold_duration(
                LockType::Exclusive,
                LockMode::DistributedPostgres,
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

        let lock_id = advisory_lock_id(&self.config.key_prefix, key);
        match try_advisory(&mut conn, UNLOCK_SQL, lock_id).await {
            Ok(released) => {
                if !released {
                    warn!(key, "advisory lock was not held at release time");
                }
                // Connection returns to the pool clean.
                drop(conn);
            }
            Err(e) => {
                // Server-side state is authoritative: ending the session
                // releases the lock, so a failed unlock is not surfaced.
                warn!(key, error = %e, "advisory unlock failed, closing connection");
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
                LockMode::DistributedPostgres,
                FailureReason::CircuitBreaker,
            );
            return Err(LockError::CircuitBreakerOpen);
        }

        let lock_id = advisory_lock_id(&self.config.key_prefix, key);
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

        match try_advisory(&mut conn, TRY_LOCK_SQL, lock_id).await {
            Ok(true) => {
                self.breaker.record_success();
                guard(&self.connections).insert(key.to_owned(), conn);
                guard(&self.held_since).insert(key.to_owned(), Instant::now());
                self.metrics.acquisition(
                    LockType::Exclusive,
                    LockMode::DistributedPostgres,
                    AcquisitionResult::Success,
                );
                Ok(true)
            }
            Ok(false) => {
                drop(conn);
                self.metrics.acquisition(
                    LockType::Exclusive,
                    LockMode::DistributedPostgres,
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
impl RwLocker for PostgresLocker {
    async fn read_lock(
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
                warn!(key, "postgres breaker open, using in-process fallback");
                return self.fallback.read_lock(cancel, key, ttl).await;
            }
            self.metrics.failure(
                LockType::Read,
                LockMode::DistributedPostgres,
                FailureReason::CircuitBreaker,
            );
            return Err(LockError::CircuitBreakerOpen);
        }

        match self
            .acquire_loop(cancel, key, LockType::Read, TRY_LOCK_SHARED_SQL)
            .await
        {
            Ok(conn) => {
                guard(&self.read_connections)
                    .entry(key.to_owned())
                    .or_default()
                    .push(conn);
                Ok(())
            }
            Err(LockError::CircuitBreakerOpen) if self.allow_degraded => {
                warn!(key, "postgres breaker tripped mid-acquire, using in-process fallback");
                self.fallback.read_lock(cancel, key, ttl).await
            }
            Err(e) => Err(e),
        }
    }

    async fn read_unlock(&self, cancel: &CancellationToken, key: &str) -> Result<(), LockError> {
        let conn = {
            let mut read_connections = guard(&self.read_connections);
            match read_connections.get_mut(key) {
                Some(conns) => {
                    let conn = conns.pop();
                    if conns.is_empty() {
                        read_connections.remove(key);
                    }
                    conn
                }
                None => None,
            }
        };

        let Some(mut conn) = conn else {
            if self.allow_degraded {
                match self.fallback.read_unlock(cancel, key).await {
                    Ok(()) | Err(LockError::UnknownReadKey(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            return Ok(());
        };

        let lock_id = advisory_lock_id(&self.config.key_prefix, key);
        match try_advisory(&mut conn, UNLOCK_SHARED_SQL, lock_id).await {
            Ok(released) => {
                if !released {
                    warn!(key, "shared advisory lock was not held at release time");
                }
                drop(conn);
            }
            Err(e) => {
                warn!(key, error = %e, "shared advisory unlock failed, closing connection");
                let _ = conn.detach().close().await;
            }
        }
        Ok(())
    }
}
