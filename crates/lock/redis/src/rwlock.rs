use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::Value;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use ncps_lock::breaker::CircuitBreaker;
use ncps_lock::error::{LockError, classify_backend_error};
use ncps_lock::locker::{Locker, RwLocker};
use ncps_lock::metrics::{
    AcquisitionResult, FailureReason, LockMetrics, LockMode, LockType, NoopMetrics,
};
use ncps_lock::retry::RetryConfig;
use ncps_lock_memory::MemoryRwLocker;

use crate::config::RedisLockConfig;

/// Consecutive failures before the breaker opens.
const BREAKER_THRESHOLD: u32 = 5;

/// How long the breaker blocks before admitting a probe.
const BREAKER_TIMEOUT: Duration = Duration::from_secs(30);

/// Cadence of the reader-drain and writer-wait polling loops.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connection handle: a pool for one node, a cluster client for several.
enum RwConnection {
    Pool(Pool),
    Cluster(ClusterConnection),
}

impl RwConnection {
    /// Run one command, classifying driver errors.
    async fn run<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, LockError> {
        match self {
            Self::Pool(pool) => {
                let mut conn = pool
                    .get()
                    .await
                    .map_err(|e| classify_backend_error(e.to_string()))?;
                cmd.query_async(&mut conn)
                    .await
                    .map_err(|e| classify_backend_error(e.to_string()))
            }
            Self::Cluster(conn) => {
                let mut conn = conn.clone();
                cmd.query_async(&mut conn)
                    .await
                    .map_err(|e| classify_backend_error(e.to_string()))
            }
        }
    }

    /// `SET key "1" NX PX ttl` — returns whether the flag was newly set.
    async fn set_writer_flag(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg("1").arg("NX").arg("PX").arg(ttl_ms);
        let value: Value = self.run(&cmd).await?;
        Ok(matches!(value, Value::Okay))
    }

    async fn exists(&self, key: &str) -> Result<bool, LockError> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        self.run(&cmd).await
    }

    async fn del(&self, key: &str) -> Result<(), LockError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let _: i64 = self.run(&cmd).await?;
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), LockError> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key).arg(field).arg(value);
        let _: i64 = self.run(&cmd).await?;
        Ok(())
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<(), LockError> {
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(key);
        for field in fields {
            cmd.arg(field);
        }
        let _: i64 = self.run(&cmd).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, LockError> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        self.run(&cmd).await
    }
}

/// Split a reader hash into the count of live entries and the stale fields.
///
/// An entry is stale when its expiration fails to parse or lies in the past;
/// writers reap stale fields so a crashed reader cannot block them forever.
fn partition_readers(
    entries: &HashMap<String, String>,
    now: DateTime<Utc>,
) -> (usize, Vec<String>) {
    let mut active = 0;
    let mut stale = Vec::new();
    for (field, expiry) in entries {
        match DateTime::parse_from_rfc3339(expiry) {
            Ok(t) if t.with_timezone(&Utc) > now => active += 1,
            _ => stale.push(field.clone()),
        }
    }
    (active, stale)
}

/// Cooperative reader–writer [`RwLocker`] over Redis.
///
/// Per logical key, two Redis keys share a `{key}` hash tag:
///
/// - `"{prefix}{{key}}:writer"` — string `"1"` with TTL = the `ttl` passed to
///   [`lock`](Locker::lock); its presence bars new readers.
/// - `"{prefix}{{key}}:readers"` — hash of reader id → RFC3339 expiration;
///   the hash itself carries no TTL because the per-entry expirations are
///   authoritative.
///
/// A writer sets its flag first (barring new readers) and then drains: it
/// polls the reader hash, reaping expired or unparseable entries, until no
/// live reader remains or the deadline passes. All concurrent reads from one
/// locker instance share one lazily initialised reader id.
///
/// `ttl` bounds everything: the writer flag's expiry, the writer's drain
/// deadline, the reader's wait deadline, and the reader's declared expiry.
///
/// With `allow_degraded_mode`, an open circuit breaker transparently reroutes
/// calls to an embedded in-process reader–writer lock, suspending
/// cross-instance exclusion for as long as the breaker stays open.
pub struct RedisRwLocker {
    conn: RwConnection,
    config: RedisLockConfig,
    retry: RetryConfig,
    breaker: CircuitBreaker,
    allow_degraded: bool,
    fallback: MemoryRwLocker,
    metrics: Arc<dyn LockMetrics>,
    /// Reader id shared by every read hold of this instance.
    reader_id: Mutex<Option<String>>,
    /// Write-hold start times for the hold-duration metric and release gating.
    write_held_since: Mutex<HashMap<String, Instant>>,
}

impl std::fmt::Debug for RedisRwLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRwLocker")
            .field("config", &self.config)
            .field("allow_degraded", &self.allow_degraded)
            .finish_non_exhaustive()
    }
}

impl RedisRwLocker {
    /// Connect to the configured node (pool) or node set (cluster) and
    /// verify it with a PING.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NoBackendConfigured`] without addresses, or a
    /// connection error when the probe fails. See [`connect`](Self::connect)
    /// for the degraded-mode construction path.
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

        let conn = if config.addrs.len() > 1 {
            let urls: Vec<String> = config.addrs.iter().map(|a| config.node_url(a)).collect();
            let client =
                ClusterClient::new(urls).map_err(|e| classify_backend_error(e.to_string()))?;
            let conn = tokio::time::timeout(config.connect_timeout, client.get_async_connection())
                .await
                .map_err(|_| {
                    LockError::Connection("i/o timeout connecting to redis cluster".into())
                })?
                .map_err(|e| classify_backend_error(e.to_string()))?;
            RwConnection::Cluster(conn)
        } else {
            let pool_config = PoolConfig::from_url(config.node_url(&config.addrs[0]));
            let pool = pool_config
                .builder()
                .map(|b| {
                    b.max_size(config.pool_size)
                        .wait_timeout(Some(config.connect_timeout))
                        .runtime(Runtime::Tokio1)
                        .build()
                })
                .map_err(|e| classify_backend_error(e.to_string()))?
                .map_err(|e| classify_backend_error(e.to_string()))?;
            RwConnection::Pool(pool)
        };

        let locker = Self {
            conn,
            config,
            retry,
            breaker: CircuitBreaker::new(BREAKER_THRESHOLD, BREAKER_TIMEOUT),
            allow_degraded: allow_degraded_mode,
            fallback: MemoryRwLocker::new(),
            metrics: Arc::new(NoopMetrics),
            reader_id: Mutex::new(None),
            write_held_since: Mutex::new(HashMap::new()),
        };

        let _: String = tokio::time::timeout(
            locker.config.connect_timeout,
            locker.conn.run(&redis::cmd("PING")),
        )
        .await
        .map_err(|_| LockError::Connection("i/o timeout pinging redis".into()))??;

        Ok(locker)
    }

    /// Construction entry point honouring degraded mode: when the node or
    /// cluster is unreachable and `allow_degraded_mode` is set, an in-process
    /// reader–writer lock is returned transparently instead.
    pub async fn connect(
        config: RedisLockConfig,
        retry: RetryConfig,
        allow_degraded_mode: bool,
    ) -> Result<Box<dyn RwLocker>, LockError> {
        match Self::new(config, retry, allow_degraded_mode).await {
            Ok(locker) => Ok(Box::new(locker)),
            Err(e) if allow_degraded_mode && e.is_connection_error() => {
                warn!(error = %e, "redis unreachable, degrading to in-process locks");
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

    fn writer_key(&self, key: &str) -> String {
        format!("{}{{{key}}}:writer", self.config.key_prefix)
    }

    fn readers_key(&self, key: &str) -> String {
        format!("{}{{{key}}}:readers", self.config.key_prefix)
    }

    /// The lazily initialised reader id shared by this instance's read holds.
    fn reader_id(&self) -> String {
        let mut id = guard(&self.reader_id);
        id.get_or_insert_with(|| Uuid::new_v4().simple().to_string())
            .clone()
    }

    fn should_degrade(&self) -> bool {
        self.allow_degraded && self.breaker.is_open()
    }

    /// Delete the writer flag, logging instead of surfacing failures.
    async fn cleanup_writer_flag(&self, key: &str) {
        if let Err(e) = self.conn.del(&self.writer_key(key)).await {
            warn!(key, error = %e, "failed to delete writer flag, relying on TTL expiry");
        }
    }

    /// Poll the reader hash until it drains, reaping stale entries.
    async fn drain_readers(
        &self,
        cancel: &CancellationToken,
        key: &str,
        deadline: Instant,
    ) -> Result<(), LockError> {
        let readers_key = self.readers_key(key);

        loop {
            let entries = match self.conn.hgetall(&readers_key).await {
                Ok(entries) => entries,
                Err(e) => {
                    self.breaker.record_failure();
                    self.metrics.failure(
                        LockType::Write,
                        LockMode::Distributed,
                        FailureReason::RedisError,
                    );
                    self.cleanup_writer_flag(key).await;
                    return Err(e);
                }
            };

            let (active, stale) = partition_readers(&entries, Utc::now());
            if !stale.is_empty() {
                let _ = self.conn.hdel(&readers_key, &stale).await;
            }
            if active == 0 {
                return Ok(());
            }

            if Instant::now() >= deadline {
                self.metrics.failure(
                    LockType::Write,
                    LockMode::Distributed,
                    FailureReason::Timeout,
                );
                self.cleanup_writer_flag(key).await;
                return Err(LockError::ReadersTimeout(key.to_owned()));
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    self.metrics.failure(
                        LockType::Write,
                        LockMode::Distributed,
                        FailureReason::ContextCanceled,
                    );
                    self.cleanup_writer_flag(key).await;
                    return Err(LockError::Cancelled);
                }
                () = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    /// Count live readers once, without waiting.
    async fn active_readers(&self, key: &str) -> Result<usize, LockError> {
        let entries = self.conn.hgetall(&self.readers_key(key)).await?;
        let (active, stale) = partition_readers(&entries, Utc::now());
        if !stale.is_empty() {
            let _ = self.conn.hdel(&self.readers_key(key), &stale).await;
        }
        Ok(active)
    }
}

#[async_trait]
impl Locker for RedisRwLocker {
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
                LockType::Write,
                LockMode::Distributed,
                FailureReason::CircuitBreaker,
            );
            return Err(LockError::CircuitBreakerOpen);
        }

        let deadline = Instant::now() + ttl;
        let writer_key = self.writer_key(key);
        let mut last_err = LockError::WriteLockHeld(key.to_owned());
        let mut flagged = false;

        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                self.metrics.retry(LockType::Write);
                if let Err(e) = self.retry.sleep(attempt, cancel).await {
                    self.metrics.failure(
                        LockType::Write,
                        LockMode::Distributed,
                        FailureReason::ContextCanceled,
                    );
                    return Err(e);
                }
            }

            match self.conn.set_writer_flag(&writer_key, ttl).await {
                Ok(true) => {
                    flagged = true;
                    break;
                }
                Ok(false) => {
                    last_err = LockError::WriteLockHeld(key.to_owned());
                }
                Err(e) if e.is_connection_error() => {
                    self.breaker.record_failure();
                    self.metrics.failure(
                        LockType::Write,
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

        if !flagged {
            self.metrics.failure(
                LockType::Write,
                LockMode::Distributed,
                FailureReason::MaxRetries,
            );
            return Err(LockError::AcquisitionFailed {
                attempts: self.retry.max_attempts,
                source: Box::new(last_err),
            });
        }

        // The flag bars new readers; wait for the in-flight ones.
        self.drain_readers(cancel, key, deadline).await?;

        self.breaker.record_success();
        guard(&self.write_held_since).insert(key.to_owned(), Instant::now());
        self.metrics.acquisition(
            LockType::Write,
            LockMode::Distributed,
            AcquisitionResult::Success,
        );
        Ok(())
    }

    async fn unlock(&self, cancel: &CancellationToken, key: &str) -> Result<(), LockError> {
        let held = guard(&self.write_held_since).remove(key);
        let Some(started) = held else {
            // Either the acquire failed, or it landed on the fallback.
            if self.allow_degraded {
                match self.fallback.unlock(cancel, key).await {
                    Ok(()) | Err(LockError::UnknownKey(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            return Ok(());
        };

        self.metrics
            .hold_duration(LockType::Write, LockMode::Distributed, started.elapsed());
        self.cleanup_writer_flag(key).await;
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
                LockType::Write,
                LockMode::Distributed,
                FailureReason::CircuitBreaker,
            );
            return Err(LockError::CircuitBreakerOpen);
        }

        let writer_key = self.writer_key(key);
        match self.conn.set_writer_flag(&writer_key, ttl).await {
            Ok(true) => {}
            Ok(false) => {
                self.metrics.acquisition(
                    LockType::Write,
                    LockMode::Distributed,
                    AcquisitionResult::Contention,
                );
                return Ok(false);
            }
            Err(e) if e.is_connection_error() => {
                self.breaker.record_failure();
                self.metrics.failure(
                    LockType::Write,
                    LockMode::Distributed,
                    FailureReason::RedisError,
                );
                if self.should_degrade() {
                    return self.fallback.try_lock(cancel, key, ttl).await;
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        // Flag taken; a single reader check decides.
        match self.active_readers(key).await {
            Ok(0) => {
                self.breaker.record_success();
                guard(&self.write_held_since).insert(key.to_owned(), Instant::now());
                self.metrics.acquisition(
                    LockType::Write,
                    LockMode::Distributed,
                    AcquisitionResult::Success,
                );
                Ok(true)
            }
            Ok(_) => {
                self.cleanup_writer_flag(key).await;
                self.metrics.acquisition(
                    LockType::Write,
                    LockMode::Distributed,
                    AcquisitionResult::Contention,
                );
                Ok(false)
            }
            Err(e) => {
                self.cleanup_writer_flag(key).await;
                if e.is_connection_error() {
                    self.breaker.record_failure();
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl RwLocker for RedisRwLocker {
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
                warn!(key, "redis breaker open, using in-process fallback");
                return self.fallback.read_lock(cancel, key, ttl).await;
            }
            self.metrics.failure(
                LockType::Read,
                LockMode::Distributed,
                FailureReason::CircuitBreaker,
            );
            return Err(LockError::CircuitBreakerOpen);
        }

        let writer_key = self.writer_key(key);
        let deadline = Instant::now() + ttl;

        // Wait for the writer flag to clear.
        loop {
            match self.conn.exists(&writer_key).await {
                Ok(false) => break,
                Ok(true) => {
                    if Instant::now() >= deadline {
                        self.metrics.failure(
                            LockType::Read,
                            LockMode::Distributed,
                            FailureReason::Timeout,
                        );
                        return Err(LockError::WriteLockTimeout(key.to_owned()));
                    }
                    tokio::select! {
                        () = cancel.cancelled() => {
                            self.metrics.failure(
                                LockType::Read,
                                LockMode::Distributed,
                                FailureReason::ContextCanceled,
                            );
                            return Err(LockError::Cancelled);
                        }
                        () = tokio::time::sleep(POLL_INTERVAL) => {}
                    }
                }
                Err(e) if e.is_connection_error() => {
                    self.breaker.record_failure();
                    self.metrics.failure(
                        LockType::Read,
                        LockMode::Distributed,
                        FailureReason::RedisError,
                    );
                    if self.should_degrade() {
                        warn!(key, "redis breaker tripped mid-acquire, using in-process fallback");
                        return self.fallback.read_lock(cancel, key, ttl).await;
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }

        // Register this reader with its declared expiry. No TTL on the hash
        // as a whole: per-entry expirations are authoritative and writers
        // reap stale entries.
        let expiry = (Utc::now() + ttl).to_rfc3339();
        match self
            .conn
            .hset(&self.readers_key(key), &self.reader_id(), &expiry)
            .await
        {
            Ok(()) => {
                self.breaker.record_success();
                self.metrics.acquisition(
                    LockType::Read,
                    LockMode::Distributed,
                    AcquisitionResult::Success,
                );
                Ok(())
            }
            Err(e) => {
                if e.is_connection_error() {
                    self.breaker.record_failure();
                    self.metrics.failure(
                        LockType::Read,
                        LockMode::Distributed,
                        FailureReason::RedisError,
                    );
                    if self.should_degrade() {
                        return self.fallback.read_lock(cancel, key, ttl).await;
                    }
                }
                Err(e)
            }
        }
    }

    async fn read_unlock(&self, cancel: &CancellationToken, key: &str) -> Result<(), LockError> {
        if self.allow_degraded {
            // A degraded-mode read hold lives in the fallback.
            match self.fallback.read_unlock(cancel, key).await {
                Ok(()) => return Ok(()),
                Err(LockError::UnknownReadKey(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let fields = vec![self.reader_id()];
        if let Err(e) = self.conn.hdel(&self.readers_key(key), &fields).await {
            // Release failures are swallowed: the entry's expiry self-heals.
            warn!(key, error = %e, "failed to remove reader entry, relying on expiry");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_is_hash_tagged() {
        let config = RedisLockConfig {
            addrs: vec!["127.0.0.1:6379".into()],
            ..RedisLockConfig::default()
        };
        // Exercise the formatting without connecting.
        let prefix = &config.key_prefix;
        let key = "download:abc";
        assert_eq!(
            format!("{prefix}{{{key}}}:writer"),
            "ncps:lock:{download:abc}:writer"
        );
        assert_eq!(
            format!("{prefix}{{{key}}}:readers"),
            "ncps:lock:{download:abc}:readers"
        );
    }

    #[test]
    fn partition_counts_live_and_reaps_stale() {
        let now = Utc::now();
        let mut entries = HashMap::new();
        entries.insert("live".to_string(), (now + Duration::from_secs(60)).to_rfc3339());
        entries.insert("expired".to_string(), (now - chrono::Duration::hours(1)).to_rfc3339());
        entries.insert("garbage".to_string(), "not-a-timestamp".to_string());

        let (active, mut stale) = partition_readers(&entries, now);
        stale.sort();
        assert_eq!(active, 1);
        assert_eq!(stale, vec!["expired".to_string(), "garbage".to_string()]);
    }

    #[test]
    fn empty_hash_has_no_readers() {
        let (active, stale) = partition_readers(&HashMap::new(), Utc::now());
        assert_eq!(active, 0);
        assert!(stale.is_empty());
    }

    #[tokio::test]
    async fn empty_addrs_is_not_configured() {
        let err = RedisRwLocker::new(RedisLockConfig::default(), RetryConfig::default(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::NoBackendConfigured));
    }

    #[tokio::test]
    async fn unreachable_node_degrades_to_in_process() {
        let config = RedisLockConfig {
            addrs: vec!["127.0.0.1:1".into()],
            connect_timeout: Duration::from_millis(500),
            ..RedisLockConfig::default()
        };
        let locker = RedisRwLocker::connect(config, RetryConfig::default(), true)
            .await
            .expect("degraded construction should succeed");

        let cancel = CancellationToken::new();
        locker.lock(&cancel, "k", Duration::from_secs(1)).await.unwrap();
        locker.unlock(&cancel, "k").await.unwrap();
        locker.read_lock(&cancel, "k", Duration::from_secs(1)).await.unwrap();
        locker.read_unlock(&cancel, "k").await.unwrap();
        assert!(locker.try_lock(&cancel, "k", Duration::from_secs(1)).await.unwrap());
        locker.unlock(&cancel, "k").await.unwrap();
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use ncps_lock::testing::{run_locker_conformance_tests, run_rw_locker_conformance_tests};

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

    async fn test_locker() -> RedisRwLocker {
        RedisRwLocker::new(test_config(), RetryConfig::default(), false)
            .await
            .expect("redis should be reachable")
    }

    #[tokio::test]
    async fn conformance() {
        let locker = test_locker().await;
        run_locker_conformance_tests(&locker)
            .await
            .expect("exclusive conformance should pass");
        run_rw_locker_conformance_tests(&locker)
            .await
            .expect("rw conformance should pass");
    }

    #[tokio::test]
    async fn readers_from_separate_instances_overlap() {
        let config = test_config();
        let cancel = CancellationToken::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let config = config.clone();
            let cancel = cancel.clone();
            let inside = Arc::clone(&inside);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let locker = RedisRwLocker::new(config, RetryConfig::default(), false)
                    .await
                    .unwrap();
                locker
                    .read_lock(&cancel, "rw-readers", Duration::from_secs(10))
                    .await
                    .unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                locker.read_unlock(&cancel, "rw-readers").await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) >= 2, "readers should overlap");
    }

    #[tokio::test]
    async fn writer_excludes_readers_until_release() {
        let config = test_config();
        let writer = RedisRwLocker::new(config.clone(), RetryConfig::default(), false)
            .await
            .unwrap();
        let reader = RedisRwLocker::new(config, RetryConfig::default(), false)
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let flag = Arc::new(AtomicBool::new(true));

        writer.lock(&cancel, "rw-barrier", Duration::from_secs(10)).await.unwrap();

        let handle = {
            let cancel = cancel.clone();
            let flag = Arc::clone(&flag);
            tokio::spawn(async move {
                reader
                    .read_lock(&cancel, "rw-barrier", Duration::from_secs(10))
                    .await
                    .unwrap();
                let observed = flag.load(Ordering::SeqCst);
                reader.read_unlock(&cancel, "rw-barrier").await.unwrap();
                observed
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        flag.store(false, Ordering::SeqCst);
        writer.unlock(&cancel, "rw-barrier").await.unwrap();

        assert!(!handle.await.unwrap(), "reader entered before writer released");
    }

    #[tokio::test]
    async fn writer_reaps_stale_reader_entries() {
        let locker = test_locker().await;
        let cancel = CancellationToken::new();
        let key = "rw-stale-reader";

        // Orphan a reader entry that expired an hour ago, as a crashed
        // reader would leave behind.
        let expired = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        locker
            .conn
            .hset(&locker.readers_key(key), "dead-reader", &expired)
            .await
            .unwrap();

        locker.lock(&cancel, key, Duration::from_secs(5)).await.unwrap();
        locker.unlock(&cancel, key).await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_writer_deletes_its_flag() {
        let config = test_config();
        let reader = RedisRwLocker::new(config.clone(), RetryConfig::default(), false)
            .await
            .unwrap();
        let writer = RedisRwLocker::new(config, RetryConfig::default(), false)
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let key = "rw-cancel-cleanup";

        reader.read_lock(&cancel, key, Duration::from_secs(30)).await.unwrap();

        let writer = Arc::new(writer);
        let write_cancel = CancellationToken::new();
        let handle = {
            let writer = Arc::clone(&writer);
            let write_cancel = write_cancel.clone();
            tokio::spawn(async move {
                writer.lock(&write_cancel, "rw-cancel-cleanup", Duration::from_secs(30)).await
            })
        };

        // Let the writer set its flag and enter the drain loop, then cancel.
        tokio::time::sleep(Duration::from_millis(100)).await;
        write_cancel.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, LockError::Cancelled));

        // The writer flag must be gone so future readers are not blocked.
        assert!(!writer.conn.exists(&writer.writer_key(key)).await.unwrap());

        reader.read_unlock(&cancel, key).await.unwrap();
    }

    #[tokio::test]
    async fn try_lock_backs_off_with_active_reader() {
        let config = test_config();
        let reader = RedisRwLocker::new(config.clone(), RetryConfig::default(), false)
            .await
            .unwrap();
        let writer = RedisRwLocker::new(config, RetryConfig::default(), false)
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let key = "rw-try-reader";

        reader.read_lock(&cancel, key, Duration::from_secs(10)).await.unwrap();
        assert!(!writer.try_lock(&cancel, key, Duration::from_secs(10)).await.unwrap());

        // The aborted try must not leave a writer flag behind.
        assert!(!writer.conn.exists(&writer.writer_key(key)).await.unwrap());

        reader.read_unlock(&cancel, key).await.unwrap();
        assert!(writer.try_lock(&cancel, key, Duration::from_secs(10)).await.unwrap());
        writer.unlock(&cancel, key).await.unwrap();
    }
}
