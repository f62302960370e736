use std::time::Duration;

/// Metric names. These are a public contract consumed by dashboards and must
/// not silently change.
pub const ACQUISITIONS_TOTAL: &str = "ncps_lock_acquisitions_total";
pub const HOLD_DURATION_SECONDS: &str = "ncps_lock_hold_duration_seconds";
pub const FAILURES_TOTAL: &str = "ncps_lock_failures_total";
pub const RETRY_ATTEMPTS_TOTAL: &str = "ncps_lock_retry_attempts_total";

/// The `type` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Exclusive,
    Read,
    Write,
}

impl LockType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exclusive => "exclusive",
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

/// The `mode` label, identifying the backend family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Local,
    Distributed,
    DistributedPostgres,
    DistributedMysql,
}

impl LockMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Distributed => "distributed",
            Self::DistributedPostgres => "distributed-postgres",
            Self::DistributedMysql => "distributed-mysql",
        }
    }
}

/// The `result` label on acquisition counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionResult {
    Success,
    Contention,
    Failure,
}

impl AcquisitionResult {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Contention => "contention",
            Self::Failure => "failure",
        }
    }
}

/// The `reason` label on failure counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Timeout,
    RedisError,
    ContextCanceled,
    CircuitBreaker,
    MaxRetries,
    DatabaseError,
}

impl FailureReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RedisError => "redis_error",
            Self::ContextCanceled => "context_canceled",
            Self::CircuitBreaker => "circuit_breaker",
            Self::MaxRetries => "max_retries",
            Self::DatabaseError => "database_error",
        }
    }
}

/// Emitter interface consumed by every backend.
///
/// Backends hold an `Arc<dyn LockMetrics>` and default to [`NoopMetrics`], so
/// an unwired sink costs nothing and never panics. Read-hold durations are
/// deliberately not part of the surface: concurrent readers share one
/// primitive and a per-key start time would be ambiguous.
pub trait LockMetrics: Send + Sync {
    /// Count one acquisition outcome.
    fn acquisition(&self, lock_type: LockType, mode: LockMode, result: AcquisitionResult);

    /// Observe how long a lock was held, in wall-clock time.
    fn hold_duration(&self, lock_type: LockType, mode: LockMode, held_for: Duration);

    /// Count one terminal failure.
    fn failure(&self, lock_type: LockType, mode: LockMode, reason: FailureReason);

    /// Count one retry attempt (attempts after the first).
    fn retry(&self, lock_type: LockType);
}

/// Sink that discards every signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl LockMetrics for NoopMetrics {
    fn acquisition(&self, _: LockType, _: LockMode, _: AcquisitionResult) {}
    fn hold_duration(&self, _: LockType, _: LockMode, _: Duration) {}
    fn failure(&self, _: LockType, _: LockMode, _: FailureReason) {}
    fn retry(&self, _: LockType) {}
}

/// Sink that emits through the [`metrics`] facade, for deployments that
/// install a recorder (e.g. a Prometheus exporter).
#[derive(Debug, Clone, Copy, Default)]
pub struct RecorderMetrics;

impl LockMetrics for RecorderMetrics {
    fn acquisition(&self, lock_type: LockType, mode: LockMode, result: AcquisitionResult) {
        metrics::counter!(
            ACQUISITIONS_TOTAL,
            "type" => lock_type.as_str(),
            "mode" => mode.as_str(),
            "result" => result.as_str()
        )
        .increment(1);
    }

    fn hold_duration(&self, lock_type: LockType, mode: LockMode, held_for: Duration) {
        metrics::histogram!(
            HOLD_DURATION_SECONDS,
            "type" => lock_type.as_str(),
            "mode" => mode.as_str()
        )
        .record(held_for.as_secs_f64());
    }

    fn failure(&self, lock_type: LockType, mode: LockMode, reason: FailureReason) {
        metrics::counter!(
            FAILURES_TOTAL,
            "type" => lock_type.as_str(),
            "mode" => mode.as_str(),
            "reason" => reason.as_str()
        )
        .increment(1);
    }

    fn retry(&self, lock_type: LockType) {
        metrics::counter!(RETRY_ATTEMPTS_TOTAL, "type" => lock_type.as_str()).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_values() {
        assert_eq!(LockType::Exclusive.as_str(), "exclusive");
        assert_eq!(LockType::Read.as_str(), "read");
        assert_eq!(LockType::Write.as_str(), "write");
        assert_eq!(LockMode::Local.as_str(), "local");
        assert_eq!(LockMode::Distributed.as_str(), "distributed");
        assert_eq!(LockMode::DistributedPostgres.as_str(), "distributed-postgres");
        assert_eq!(LockMode::DistributedMysql.as_str(), "distributed-mysql");
        assert_eq!(AcquisitionResult::Contention.as_str(), "contention");
        assert_eq!(FailureReason::RedisError.as_str(), "redis_error");
        assert_eq!(FailureReason::ContextCanceled.as_str(), "context_canceled");
        assert_eq!(FailureReason::MaxRetries.as_str(), "max_retries");
    }

    #[test]
    fn noop_sink_accepts_everything() {
        let sink = NoopMetrics;
        sink.acquisition(LockType::Exclusive, LockMode::Local, AcquisitionResult::Success);
        sink.hold_duration(LockType::Write, LockMode::Distributed, Duration::from_secs(1));
        sink.failure(LockType::Read, LockMode::DistributedPostgres, FailureReason::Timeout);
        sink.retry(LockType::Exclusive);
    }
}
