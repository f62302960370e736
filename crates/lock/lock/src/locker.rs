use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::LockError;

/// Exclusive lock surface.
///
/// `key` is an opaque UTF-8 string chosen by the caller; the subsystem never
/// persists it beyond the lifetime of the hold. Pairing is the caller's
/// responsibility: the task that locked a key is expected to unlock it, and
/// two tasks must not share a key expecting one to release on behalf of the
/// other.
///
/// `ttl` is advisory and backend-specific: in-process and SQL advisory
/// backends ignore it (a SQL advisory lock lives for the session holding it),
/// while Redis backends use it as the key TTL and as the deadline for waits.
/// Each implementation documents its own reading.
///
/// `cancel` is the caller's cancellation signal. Every blocking point — retry
/// sleeps, remote round trips, polling waits — races against it and returns
/// [`LockError::Cancelled`] promptly when it fires, after undoing any side
/// effects of the attempt in flight.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Acquire the exclusive lock for `key`, retrying with backoff until the
    /// configured attempts are exhausted.
    async fn lock(
        &self,
        cancel: &CancellationToken,
        key: &str,
        ttl: Duration,
    ) -> Result<(), LockError>;

    /// Release the exclusive lock for `key`.
    ///
    /// Remote backends return `Ok(())` even when no matching `lock` succeeded,
    /// and log rather than surface release failures: the authoritative state
    /// (TTL expiry, session termination) self-corrects.
    async fn unlock(&self, cancel: &CancellationToken, key: &str) -> Result<(), LockError>;

    /// Single-shot acquire. Returns `Ok(false)` on contention.
    async fn try_lock(
        &self,
        cancel: &CancellationToken,
        key: &str,
        ttl: Duration,
    ) -> Result<bool, LockError>;
}

/// Reader–writer lock surface.
///
/// Extends [`Locker`] (whose methods take the write side) with shared read
/// holds. Multiple readers may hold the same key concurrently; a writer
/// excludes readers and other writers.
#[async_trait]
pub trait RwLocker: Locker {
    /// Acquire a shared read hold on `key`.
    async fn read_lock(
        &self,
        cancel: &CancellationToken,
        key: &str,
        ttl: Duration,
    ) -> Result<(), LockError>;

    /// Release one shared read hold on `key`.
    async fn read_unlock(&self, cancel: &CancellationToken, key: &str) -> Result<(), LockError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Verify object safety of both surfaces.
    fn _assert_dyn_locker(_: &dyn Locker) {}
    fn _assert_dyn_rw_locker(_: &dyn RwLocker) {}
}
