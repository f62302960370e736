//! Conformance suites shared by every backend.
//!
//! Call these from a backend's test module with a fresh locker instance.
//! The suites only exercise behaviour that holds across all backends;
//! backend-specific behaviour (session scoping, TTL expiry, degraded mode)
//! belongs in the backend's own tests.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::LockError;
use crate::locker::{Locker, RwLocker};

const TTL: Duration = Duration::from_secs(10);

/// Run the exclusive-lock conformance suite.
///
/// # Errors
///
/// Returns an error if any conformance test fails.
pub async fn run_locker_conformance_tests(locker: &dyn Locker) -> Result<(), LockError> {
    test_lock_unlock_roundtrip(locker).await?;
    test_try_lock_contention(locker).await?;
    test_per_key_independence(locker).await?;
    test_reacquire_after_release(locker).await?;
    Ok(())
}

async fn test_lock_unlock_roundtrip(locker: &dyn Locker) -> Result<(), LockError> {
    let cancel = CancellationToken::new();
    locker.lock(&cancel, "conformance-roundtrip", TTL).await?;
    locker.unlock(&cancel, "conformance-roundtrip").await?;
    Ok(())
}

async fn test_try_lock_contention(locker: &dyn Locker) -> Result<(), LockError> {
    let cancel = CancellationToken::new();
    let key = "conformance-contention";

    let acquired = locker.try_lock(&cancel, key, TTL).await?;
    assert!(acquired, "uncontested try_lock should acquire");

    let acquired = locker.try_lock(&cancel, key, TTL).await?;
    assert!(!acquired, "second try_lock should report contention");

    locker.unlock(&cancel, key).await?;

    let acquired = locker.try_lock(&cancel, key, TTL).await?;
    assert!(acquired, "try_lock should succeed after release");
    locker.unlock(&cancel, key).await?;
    Ok(())
}

async fn test_per_key_independence(locker: &dyn Locker) -> Result<(), LockError> {
    let cancel = CancellationToken::new();

    locker.lock(&cancel, "conformance-key-a", TTL).await?;
    let acquired = locker.try_lock(&cancel, "conformance-key-b", TTL).await?;
    assert!(acquired, "holding key A must not block try_lock on key B");

    locker.unlock(&cancel, "conformance-key-b").await?;
    locker.unlock(&cancel, "conformance-key-a").await?;
    Ok(())
}

async fn test_reacquire_after_release(locker: &dyn Locker) -> Result<(), LockError> {
    let cancel = CancellationToken::new();
    let key = "conformance-reacquire";

    for _ in 0..3 {
        locker.lock(&cancel, key, TTL).await?;
        locker.unlock(&cancel, key).await?;
    }
    Ok(())
}

/// Run the reader–writer conformance suite.
///
/// # Errors
///
/// Returns an error if any conformance test fails.
pub async fn run_rw_locker_conformance_tests(locker: &dyn RwLocker) -> Result<(), LockError> {
    test_read_roundtrip(locker).await?;
    test_reader_blocks_writer(locker).await?;
    test_write_then_read(locker).await?;
    Ok(())
}

async fn test_read_roundtrip(locker: &dyn RwLocker) -> Result<(), LockError> {
    let cancel = CancellationToken::new();
    locker.read_lock(&cancel, "conformance-rw-roundtrip", TTL).await?;
    locker.read_unlock(&cancel, "conformance-rw-roundtrip").await?;
    Ok(())
}

async fn test_reader_blocks_writer(locker: &dyn RwLocker) -> Result<(), LockError> {
    let cancel = CancellationToken::new();
    let key = "conformance-rw-contention";

    locker.read_lock(&cancel, key, TTL).await?;

    let acquired = locker.try_lock(&cancel, key, TTL).await?;
    assert!(!acquired, "try_lock must fail while a read hold is active");

    locker.read_unlock(&cancel, key).await?;

    let acquired = locker.try_lock(&cancel, key, TTL).await?;
    assert!(acquired, "try_lock should succeed once readers drain");
    locker.unlock(&cancel, key).await?;
    Ok(())
}

async fn test_write_then_read(locker: &dyn RwLocker) -> Result<(), LockError> {
    let cancel = CancellationToken::new();
    let key = "conformance-rw-succession";

    locker.lock(&cancel, key, TTL).await?;
    locker.unlock(&cancel, key).await?;

    locker.read_lock(&cancel, key, TTL).await?;
    locker.read_unlock(&cancel, key).await?;
    Ok(())
}
