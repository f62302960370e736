//! MySQL/MariaDB-backed distributed locking.
//!
//! Locks are named `GET_LOCK` locks, scoped to the connection that acquired
//! them and released on `RELEASE_LOCK` or disconnect. As with the Postgres
//! backend, every held lock pins a dedicated pool connection until release.
//!
//! MySQL has no shared advisory locks, so the [`RwLocker`] surface collapses
//! all read operations onto the exclusive path; construction logs a warning
//! to that effect. Callers that need real read concurrency should pick the
//! Postgres or Redis backend.
//!
//! `ttl` is ignored: a named lock lives until released or its session ends.

mod config;
mod key;
mod locker;

pub use config::MysqlLockConfig;
pub use locker::MysqlLocker;

pub use ncps_lock::locker::{Locker, RwLocker};
