//! PostgreSQL-backed distributed locking.
//!
//! Locks are Postgres *session advisory locks*: named locks the server tracks
//! per connection, released when the holding session unlocks them or
//! disconnects. Each held lock is therefore pinned to a dedicated pool
//! connection for its whole lifetime — a shared pool handle would let the
//! pool hand "our" session to another caller and silently drop the lock.
//!
//! `ttl` is ignored by this backend: an advisory lock lives until it is
//! released or its session ends. Callers that need crash-expiry semantics
//! should use the Redis backend.
//!
//! Postgres has true shared advisory locks, so the [`RwLocker`] surface here
//! supports genuinely concurrent readers.

mod config;
mod key;
mod locker;

pub use config::PostgresLockConfig;
pub use locker::PostgresLocker;

pub use ncps_lock::locker::{Locker, RwLocker};
