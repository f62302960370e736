//! Redis-backed distributed locking.
//!
//! Two backends share this crate:
//!
//! - [`RedisLocker`] — exclusive locks over N independent Redis nodes using
//!   the Redlock majority-quorum protocol. With a single node this degrades
//!   gracefully to plain `SET NX PX` locking.
//! - [`RedisRwLocker`] — a cooperative reader–writer lock over one logical
//!   key space: a writer flag with a TTL plus a reader hash carrying
//!   per-reader expiry timestamps. Writers drain in-flight readers before
//!   entering; stale reader entries are reaped so a crashed reader cannot
//!   block writers forever.
//!
//! Both keys of the RW layout carry the same `{key}` hash tag, so they
//! co-locate on one shard in cluster deployments.
//!
//! # Guarantees
//!
//! The RW lock is *cooperative*: the writer flag check and the reader
//! registration are separate round trips, so it holds between well-behaved
//! clients of this crate but is not linearisable against adversarial ones.
//! Redlock's guarantees likewise hinge on the nodes being independent
//! (non-replicated) masters. For strict mutual exclusion, prefer the
//! `PostgreSQL` backend.

mod config;
mod locker;
mod redlock;
mod rwlock;
mod scripts;

pub use config::RedisLockConfig;
pub use locker::RedisLocker;
pub use rwlock::RedisRwLocker;

pub use ncps_lock::locker::{Locker, RwLocker};
