//! In-process lock backends.
//!
//! [`MemoryLocker`] provides per-key exclusive locks; [`MemoryRwLocker`]
//! provides a reader–writer lock. Both serve single-instance deployments and
//! double as the degraded-mode fallbacks embedded in the remote backends.
//!
//! `ttl` is ignored throughout: an in-process hold lives until it is
//! explicitly released or the process exits.

mod exclusive;
mod rwlock;

pub use exclusive::MemoryLocker;
pub use rwlock::MemoryRwLocker;
