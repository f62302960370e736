//! Coordination primitives shared by every ncps lock backend.
//!
//! This crate defines the two capability surfaces — [`Locker`] for exclusive
//! locks and [`RwLocker`] for reader–writer locks — together with the pieces
//! every backend composes around them: the [`RetryConfig`] acquisition policy,
//! the [`CircuitBreaker`] protecting remote stores, the [`LockMetrics`] sink,
//! and the error taxonomy in [`LockError`].
//!
//! Backend crates (`ncps-lock-memory`, `ncps-lock-postgres`, `ncps-lock-mysql`,
//! `ncps-lock-redis`) implement the surfaces; callers program against the
//! traits and pick a backend at construction time.

pub mod breaker;
pub mod error;
pub mod locker;
pub mod metrics;
pub mod retry;
pub mod testing;

pub use breaker::{CircuitBreaker, CircuitState, Clock, SystemClock};
pub use error::LockError;
pub use locker::{Locker, RwLocker};
pub use metrics::{
    AcquisitionResult, FailureReason, LockMetrics, LockMode, LockType, NoopMetrics,
    RecorderMetrics,
};
pub use retry::RetryConfig;
