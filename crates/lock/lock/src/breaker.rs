use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Time source indirection so tests can drive the breaker deterministically.
///
/// The default [`SystemClock`] reads the tokio clock, which means tests
/// running under `#[tokio::test(start_paused = true)]` can move it with
/// `tokio::time::advance`.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Clock reading `tokio::time::Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Observable circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation — requests flow through.
    Closed,
    /// The backend is failing — requests are rejected immediately.
    Open,
    /// The open window has elapsed — the next request is admitted as a probe.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    failures: u32,
    /// `Some` while the breaker is open; `None` means closed.
    opened_at: Option<Instant>,
}

/// Failure gate shared by the remote backends.
///
/// Counts consecutive failures; at `threshold` the breaker opens for
/// `timeout`. Once the window elapses, [`allow_request`](Self::allow_request)
/// admits exactly one probe per window by advancing the window start, so a
/// slow probe keeps new callers out instead of flooding the recovering
/// backend.
pub struct CircuitBreaker {
    threshold: u32,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a breaker with the system clock.
    #[must_use]
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self::with_clock(threshold, timeout, Arc::new(SystemClock))
    }

    /// Create a breaker with an injected time source.
    #[must_use]
    pub fn with_clock(threshold: u32, timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            threshold,
            timeout,
            clock,
            inner: Mutex::new(Inner {
                failures: 0,
                opened_at: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one failed call. Opens the breaker at the failure threshold.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failures = inner.failures.saturating_add(1);
        if inner.failures >= self.threshold {
            if inner.opened_at.is_none() {
                debug!(failures = inner.failures, "circuit breaker opening");
            }
            inner.opened_at = Some(self.clock.now());
        }
    }

    /// Record one successful call. Closes the breaker and clears the count.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.opened_at.is_some() {
            debug!("circuit breaker closing after successful probe");
        }
        inner.failures = 0;
        inner.opened_at = None;
    }

    /// Gate a call. Mutates state when a probe is admitted, so never call it
    /// purely to observe — use [`state`](Self::state) for that.
    ///
    /// Returns `true` when the breaker is closed, or when the open window has
    /// elapsed — in which case the window start advances to now so at most
    /// one probe is released per window.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.lock();
        match inner.opened_at {
            None => true,
            Some(opened_at) => {
                let now = self.clock.now();
                if now.duration_since(opened_at) >= self.timeout {
                    inner.opened_at = Some(now);
                    debug!("circuit breaker admitting probe");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Whether the breaker is currently in the blocking window
    /// (post-failure, pre-timeout).
    pub fn is_open(&self) -> bool {
        let inner = self.lock();
        inner
            .opened_at
            .is_some_and(|at| self.clock.now().duration_since(at) < self.timeout)
    }

    /// Open the breaker immediately, as if the threshold had just been hit.
    pub fn force_open(&self) {
        let mut inner = self.lock();
        inner.failures = self.threshold;
        inner.opened_at = Some(self.clock.now());
    }

    /// Read-only observation of the current state.
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match inner.opened_at {
            None => CircuitState::Closed,
            Some(at) => {
                if self.clock.now().duration_since(at) >= self.timeout {
                    CircuitState::HalfOpen
                } else {
                    CircuitState::Open
                }
            }
        }
    }
}
