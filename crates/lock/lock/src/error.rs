use thiserror::Error;

/// Errors from lock construction, acquisition, and release.
#[derive(Debug, Error)]
pub enum LockError {
    /// Construction was attempted without the inputs the backend needs.
    #[error("no lock backend configured")]
    NoBackendConfigured,

    /// Fewer Redis nodes than a strict majority were reachable at startup.
    #[error("insufficient redis nodes for quorum: {connected} of {required} reachable")]
    InsufficientQuorum { connected: usize, required: usize },

    /// The circuit breaker is blocking calls and degraded mode is disabled.
    #[error("circuit breaker is open")]
    CircuitBreakerOpen,

    /// All configured attempts were exhausted. Wraps the last underlying cause.
    #[error("lock acquisition failed after {attempts} attempts: {source}")]
    AcquisitionFailed {
        attempts: u32,
        #[source]
        source: Box<LockError>,
    },

    /// A single attempt found the lock held by another owner.
    #[error("lock contention on key {0}")]
    Contention(String),

    /// A writer already holds the Redis RW lock for this key.
    #[error("write lock already held for key {0}")]
    WriteLockHeld(String),

    /// The reader drain did not empty before the write deadline.
    #[error("timed out waiting for readers to drain on key {0}")]
    ReadersTimeout(String),

    /// The writer flag did not clear before the read deadline.
    #[error("timed out waiting for writer to release key {0}")]
    WriteLockTimeout(String),

    /// Unlock of a key this instance never locked (in-process bookkeeping).
    #[error("unlock of unknown key {0}")]
    UnknownKey(String),

    /// Read-unlock of a key with no active read hold (in-process bookkeeping).
    #[error("read-unlock of unknown key {0}")]
    UnknownReadKey(String),

    /// The caller's cancellation token fired mid-operation.
    #[error("lock operation cancelled")]
    Cancelled,

    /// A transport-level fault talking to the backend store.
    #[error("connection error: {0}")]
    Connection(String),

    /// Any other backend error, surfaced directly.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Message fragments that identify a transport-level fault.
///
/// Drivers stringify network errors inconsistently, so classification is by
/// substring over the lowercased message.
const TRANSPORT_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "i/o timeout",
    "no such host",
    "broken pipe",
    "connection closed",
    "closed pool",
    "timed out",
    "unexpected eof",
];

impl LockError {
    /// Whether this error counts toward the circuit breaker.
    ///
    /// Connection faults, cancellation/deadline errors, and backend errors
    /// whose message matches the transport sentinel set all count; contention
    /// and bookkeeping errors never do.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Cancelled => true,
            Self::Backend(msg) => is_transport_message(msg),
            _ => false,
        }
    }
}

/// Classify a stringified driver error into [`LockError::Connection`] or
/// [`LockError::Backend`].
pub fn classify_backend_error(message: String) -> LockError {
    if is_transport_message(&message) {
        LockError::Connection(message)
    } else {
        LockError::Backend(message)
    }
}

fn is_transport_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    TRANSPORT_MARKERS.iter().any(|m| message.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_faults_count_toward_breaker() {
        assert!(LockError::Connection("connection refused".into()).is_connection_error());
        assert!(LockError::Cancelled.is_connection_error());
        assert!(LockError::Backend("dial tcp: i/o timeout".into()).is_connection_error());
        assert!(LockError::Backend("Connection reset by peer".into()).is_connection_error());
    }

    #[test]
    fn contention_and_bookkeeping_do_not() {
        assert!(!LockError::Contention("k".into()).is_connection_error());
        assert!(!LockError::UnknownKey("k".into()).is_connection_error());
        assert!(!LockError::Backend("syntax error at or near".into()).is_connection_error());
    }

    #[test]
    fn classify_splits_on_transport_markers() {
        assert!(matches!(
            classify_backend_error("connect: no such host".into()),
            LockError::Connection(_)
        ));
        assert!(matches!(
            classify_backend_error("WRONGTYPE Operation against a key".into()),
            LockError::Backend(_)
        ));
    }

    #[test]
    fn acquisition_failed_preserves_cause() {
        let err = LockError::AcquisitionFailed {
            attempts: 3,
            source: Box::new(LockError::Contention("narinfo:abc".into())),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("after 3 attempts"));
        assert!(rendered.contains("narinfo:abc"));
    }
}
