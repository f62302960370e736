use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::{Script, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use ncps_lock::error::{LockError, classify_backend_error};

use crate::config::RedisLockConfig;
use crate::scripts;

/// Fraction of the TTL budgeted for clock drift between nodes.
const CLOCK_DRIFT_FACTOR: f64 = 0.01;

/// One Redis master participating in the quorum.
pub(crate) struct RedlockNode {
    addr: String,
    conn: MultiplexedConnection,
}

/// Outcome of a single Redlock round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcquireOutcome {
    /// A majority acknowledged within the validity window.
    Acquired,
    /// The nodes responded but the majority already holds another owner,
    /// or too little validity remained.
    Contended,
}

/// Single-round Redlock over N independent masters.
///
/// Deliberately performs **no internal retries**: the caller's retry policy
/// is the only one in force, so one `try_acquire` call maps to exactly one
/// `SET NX PX` round across the nodes. Partial acquisitions are rolled back
/// before returning.
pub(crate) struct Redlock {
    nodes: Vec<RedlockNode>,
    quorum: usize,
}

impl Redlock {
    /// Connect to every configured node independently.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::InsufficientQuorum`] when fewer than a strict
    /// majority of nodes are reachable.
    pub(crate) async fn connect(config: &RedisLockConfig) -> Result<Self, LockError> {
        let quorum = config.quorum();
        let mut nodes = Vec::with_capacity(config.addrs.len());

        for addr in &config.addrs {
            match connect_node(config, addr).await {
                Ok(conn) => nodes.push(RedlockNode {
                    addr: addr.clone(),
                    conn,
                }),
                Err(e) => {
                    warn!(addr, error = %e, "redis node unreachable at startup");
                }
            }
        }

        if nodes.len() < quorum {
            return Err(LockError::InsufficientQuorum {
                connected: nodes.len(),
                required: quorum,
            });
        }

        debug!(
            connected = nodes.len(),
            quorum, "redlock connected to node set"
        );
        Ok(Self { nodes, quorum })
    }

    /// Drive one round of the Redlock algorithm for `key` with the given
    /// owner value.
    ///
    /// # Errors
    ///
    /// Returns a transport-classified error when node failures (rather than
    /// contention) prevented the quorum; the caller feeds those into its
    /// circuit breaker.
    pub(crate) async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<AcquireOutcome, LockError> {
        let started = Instant::now();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

        let mut acked = 0usize;
        let mut transport_err: Option<LockError> = None;

        for node in &self.nodes {
            let mut conn = node.conn.clone();
            let response: Result<Value, _> = redis::cmd("SET")
                .arg(key)
                .arg(owner)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await;

            match response {
                Ok(Value::Okay) => acked += 1,
                // Nil means the key exists on this node: plain contention.
                Ok(_) => {}
                Err(e) => {
                    let classified = classify_backend_error(e.to_string());
                    warn!(addr = %node.addr, error = %classified, "redlock SET failed on node");
                    if classified.is_connection_error() {
                        transport_err = Some(classified);
                    } else {
                        // A non-transport refusal is surfaced directly.
                        self.release(key, owner).await.ok();
                        return Err(classified);
                    }
                }
            }
        }

        // The lock is only valid for what remains of the TTL after the
        // round trips, minus the inter-node drift allowance.
        let drift = ttl.mul_f64(CLOCK_DRIFT_FACTOR) + Duration::from_millis(2);
        let within_validity = started.elapsed() + drift < ttl;

        if acked >= self.quorum && within_validity {
            return Ok(AcquireOutcome::Acquired);
        }

        // Roll back any partial acquisition before reporting.
        self.release(key, owner).await.ok();

        match transport_err {
            Some(e) if acked < self.quorum => Err(e),
            _ => Ok(AcquireOutcome::Contended),
        }
    }

    /// Delete `key` on every node where it still carries `owner`.
    ///
    /// # Errors
    ///
    /// Returns the last transport error, if any node failed; callers treat
    /// release failures as non-fatal because the TTL self-heals.
    pub(crate) async fn release(&self, key: &str, owner: &str) -> Result<(), LockError> {
        let script = Script::new(scripts::LOCK_RELEASE);
        let mut last_err = None;

        for node in &self.nodes {
            let mut conn = node.conn.clone();
            let result: Result<i64, _> = script
                .key(key)
                .arg(owner)
                .invoke_async(&mut conn)
                .await;
            if let Err(e) = result {
                let classified = classify_backend_error(e.to_string());
                warn!(addr = %node.addr, error = %classified, "redlock release failed on node");
                last_err = Some(classified);
            }
        }

        match last_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Number of nodes that connected at startup.
    pub(crate) fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Open one multiplexed connection and verify it with a PING.
async fn connect_node(
    config: &RedisLockConfig,
    addr: &str,
) -> Result<MultiplexedConnection, LockError> {
    let url = config.node_url(addr);
    let client =
        redis::Client::open(url).map_err(|e| classify_backend_error(e.to_string()))?;

    let mut conn = tokio::time::timeout(
        config.connect_timeout,
        client.get_multiplexed_async_connection(),
    )
    .await
    .map_err(|_| LockError::Connection(format!("i/o timeout connecting to {addr}")))?
    .map_err(|e| classify_backend_error(e.to_string()))?;

    let _: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .map_err(|e| classify_backend_error(e.to_string()))?;

    Ok(conn)
}
