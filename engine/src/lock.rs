//! Single-node pessimistic lock.
//!
//! A named mutex on one coordination node: acquired by writing a
//! caller-unique token if the key is absent (with the TTL set atomically),
//! released by a server-side compare-and-delete. Contention never blocks;
//! it yields [`LockOutcome::Busy`] and the coordinator retries with
//! backoff.
//!
//! State machine per lock:
//!
//! ```text
//! Absent --acquire ok--> Held(token, expiry)
//! Held --release(matching token)--> Absent
//! Held --TTL expiry--> Absent
//! Held --release(non-matching token)--> Held (unchanged), caller sees NotHeld
//! ```

use hotdrop_core::error::NodeError;
use hotdrop_core::node::{AcquireOutcome, CoordinationNode, ExtendOutcome, ReleaseOutcome};
use hotdrop_core::types::LockToken;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A successfully held lock.
///
/// `deadline` is the monotonic instant past which the holder must stop
/// trusting the lock: acquisition time plus TTL for a single-node lock,
/// acquisition time plus drift-compensated validity for a quorum lock.
#[derive(Debug, Clone)]
pub struct LockGrant {
    /// Token the lock is held under.
    pub token: LockToken,
    /// Monotonic instant the acquisition started.
    pub acquired_at: Instant,
    /// Monotonic instant past which the lock is no longer trusted.
    pub deadline: Instant,
    /// Indexes (into the configured node list) of the granting nodes.
    pub granted_nodes: Vec<usize>,
}

impl LockGrant {
    /// Remaining time during which the lock may be trusted.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Result of one lock acquisition round (single-node or quorum).
#[derive(Debug, Clone)]
pub enum LockOutcome {
    /// The lock is held.
    Held(LockGrant),
    /// Contention: another holder has the lock (or the quorum was not
    /// reached). No lock record is left behind by this attempt.
    Busy,
    /// No node replied at all; the coordination layer is unreachable.
    Unavailable,
}

/// Named mutex on a single coordination node.
pub struct SingleNodeLock<N> {
    node: Arc<N>,
}

impl<N: CoordinationNode> SingleNodeLock<N> {
    /// Create a lock over one node.
    #[must_use]
    pub const fn new(node: Arc<N>) -> Self {
        Self { node }
    }

    /// Attempt one acquisition of `name` with the given TTL.
    ///
    /// One round trip: set-if-absent-with-expiry under a fresh token.
    /// Returns [`LockOutcome::Busy`] on contention without blocking.
    pub async fn acquire(&self, name: &str, ttl: Duration) -> LockOutcome {
        let token = LockToken::new();
        let started = Instant::now();

        match self.node.acquire(name, &token, ttl).await {
            Ok(AcquireOutcome::Acquired) => {
                counter!("hotdrop_lock_acquire_total", "strategy" => "single", "outcome" => "held")
                    .increment(1);
                histogram!("hotdrop_lock_acquire_duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                tracing::debug!(resource = name, %token, "Acquired single-node lock");
                LockOutcome::Held(LockGrant {
                    token,
                    acquired_at: started,
                    deadline: started + ttl,
                    granted_nodes: vec![0],
                })
            }
            Ok(AcquireOutcome::Busy) => {
                counter!("hotdrop_lock_acquire_total", "strategy" => "single", "outcome" => "busy")
                    .increment(1);
                LockOutcome::Busy
            }
            Err(err) => {
                counter!("hotdrop_node_errors_total", "node" => self.node.id().to_string())
                    .increment(1);
                tracing::warn!(resource = name, error = %err, "Lock acquisition failed at node");
                LockOutcome::Unavailable
            }
        }
    }

    /// Release `name` if it is still held under `token`.
    ///
    /// Server-side compare-and-delete: a caller whose TTL already expired
    /// cannot delete a successor's lock. Idempotent after the first
    /// success.
    pub async fn release(&self, name: &str, token: &LockToken) -> Result<ReleaseOutcome, NodeError> {
        let outcome = self.node.release(name, token).await?;
        match outcome {
            ReleaseOutcome::Released => {
                tracing::debug!(resource = name, %token, "Released single-node lock");
            }
            ReleaseOutcome::NotHeld => {
                tracing::debug!(resource = name, %token, "Lock already gone at release");
            }
        }
        Ok(outcome)
    }

    /// Refresh the TTL of `name` if it is still held under `token`.
    pub async fn extend(
        &self,
        name: &str,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<ExtendOutcome, NodeError> {
        self.node.extend(name, token, ttl).await
    }
}
