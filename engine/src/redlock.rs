//! Quorum lock over independent coordination nodes (Redlock).
//!
//! The lock is held iff strictly more than half of the configured nodes
//! each grant a single-node lock on the same name within a bounded
//! acquisition window, and the drift-compensated remaining validity is
//! still positive.
//!
//! The nodes are independent and uncoordinated; that independence is what
//! makes a majority of live nodes sufficient. Only monotonic local clocks
//! are assumed — the drift compensation is asymmetric precisely so that
//! nodes never need to agree on real time. A minority partition loses its
//! lock records through TTL expiry, which preserves safety.

use crate::lock::{LockGrant, LockOutcome};
use hotdrop_core::config::EngineConfig;
use hotdrop_core::node::{AcquireOutcome, CoordinationNode, ExtendOutcome, ReleaseOutcome};
use hotdrop_core::types::LockToken;
use futures::future::join_all;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Attempts per node when purging lock records during release.
const RELEASE_ATTEMPTS: u32 = 2;

/// Quorum (Redlock) lock over a set of independent coordination nodes.
pub struct QuorumLock<N> {
    nodes: Vec<Arc<N>>,
    drift_factor: f64,
    drift_floor: Duration,
}

impl<N: CoordinationNode + 'static> QuorumLock<N> {
    /// Create a quorum lock over the configured nodes.
    #[must_use]
    pub fn new(nodes: Vec<Arc<N>>, config: &EngineConfig) -> Self {
        Self {
            nodes,
            drift_factor: config.drift_factor,
            drift_floor: config.drift_floor(),
        }
    }

    /// Number of grants required for the lock to be held: ⌊N/2⌋ + 1.
    #[must_use]
    pub fn quorum(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    /// Drift allowance for a lock of the given TTL:
    /// `⌈ttl · drift_factor⌉ + drift_floor`.
    fn drift(&self, ttl: Duration) -> Duration {
        let factor_ms = (ttl.as_millis() as f64 * self.drift_factor).ceil() as u64;
        Duration::from_millis(factor_ms) + self.drift_floor
    }

    /// Attempt one quorum acquisition of `name` with the given TTL.
    ///
    /// One fresh token is used for every node; attempts run in parallel,
    /// each capped by the node's own RPC timeout. A node that times out,
    /// errors, or reports busy counts as a failure for that node but does
    /// not abort the round. On failure (fewer than Q grants, or validity
    /// exhausted by a slow round), every granted node is best-effort
    /// released before returning.
    pub async fn acquire(&self, name: &str, ttl: Duration) -> LockOutcome {
        let token = LockToken::new();
        let started = Instant::now();

        let attempts = self
            .nodes
            .iter()
            .map(|node| async { node.acquire(name, &token, ttl).await });
        let results = join_all(attempts).await;

        let mut granted = Vec::new();
        let mut responded = 0usize;
        for (index, result) in results.iter().enumerate() {
            match result {
                Ok(AcquireOutcome::Acquired) => {
                    responded += 1;
                    granted.push(index);
                }
                Ok(AcquireOutcome::Busy) => responded += 1,
                Err(err) => {
                    counter!("hotdrop_node_errors_total", "node" => self.nodes[index].id().to_string())
                        .increment(1);
                    tracing::debug!(resource = name, node = self.nodes[index].id(), error = %err,
                        "Node failed during quorum acquisition");
                }
            }
        }

        let elapsed = started.elapsed();
        let budget = ttl.saturating_sub(self.drift(ttl));
        let validity = budget.saturating_sub(elapsed);

        if granted.len() >= self.quorum() && validity > Duration::ZERO {
            counter!("hotdrop_lock_acquire_total", "strategy" => "quorum", "outcome" => "held")
                .increment(1);
            histogram!("hotdrop_lock_acquire_duration_seconds").record(elapsed.as_secs_f64());
            histogram!("hotdrop_lock_validity_seconds").record(validity.as_secs_f64());
            tracing::debug!(
                resource = name,
                %token,
                grants = granted.len(),
                validity_ms = validity.as_millis(),
                "Quorum lock held"
            );
            return LockOutcome::Held(LockGrant {
                token,
                acquired_at: started,
                deadline: started + validity,
                granted_nodes: granted,
            });
        }

        // Failed round: purge whatever partial state this attempt created.
        if !granted.is_empty() {
            let purge = granted
                .iter()
                .map(|&index| self.release_on_node(index, name, &token));
            join_all(purge).await;
        }

        if responded < self.quorum() {
            // Too few nodes are even reachable for any round to succeed:
            // a service-level failure, not contention.
            counter!("hotdrop_lock_acquire_total", "strategy" => "quorum", "outcome" => "unavailable")
                .increment(1);
            tracing::warn!(
                resource = name,
                responded,
                quorum = self.quorum(),
                "Fewer than a quorum of nodes responded"
            );
            LockOutcome::Unavailable
        } else {
            counter!("hotdrop_lock_acquire_total", "strategy" => "quorum", "outcome" => "busy")
                .increment(1);
            tracing::debug!(
                resource = name,
                grants = granted.len(),
                quorum = self.quorum(),
                validity_ms = validity.as_millis(),
                "Quorum not reached"
            );
            LockOutcome::Busy
        }
    }

    /// Release `name` under `token` on **every** configured node.
    ///
    /// Not just the granted ones: a node may have granted the lock while
    /// its reply was lost, so the caller's view of the granted set can be
    /// incomplete. Each node gets a bounded number of attempts; the TTL
    /// guarantees eventual cleanup for nodes that stay unreachable.
    pub async fn release(&self, name: &str, token: &LockToken) {
        let releases = (0..self.nodes.len()).map(|index| self.release_on_node(index, name, token));
        join_all(releases).await;
    }

    async fn release_on_node(&self, index: usize, name: &str, token: &LockToken) {
        let node = &self.nodes[index];
        for attempt in 0..RELEASE_ATTEMPTS {
            match node.release(name, token).await {
                Ok(ReleaseOutcome::Released | ReleaseOutcome::NotHeld) => return,
                Err(err) if attempt + 1 < RELEASE_ATTEMPTS => {
                    tracing::debug!(node = node.id(), resource = name, error = %err,
                        "Release attempt failed, retrying");
                }
                Err(err) => {
                    tracing::warn!(node = node.id(), resource = name, error = %err,
                        "Release failed; TTL will reclaim the record");
                }
            }
        }
    }

    /// Refresh the TTL of `name` under `token` on every configured node.
    ///
    /// Quorum rules identical to acquisition: the extension holds iff at
    /// least Q nodes refreshed and the recomputed validity is positive.
    pub async fn extend(&self, name: &str, token: &LockToken, ttl: Duration) -> LockOutcome {
        let started = Instant::now();

        let attempts = self
            .nodes
            .iter()
            .map(|node| async { node.extend(name, token, ttl).await });
        let results = join_all(attempts).await;

        let mut granted = Vec::new();
        for (index, result) in results.iter().enumerate() {
            if matches!(result, Ok(ExtendOutcome::Extended)) {
                granted.push(index);
            }
        }

        let elapsed = started.elapsed();
        let validity = ttl.saturating_sub(self.drift(ttl)).saturating_sub(elapsed);

        if granted.len() >= self.quorum() && validity > Duration::ZERO {
            LockOutcome::Held(LockGrant {
                token: token.clone(),
                acquired_at: started,
                deadline: started + validity,
                granted_nodes: granted,
            })
        } else {
            LockOutcome::Busy
        }
    }
}
