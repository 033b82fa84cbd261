//! The coordination-node seam.
//!
//! A coordination node is an independent server providing two primitives:
//! an integer stock counter with atomic guarded decrement, and a lock key
//! with create-if-absent-with-expiry plus server-side compare-and-delete.
//! The quorum lock runs over a set of such nodes; the nodes themselves are
//! never replicated or coordinated with each other.
//!
//! # Implementations
//!
//! - `RedisNode` (in `hotdrop-engine`): production implementation backed
//!   by Redis Lua scripts
//! - `MemoryNode` (in `hotdrop-testing`): deterministic in-memory fake
//!   with fault injection

use crate::error::NodeError;
use crate::types::LockToken;
use std::future::Future;
use std::time::Duration;

/// Outcome of a guarded decrement on one node.
///
/// `Missing` and `Insufficient` are distinct on purpose: a missing counter
/// means the product was never seeded on this node, while an insufficient
/// counter is an admission refusal. Collapsing them is a latent safety bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecrementOutcome {
    /// The counter was decremented; carries the new value.
    Applied(u64),
    /// The counter was left untouched; carries the available value.
    Insufficient(u64),
    /// The counter does not exist on this node.
    Missing,
}

/// Outcome of a compensating increment on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompensateOutcome {
    /// The counter was incremented; carries the new value.
    Applied(u64),
    /// The counter does not exist; nothing was written. Compensation must
    /// never turn a missing key into a positive counter.
    Missing,
}

/// Outcome of a lock acquisition attempt on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The lock record was created under the caller's token.
    Acquired,
    /// Another holder's record exists.
    Busy,
}

/// Outcome of a lock release on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The record existed under the presented token and was deleted.
    Released,
    /// No record under the presented token (expired, or held by a
    /// successor). Nothing was deleted.
    NotHeld,
}

/// Outcome of a TTL extension on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendOutcome {
    /// The record's TTL was refreshed.
    Extended,
    /// No record under the presented token; TTL unchanged.
    NotHeld,
}

/// One coordination node.
///
/// Every operation is atomic with respect to concurrent operations on the
/// same key on the same node. None of them block on contention: contention
/// is reported as [`AcquireOutcome::Busy`] and retried by the coordinator.
///
/// Methods return `impl Future + Send` rather than `async fn` so the trait
/// can be used behind generic engine types whose futures must be `Send`.
pub trait CoordinationNode: Send + Sync {
    /// A stable identifier for logs and metrics (e.g. `host:port`).
    fn id(&self) -> &str;

    /// Atomically decrement `key` by `quantity` iff the counter exists and
    /// holds at least `quantity`.
    fn try_decrement(
        &self,
        key: &str,
        quantity: u32,
    ) -> impl Future<Output = Result<DecrementOutcome, NodeError>> + Send;

    /// Atomically increment `key` by `quantity` to undo a prior decrement.
    ///
    /// A no-op reported as [`CompensateOutcome::Missing`] when the key is
    /// absent.
    fn compensate(
        &self,
        key: &str,
        quantity: u32,
    ) -> impl Future<Output = Result<CompensateOutcome, NodeError>> + Send;

    /// Create the stock counter iff absent (seed). Returns `true` when
    /// this call created the key.
    fn seed_stock(
        &self,
        key: &str,
        quantity: u64,
    ) -> impl Future<Output = Result<bool, NodeError>> + Send;

    /// Unconditionally overwrite the stock counter. Used only by
    /// reconciliation, which aligns node state to the durable counter.
    fn write_stock(
        &self,
        key: &str,
        quantity: u64,
    ) -> impl Future<Output = Result<(), NodeError>> + Send;

    /// Read the current stock counter, `None` when absent.
    fn read_stock(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<u64>, NodeError>> + Send;

    /// Create the lock record `name → token` iff absent, with `ttl` set
    /// atomically with the create.
    fn acquire(
        &self,
        name: &str,
        token: &LockToken,
        ttl: Duration,
    ) -> impl Future<Output = Result<AcquireOutcome, NodeError>> + Send;

    /// Delete the lock record iff it still holds `token`
    /// (compare-and-delete; never a plain delete).
    fn release(
        &self,
        name: &str,
        token: &LockToken,
    ) -> impl Future<Output = Result<ReleaseOutcome, NodeError>> + Send;

    /// Refresh the lock record's TTL iff it still holds `token`.
    fn extend(
        &self,
        name: &str,
        token: &LockToken,
        ttl: Duration,
    ) -> impl Future<Output = Result<ExtendOutcome, NodeError>> + Send;
}
