//! # hotdrop Engine
//!
//! The concurrent stock-reservation engine for flash-sale workloads.
//!
//! Given an initial stock N, the number of successfully fulfilled purchase
//! units summed over all clients never exceeds N — regardless of
//! concurrency, process crashes, or single-node failures in the
//! coordination layer.
//!
//! # Components
//!
//! - [`redis_node::RedisNode`]: one coordination node, backed by Redis
//!   Lua scripts for the atomic guarded decrement and the
//!   compare-and-delete lock primitives
//! - [`lock::SingleNodeLock`]: a named mutex on one node (set-if-absent
//!   with TTL, token-checked release)
//! - [`redlock::QuorumLock`]: a lock held iff a strict majority of N
//!   independent nodes grant it within a bounded window, with clock-drift
//!   compensated validity
//! - [`coordinator::ReservationCoordinator`]: orchestrates
//!   `acquire → decrement → persist → release` per reservation, with a
//!   rollback path for every failure step
//! - [`reconcile::Reconciler`]: re-aligns node stock counters from the
//!   durable counter when compensation falls short
//!
//! # Example
//!
//! ```no_run
//! use hotdrop_core::{Config, ProductId, UserId};
//! use hotdrop_engine::coordinator::ReservationCoordinator;
//! use hotdrop_engine::reconcile::ReconciliationQueue;
//! use hotdrop_engine::redis_node::RedisNode;
//! use hotdrop_postgres::PostgresStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> hotdrop_core::Result<()> {
//! let config = Config::from_env();
//! let mut nodes = Vec::new();
//! for url in &config.engine.nodes {
//!     nodes.push(Arc::new(RedisNode::connect(url, config.engine.node_timeout()).await?));
//! }
//! let store = Arc::new(PostgresStore::connect(&config.postgres).await?);
//! let (queue, _events) = ReconciliationQueue::new();
//! let coordinator = ReservationCoordinator::new(nodes, store, config.engine, queue);
//!
//! let receipt = coordinator
//!     .reserve(ProductId::new(1), 1, UserId::new(42))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod coordinator;
pub mod lock;
pub mod metrics;
pub mod reconcile;
pub mod redis_node;
pub mod redlock;
pub mod retry;
pub mod stock;

pub use coordinator::ReservationCoordinator;
pub use lock::{LockGrant, LockOutcome, SingleNodeLock};
pub use redis_node::RedisNode;
pub use redlock::QuorumLock;
pub use retry::RetryPolicy;
