//! # hotdrop Testing
//!
//! Deterministic fakes for the hotdrop engine's two seams:
//!
//! - [`MemoryNode`]: an in-memory coordination node mirroring the Redis
//!   script semantics, with TTL handling and fault injection (node down,
//!   lost decrement replies)
//! - [`MockPurchaseStore`]: an in-memory purchase store with
//!   deterministic and probabilistic failure injection
//!
//! Engine unit and integration tests run entirely against these fakes;
//! the Redis- and Postgres-backed tests are marked `#[ignore]` and need
//! live services.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod memory_node;
pub mod mock_store;

pub use memory_node::MemoryNode;
pub use mock_store::MockPurchaseStore;
