//! # hotdrop Core
//!
//! Domain types and seams for the hotdrop stock-reservation engine.
//!
//! This crate defines:
//! - Domain types (`ProductId`, `Product`, `Purchase`, `Reservation`)
//! - The error taxonomy surfaced to callers of the engine
//! - Configuration loaded from environment variables
//! - The [`node::CoordinationNode`] seam implemented by Redis in
//!   `hotdrop-engine` and by an in-memory fake in `hotdrop-testing`
//! - The [`store::PurchaseStore`] seam implemented by PostgreSQL in
//!   `hotdrop-postgres`
//!
//! The engine itself (locks, quorum, coordinator) lives in `hotdrop-engine`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod node;
pub mod store;
pub mod types;

pub use config::Config;
pub use error::{EngineError, NodeError, Result, StoreError};
pub use types::{LockToken, Product, ProductId, Purchase, Reservation, UserId};
