//! Error taxonomy for reservation operations.

use crate::types::ProductId;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced to callers of the reservation engine.
///
/// `Busy` and `InsufficientStock` are normal outcomes under contention;
/// `Inconsistent` is retryable after a short delay; `Unavailable` is a
/// service-level failure (no coordination node reachable).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Unknown product.
    #[error("Product {0} not found")]
    NotFound(ProductId),

    /// Stock observed below the requested quantity. Terminal for the item.
    #[error("Insufficient stock for product {product}: requested {requested}, available {available}")]
    InsufficientStock {
        /// Product whose stock ran out.
        product: ProductId,
        /// Units requested.
        requested: u32,
        /// Units observed available.
        available: u64,
    },

    /// Lock contention; no state changed. The caller may retry.
    #[error("Resource busy: {resource}")]
    Busy {
        /// The contended lock name.
        resource: String,
    },

    /// Requested quantity was zero.
    #[error("Requested quantity must be positive")]
    InvalidQuantity,

    /// Partial cross-node state was detected and compensated as far as
    /// possible; a reconciliation has been scheduled for the product.
    #[error("Inconsistent cross-node state for product {product}")]
    Inconsistent {
        /// Product whose node counters diverged.
        product: ProductId,
    },

    /// No coordination node (or fewer than a quorum) is reachable.
    #[error("Coordination nodes unavailable")]
    Unavailable,

    /// Authentication failure passed through from the auth collaborator.
    #[error("Unauthorized")]
    Unauthorized,

    /// The persistence collaborator failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A coordination-node transport failure that could not be classified.
    #[error("Coordination node error: {0}")]
    Node(#[from] NodeError),
}

impl EngineError {
    /// Returns `true` if the caller may retry the operation as-is.
    ///
    /// `InsufficientStock` is deliberately not retryable: the stock is
    /// gone for that item.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Busy { .. } | Self::Inconsistent { .. } | Self::Unavailable | Self::Node(_)
        )
    }

    /// Returns `true` if this error is attributable to the request rather
    /// than to the service.
    #[must_use]
    pub const fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::InsufficientStock { .. }
                | Self::InvalidQuantity
                | Self::Unauthorized
        )
    }
}

/// Transport-level failure talking to a single coordination node.
///
/// A `NodeError` during a quorum round counts as a per-node failure and
/// does not abort the round. A `NodeError` during `try_decrement` is
/// ambiguous: the decrement may have been applied, so the caller must
/// re-read or compensate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// The per-node RPC timeout elapsed.
    #[error("Node {node} timed out")]
    Timeout {
        /// Identifier of the node that timed out.
        node: String,
    },

    /// Connection or protocol failure.
    #[error("Node {node} transport error: {message}")]
    Transport {
        /// Identifier of the failing node.
        node: String,
        /// Underlying driver message.
        message: String,
    },

    /// The node replied with something the scripts never produce.
    #[error("Node {node} unexpected reply: {message}")]
    UnexpectedReply {
        /// Identifier of the node.
        node: String,
        /// Description of the reply.
        message: String,
    },
}

/// Failure in the persistence collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Database connection or query failed.
    #[error("Database error: {0}")]
    Database(String),

    /// A uniqueness or integrity constraint was violated.
    #[error("Constraint violation: {0}")]
    Constraint(String),
}
