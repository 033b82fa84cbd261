//! Domain types shared by the engine and its collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

/// Identifier of a product under sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProductId(pub i64);

impl ProductId {
    /// Create a product id from its numeric value.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// The stock counter key for this product on a coordination node.
    #[must_use]
    pub fn stock_key(&self) -> String {
        format!("stock:{}", self.0)
    }

    /// The lock name guarding this product's stock.
    #[must_use]
    pub fn lock_name(&self) -> String {
        format!("lock:stock:{}", self.0)
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a buyer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl UserId {
    /// Create a user id from its numeric value.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A token bound to exactly one lock acquisition attempt.
///
/// Generated fresh (UUID v4) for every acquisition and never reused, so a
/// holder that lost its lock cannot delete a successor's lock record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(Uuid);

impl LockToken {
    /// Generate a fresh token.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A product as known to the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Product identifier.
    pub id: ProductId,
    /// Display name.
    pub name: String,
    /// Unit price in cents.
    pub price_cents: i64,
    /// Durable stock counter (units still available according to the
    /// relational store, the ground truth for "how much was actually sold").
    pub stock: u64,
}

/// A persisted purchase record — the receipt returned on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchase {
    /// Receipt identifier.
    pub id: Uuid,
    /// Buyer.
    pub user_id: UserId,
    /// Product bought.
    pub product_id: ProductId,
    /// Units bought.
    pub quantity: u32,
    /// Total price in cents (unit price × quantity at purchase time).
    pub total_price_cents: i64,
    /// Wall-clock instant the purchase was recorded.
    pub created_at: DateTime<Utc>,
}

/// The in-flight state of one reservation attempt.
///
/// Owned exclusively by the coordinator for the duration of the critical
/// section; dropped on exit (success or failure). Never persisted.
#[derive(Debug, Clone)]
pub struct Reservation {
    /// Buyer making the reservation.
    pub actor: UserId,
    /// Product being reserved.
    pub product: ProductId,
    /// Units requested.
    pub quantity: u32,
    /// Token under which the lock is held.
    pub token: LockToken,
    /// Indexes of the nodes that granted the lock.
    pub granted_nodes: Vec<usize>,
    /// Indexes of the nodes on which the decrement was applied.
    pub decremented_nodes: Vec<usize>,
    /// Monotonic instant the lock was acquired.
    pub acquired_at: Instant,
    /// Monotonic instant past which the lock must no longer be trusted.
    pub deadline: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_keys() {
        let id = ProductId::new(42);
        assert_eq!(id.stock_key(), "stock:42");
        assert_eq!(id.lock_name(), "lock:stock:42");
    }

    #[test]
    fn lock_tokens_are_unique() {
        let a = LockToken::new();
        let b = LockToken::new();
        assert_ne!(a, b);
    }

    #[test]
    fn product_ids_order_canonically() {
        let mut ids = vec![ProductId::new(3), ProductId::new(1), ProductId::new(2)];
        ids.sort();
        assert_eq!(ids, vec![ProductId::new(1), ProductId::new(2), ProductId::new(3)]);
    }
}
