//! The persistence collaborator seam.
//!
//! The coordinator never writes to the durable store directly; it goes
//! through this trait. The durable store is the ground truth for how many
//! units were actually sold — node counters are an admission cache that
//! must remain reconcilable from it.

use crate::error::StoreError;
use crate::types::{Product, ProductId, Purchase, UserId};
use std::future::Future;

/// A purchase about to be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPurchase {
    /// Buyer.
    pub user_id: UserId,
    /// Product bought.
    pub product_id: ProductId,
    /// Units bought.
    pub quantity: u32,
    /// Total price in cents.
    pub total_price_cents: i64,
}

/// Durable storage for products and purchases.
pub trait PurchaseStore: Send + Sync {
    /// Look up a product, `None` when unknown.
    fn get_product(
        &self,
        id: ProductId,
    ) -> impl Future<Output = Result<Option<Product>, StoreError>> + Send;

    /// Record a purchase and set the product's durable stock to
    /// `remaining_units` in one atomic transaction.
    ///
    /// `remaining_units` is the counter value observed after the guarded
    /// decrement, taken while the product lock is still held.
    fn record_purchase(
        &self,
        purchase: NewPurchase,
        remaining_units: u64,
    ) -> impl Future<Output = Result<Purchase, StoreError>> + Send;

    /// Read the durable stock counter, `None` when the product is unknown.
    fn durable_stock(
        &self,
        id: ProductId,
    ) -> impl Future<Output = Result<Option<u64>, StoreError>> + Send;

    /// Create a product with an initial durable stock.
    fn create_product(
        &self,
        name: &str,
        price_cents: i64,
        stock: u64,
    ) -> impl Future<Output = Result<Product, StoreError>> + Send;
}
