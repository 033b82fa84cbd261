//! In-memory purchase store with failure injection.
//!
//! Records purchases and durable stock like the PostgreSQL store, and can
//! be told to fail `record_purchase` deterministically or with a
//! probability, for exercising the coordinator's compensation path.

use chrono::Utc;
use hotdrop_core::error::StoreError;
use hotdrop_core::store::{NewPurchase, PurchaseStore};
use hotdrop_core::types::{Product, ProductId, Purchase};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Default)]
struct StoreState {
    products: HashMap<ProductId, Product>,
    purchases: Vec<Purchase>,
    next_product_id: i64,
    fail_next: u32,
    fail_rate: f64,
}

/// In-memory stand-in for the durable purchase store.
#[derive(Default)]
pub struct MockPurchaseStore {
    state: Mutex<StoreState>,
}

impl MockPurchaseStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a product with a fixed id (test setup).
    pub fn insert_product(&self, id: ProductId, name: &str, price_cents: i64, stock: u64) {
        let mut state = self.lock_state();
        state.products.insert(
            id,
            Product { id, name: name.to_string(), price_cents, stock },
        );
    }

    /// Make the next `count` calls to `record_purchase` fail.
    pub fn fail_next_purchases(&self, count: u32) {
        self.lock_state().fail_next = count;
    }

    /// Make each `record_purchase` fail with the given probability.
    pub fn set_failure_rate(&self, rate: f64) {
        self.lock_state().fail_rate = rate;
    }

    /// Snapshot of all recorded purchases.
    #[must_use]
    pub fn purchases(&self) -> Vec<Purchase> {
        self.lock_state().purchases.clone()
    }

    /// Total units sold for one product.
    #[must_use]
    pub fn units_sold(&self, product: ProductId) -> u64 {
        self.lock_state()
            .purchases
            .iter()
            .filter(|p| p.product_id == product)
            .map(|p| u64::from(p.quantity))
            .sum()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl PurchaseStore for MockPurchaseStore {
    async fn get_product(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self.lock_state().products.get(&id).cloned())
    }

    async fn record_purchase(
        &self,
        purchase: NewPurchase,
        remaining_units: u64,
    ) -> Result<Purchase, StoreError> {
        let mut state = self.lock_state();

        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(StoreError::Database("injected failure".to_string()));
        }
        if state.fail_rate > 0.0 && rand::thread_rng().gen_bool(state.fail_rate) {
            return Err(StoreError::Database("injected random failure".to_string()));
        }

        if !state.products.contains_key(&purchase.product_id) {
            return Err(StoreError::Constraint(format!(
                "unknown product {}",
                purchase.product_id
            )));
        }

        let receipt = Purchase {
            id: Uuid::new_v4(),
            user_id: purchase.user_id,
            product_id: purchase.product_id,
            quantity: purchase.quantity,
            total_price_cents: purchase.total_price_cents,
            created_at: Utc::now(),
        };
        state.purchases.push(receipt.clone());
        if let Some(product) = state.products.get_mut(&purchase.product_id) {
            product.stock = remaining_units;
        }
        Ok(receipt)
    }

    async fn durable_stock(&self, id: ProductId) -> Result<Option<u64>, StoreError> {
        Ok(self.lock_state().products.get(&id).map(|p| p.stock))
    }

    async fn create_product(
        &self,
        name: &str,
        price_cents: i64,
        stock: u64,
    ) -> Result<Product, StoreError> {
        let mut state = self.lock_state();
        state.next_product_id += 1;
        let id = ProductId::new(state.next_product_id);
        let product = Product { id, name: name.to_string(), price_cents, stock };
        state.products.insert(id, product.clone());
        Ok(product)
    }
}
