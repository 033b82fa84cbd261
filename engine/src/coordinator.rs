//! Reservation coordinator.
//!
//! Orchestrates one reservation end to end:
//!
//! 1. Resolve the product and validate the quantity
//! 2. Acquire the configured lock (single-node or quorum) with retry and
//!    jittered backoff
//! 3. Run the guarded decrement (replayed across the granted nodes under
//!    quorum)
//! 4. Persist the purchase and the durable stock in one transaction
//! 5. Release the lock — on every exit path
//!
//! Every failure after a successful decrement triggers a compensating
//! increment on each decremented node; compensation that still fails
//! schedules a reconciliation against the durable counter, which is the
//! ground truth for how much was actually sold.
//!
//! No step may run past `deadline - safety_margin`: past that point the
//! lock can no longer be trusted (a successor may hold it), so the
//! coordinator aborts and rolls back rather than write a purchase record.

use crate::lock::{LockGrant, LockOutcome, SingleNodeLock};
use crate::reconcile::{ReconcileReason, ReconciliationQueue};
use crate::redlock::QuorumLock;
use crate::retry::{retry_with_predicate, RetryPolicy};
use crate::stock::{SeedOutcome, StockView};
use futures::future::join_all;
use hotdrop_core::config::EngineConfig;
use hotdrop_core::error::{EngineError, Result};
use hotdrop_core::node::{CompensateOutcome, CoordinationNode, DecrementOutcome};
use hotdrop_core::store::{NewPurchase, PurchaseStore};
use hotdrop_core::types::{LockToken, Product, ProductId, Purchase, Reservation, UserId};
use metrics::{counter, gauge, histogram};
use std::sync::Arc;
use std::time::Instant;

/// Coordinates reservations over a node set and a durable store.
///
/// One instance serves many concurrent reservations; it holds no mutable
/// state of its own beyond the connection handles inside the nodes.
pub struct ReservationCoordinator<N, S> {
    nodes: Vec<Arc<N>>,
    store: Arc<S>,
    config: EngineConfig,
    retry: RetryPolicy,
    quorum: QuorumLock<N>,
    reconcile: ReconciliationQueue,
}

impl<N, S> ReservationCoordinator<N, S>
where
    N: CoordinationNode + 'static,
    S: PurchaseStore,
{
    /// Create a coordinator over the configured nodes and store.
    ///
    /// `config` should have passed [`EngineConfig::validate`] at startup.
    #[must_use]
    pub fn new(
        nodes: Vec<Arc<N>>,
        store: Arc<S>,
        config: EngineConfig,
        reconcile: ReconciliationQueue,
    ) -> Self {
        gauge!("hotdrop_nodes_configured").set(nodes.len() as f64);
        let retry = RetryPolicy::from_config(&config);
        let quorum = QuorumLock::new(nodes.clone(), &config);
        Self { nodes, store, config, retry, quorum, reconcile }
    }

    /// A read/seed view over this coordinator's node set.
    #[must_use]
    pub fn stock(&self) -> StockView<N> {
        StockView::new(self.nodes.clone())
    }

    /// Mirror the durable stock for `product` onto every configured node,
    /// creating counters only where absent.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotFound`] when the durable store does not know
    ///   the product
    /// - [`EngineError::Unavailable`] when fewer than a quorum of nodes
    ///   hold the counter afterwards
    pub async fn seed_stock(&self, product: ProductId) -> Result<SeedOutcome> {
        let durable = self
            .store
            .durable_stock(product)
            .await?
            .ok_or(EngineError::NotFound(product))?;

        let view = self.stock();
        let outcome = view.seed(product, durable).await;
        if outcome.reached(view.quorum()) {
            Ok(outcome)
        } else {
            Err(EngineError::Unavailable)
        }
    }

    /// Reserve `quantity` units of `product` for `actor`.
    ///
    /// Returns the persisted purchase receipt on success. `Busy` and
    /// `InsufficientStock` are the normal contention outcomes; no durable
    /// state is changed on any failure path.
    pub async fn reserve(
        &self,
        product: ProductId,
        quantity: u32,
        actor: UserId,
    ) -> Result<Purchase> {
        let result = self.reserve_inner(product, quantity, actor).await;
        counter!(
            "hotdrop_reservations_total",
            "outcome" => outcome_label(&result),
            "product_id" => product.to_string()
        )
        .increment(1);
        result
    }

    async fn reserve_inner(
        &self,
        product: ProductId,
        quantity: u32,
        actor: UserId,
    ) -> Result<Purchase> {
        if quantity == 0 {
            return Err(EngineError::InvalidQuantity);
        }

        let record = self
            .store
            .get_product(product)
            .await?
            .ok_or(EngineError::NotFound(product))?;

        let lock_name = product.lock_name();
        let grant = self.acquire_with_retry(&lock_name, product).await?;
        let held_at = Instant::now();
        let mut guard =
            ReleaseGuard::arm(self.nodes.clone(), lock_name.clone(), grant.token.clone());

        let result = self.critical_section(&record, quantity, actor, &grant).await;

        self.release_lock(&lock_name, &grant).await;
        guard.disarm();
        histogram!("hotdrop_critical_section_duration_seconds")
            .record(held_at.elapsed().as_secs_f64());

        result
    }

    /// Reserve several products in one call.
    ///
    /// Locks are acquired in ascending product-id order and released in
    /// reverse, so two bundles can never wait on each other cyclically.
    /// Under quorum each product lock is an independent quorum lock; the
    /// critical section runs against the minimum of the per-lock
    /// deadlines. Each item persists its own purchase; on the first
    /// failure the remaining items are skipped and their node decrements
    /// compensated.
    pub async fn reserve_bundle(
        &self,
        items: &[(ProductId, u32)],
        actor: UserId,
    ) -> Result<Vec<Purchase>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        if items.iter().any(|&(_, quantity)| quantity == 0) {
            return Err(EngineError::InvalidQuantity);
        }

        let mut ordered = items.to_vec();
        ordered.sort_by_key(|&(product, _)| product);

        let mut products = Vec::with_capacity(ordered.len());
        for &(id, quantity) in &ordered {
            let product = self
                .store
                .get_product(id)
                .await?
                .ok_or(EngineError::NotFound(id))?;
            products.push((product, quantity));
        }

        // Acquire in canonical (ascending) order.
        let mut grants: Vec<(String, LockGrant)> = Vec::with_capacity(products.len());
        let mut guards: Vec<ReleaseGuard<N>> = Vec::with_capacity(products.len());
        for (product, _) in &products {
            let name = product.id.lock_name();
            match self.acquire_with_retry(&name, product.id).await {
                Ok(grant) => {
                    guards.push(ReleaseGuard::arm(
                        self.nodes.clone(),
                        name.clone(),
                        grant.token.clone(),
                    ));
                    grants.push((name, grant));
                }
                Err(err) => {
                    for (index, (held_name, held_grant)) in grants.iter().enumerate().rev() {
                        self.release_lock(held_name, held_grant).await;
                        guards[index].disarm();
                    }
                    return Err(err);
                }
            }
        }

        // The bundle is only trusted as long as its shortest-lived lock.
        let overall_deadline = grants
            .iter()
            .map(|(_, grant)| grant.deadline)
            .min()
            .unwrap_or_else(Instant::now);

        let mut receipts = Vec::with_capacity(products.len());
        let mut failure = None;
        for (index, (product, quantity)) in products.iter().enumerate() {
            let mut effective = grants[index].1.clone();
            effective.deadline = overall_deadline;
            match self.critical_section(product, *quantity, actor, &effective).await {
                Ok(receipt) => receipts.push(receipt),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        // Release in reverse acquire order.
        for (index, (name, grant)) in grants.iter().enumerate().rev() {
            self.release_lock(name, grant).await;
            guards[index].disarm();
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(receipts),
        }
    }

    // ───────────────────────── lock handling ─────────────────────────

    async fn acquire_once(&self, name: &str) -> LockOutcome {
        if self.config.use_quorum {
            self.quorum.acquire(name, self.config.lock_ttl()).await
        } else {
            match self.nodes.first() {
                Some(node) => {
                    SingleNodeLock::new(Arc::clone(node))
                        .acquire(name, self.config.lock_ttl())
                        .await
                }
                None => LockOutcome::Unavailable,
            }
        }
    }

    async fn acquire_with_retry(&self, name: &str, product: ProductId) -> Result<LockGrant> {
        let mut attempt = 0;
        loop {
            let unavailable = match self.acquire_once(name).await {
                LockOutcome::Held(grant) => return Ok(grant),
                LockOutcome::Busy => {
                    counter!("hotdrop_lock_contention_total", "product_id" => product.to_string())
                        .increment(1);
                    false
                }
                LockOutcome::Unavailable => true,
            };

            if !self.retry.should_retry(attempt) {
                return Err(if unavailable {
                    EngineError::Unavailable
                } else {
                    EngineError::Busy { resource: name.to_string() }
                });
            }

            let delay = self.retry.delay_for_attempt(attempt);
            tracing::debug!(
                resource = name,
                attempt,
                delay_ms = delay.as_millis(),
                "Lock unavailable, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn release_lock(&self, name: &str, grant: &LockGrant) {
        if self.config.use_quorum {
            self.quorum.release(name, &grant.token).await;
        } else if let Some(node) = self.nodes.first() {
            let lock = SingleNodeLock::new(Arc::clone(node));
            if let Err(err) = lock.release(name, &grant.token).await {
                tracing::warn!(resource = name, error = %err,
                    "Release failed; TTL will reclaim the lock");
            }
        }
    }

    // ─────────────────────── critical section ───────────────────────

    async fn critical_section(
        &self,
        product: &Product,
        quantity: u32,
        actor: UserId,
        grant: &LockGrant,
    ) -> Result<Purchase> {
        let stock_key = product.id.stock_key();

        let (decremented, remaining) = if self.config.use_quorum {
            self.decrement_quorum(product.id, &stock_key, quantity, &grant.granted_nodes)
                .await?
        } else {
            self.decrement_single(product.id, &stock_key, quantity).await?
        };

        // The in-flight record: owned by this task alone, dropped on exit.
        let reservation = Reservation {
            actor,
            product: product.id,
            quantity,
            token: grant.token.clone(),
            granted_nodes: grant.granted_nodes.clone(),
            decremented_nodes: decremented,
            acquired_at: grant.acquired_at,
            deadline: grant.deadline,
        };

        // The lock may already belong to a successor past the deadline;
        // writing a purchase then would break exactly-stock.
        if Instant::now() + self.config.safety_margin() >= reservation.deadline {
            tracing::warn!(
                product_id = %product.id,
                held_ms = reservation.acquired_at.elapsed().as_millis(),
                "Deadline reached before persist; aborting reservation"
            );
            let compensated = self
                .compensate_nodes(product.id, &stock_key, quantity, &reservation.decremented_nodes)
                .await;
            return Err(if compensated {
                EngineError::Busy { resource: product.id.lock_name() }
            } else {
                EngineError::Inconsistent { product: product.id }
            });
        }

        let purchase = NewPurchase {
            user_id: reservation.actor,
            product_id: reservation.product,
            quantity: reservation.quantity,
            total_price_cents: product.price_cents * i64::from(reservation.quantity),
        };
        match self.store.record_purchase(purchase, remaining).await {
            Ok(receipt) => {
                tracing::info!(
                    product_id = %product.id,
                    user_id = %actor,
                    quantity,
                    remaining,
                    "Reservation fulfilled"
                );
                Ok(receipt)
            }
            Err(err) => {
                tracing::warn!(product_id = %product.id, error = %err,
                    "Persist failed after decrement; compensating");
                self.compensate_nodes(product.id, &stock_key, quantity, &reservation.decremented_nodes)
                    .await;
                Err(EngineError::Store(err))
            }
        }
    }

    async fn decrement_single(
        &self,
        product: ProductId,
        stock_key: &str,
        quantity: u32,
    ) -> Result<(Vec<usize>, u64)> {
        let node = self.nodes.first().ok_or(EngineError::Unavailable)?;
        match node.try_decrement(stock_key, quantity).await {
            Ok(DecrementOutcome::Applied(new)) => Ok((vec![0], new)),
            Ok(DecrementOutcome::Insufficient(available)) => Err(EngineError::InsufficientStock {
                product,
                requested: quantity,
                available,
            }),
            Ok(DecrementOutcome::Missing) => {
                // Durable store knows the product but the node cache does
                // not: divergence, not an unknown product.
                self.reconcile.emit(product, ReconcileReason::CounterMissing, None);
                Err(EngineError::Inconsistent { product })
            }
            Err(err) => {
                // Ambiguous: the decrement may have applied. A blind
                // compensation could mint stock, so leave the counter to
                // the reconciler.
                counter!("hotdrop_node_errors_total", "node" => node.id().to_string()).increment(1);
                tracing::warn!(product_id = %product, error = %err,
                    "Decrement outcome unknown; scheduling reconciliation");
                self.reconcile.emit(product, ReconcileReason::OutcomeUnknown, None);
                Err(EngineError::Inconsistent { product })
            }
        }
    }

    /// Replay the guarded decrement on every node that granted the lock;
    /// success means `Applied` on at least a quorum of the configured set.
    async fn decrement_quorum(
        &self,
        product: ProductId,
        stock_key: &str,
        quantity: u32,
        granted: &[usize],
    ) -> Result<(Vec<usize>, u64)> {
        let attempts = granted.iter().map(|&index| {
            let node = &self.nodes[index];
            async move { (index, node.try_decrement(stock_key, quantity).await) }
        });
        let results = join_all(attempts).await;

        let mut applied = Vec::new();
        let mut applied_values = Vec::new();
        let mut insufficient = 0usize;
        let mut available: Option<u64> = None;
        let mut missing = 0usize;
        for (index, result) in results {
            match result {
                Ok(DecrementOutcome::Applied(new)) => {
                    applied.push(index);
                    applied_values.push(new);
                }
                Ok(DecrementOutcome::Insufficient(observed)) => {
                    insufficient += 1;
                    available = Some(available.map_or(observed, |a| a.min(observed)));
                }
                Ok(DecrementOutcome::Missing) => missing += 1,
                Err(err) => {
                    counter!("hotdrop_node_errors_total", "node" => self.nodes[index].id().to_string())
                        .increment(1);
                    tracing::debug!(node = self.nodes[index].id(), product_id = %product,
                        error = %err, "Decrement failed on node");
                }
            }
        }

        let quorum = self.config.quorum();
        if applied.len() >= quorum {
            if applied.len() < granted.len() {
                tracing::warn!(
                    product_id = %product,
                    applied = applied.len(),
                    granted = granted.len(),
                    "Decrement applied on a quorum but not on every granted node"
                );
            }
            // Node values should agree; the minimum is the conservative
            // admission view.
            let remaining = applied_values.iter().min().copied().unwrap_or(0);
            return Ok((applied, remaining));
        }

        // Below quorum: undo the minority that did apply.
        if !applied.is_empty() {
            self.compensate_nodes(product, stock_key, quantity, &applied).await;
        }

        if insufficient >= quorum {
            Err(EngineError::InsufficientStock {
                product,
                requested: quantity,
                available: available.unwrap_or(0),
            })
        } else {
            let reason = if missing >= quorum {
                ReconcileReason::CounterMissing
            } else {
                ReconcileReason::QuorumDiverged
            };
            self.reconcile.emit(product, reason, available);
            Err(EngineError::Inconsistent { product })
        }
    }

    /// Compensate a prior decrement on each of `indexes`, with bounded
    /// retries per node. Returns `true` when every node was compensated.
    async fn compensate_nodes(
        &self,
        product: ProductId,
        stock_key: &str,
        quantity: u32,
        indexes: &[usize],
    ) -> bool {
        let compensations = indexes.iter().map(|&index| {
            let node = Arc::clone(&self.nodes[index]);
            let key = stock_key.to_string();
            async move {
                let outcome = retry_with_predicate(
                    &self.retry,
                    || {
                        let node = Arc::clone(&node);
                        let key = key.clone();
                        async move { node.compensate(&key, quantity).await }
                    },
                    |_| true,
                )
                .await;
                (index, outcome)
            }
        });
        let results = join_all(compensations).await;

        let mut all_applied = true;
        for (index, result) in results {
            match result {
                Ok(CompensateOutcome::Applied(_)) => {
                    counter!(
                        "hotdrop_compensations_total",
                        "product_id" => product.to_string(),
                        "outcome" => "applied"
                    )
                    .increment(1);
                }
                Ok(CompensateOutcome::Missing) => {
                    // The counter existed when we decremented it; its
                    // disappearance is a divergence in its own right.
                    all_applied = false;
                    counter!(
                        "hotdrop_compensations_total",
                        "product_id" => product.to_string(),
                        "outcome" => "missing"
                    )
                    .increment(1);
                    tracing::warn!(node = self.nodes[index].id(), product_id = %product,
                        "Compensation found the counter missing");
                }
                Err(err) => {
                    all_applied = false;
                    counter!(
                        "hotdrop_compensations_total",
                        "product_id" => product.to_string(),
                        "outcome" => "failed"
                    )
                    .increment(1);
                    tracing::warn!(node = self.nodes[index].id(), product_id = %product,
                        error = %err, "Compensation failed after retries");
                }
            }
        }

        if !all_applied {
            self.reconcile
                .emit(product, ReconcileReason::CompensationFailed, None);
        }
        all_applied
    }
}

fn outcome_label(result: &Result<Purchase>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(EngineError::Busy { .. }) => "busy",
        Err(EngineError::InsufficientStock { .. }) => "insufficient",
        Err(EngineError::Inconsistent { .. }) => "inconsistent",
        Err(EngineError::NotFound(_)) => "not_found",
        Err(EngineError::InvalidQuantity) => "invalid_quantity",
        Err(EngineError::Unavailable) => "unavailable",
        Err(_) => "error",
    }
}

/// Backstop that releases the lock when the holding future is cancelled
/// or unwinds.
///
/// Normal exit paths release explicitly and disarm the guard; the guard
/// only acts when dropped armed, spawning a best-effort compare-and-delete
/// on every node. The TTL covers the case where no runtime is available.
struct ReleaseGuard<N: CoordinationNode + 'static> {
    nodes: Vec<Arc<N>>,
    name: String,
    token: LockToken,
    armed: bool,
}

impl<N: CoordinationNode + 'static> ReleaseGuard<N> {
    fn arm(nodes: Vec<Arc<N>>, name: String, token: LockToken) -> Self {
        Self { nodes, name, token, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<N: CoordinationNode + 'static> Drop for ReleaseGuard<N> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let nodes = std::mem::take(&mut self.nodes);
        let name = std::mem::take(&mut self.name);
        let token = self.token.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                for node in nodes {
                    let _ = node.release(&name, &token).await;
                }
            });
        }
    }
}
