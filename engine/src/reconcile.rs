//! Reconciliation of node stock counters against the durable counter.
//!
//! The durable store is the source of truth for how many units were
//! actually sold; node counters are an admission cache. When compensation
//! fails or a quorum decrement diverges, the coordinator emits a
//! [`ReconciliationEvent`] keyed by product, and the [`Reconciler`]
//! force-writes the durable counter back onto every node.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use hotdrop_core::error::{EngineError, Result};
use hotdrop_core::node::CoordinationNode;
use hotdrop_core::store::PurchaseStore;
use hotdrop_core::types::ProductId;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Why a product needs reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileReason {
    /// A compensating increment failed after its retries.
    CompensationFailed,
    /// A quorum decrement left the node counters diverged.
    QuorumDiverged,
    /// A node was missing the stock counter for a known product.
    CounterMissing,
    /// A decrement RPC failed mid-flight; it may or may not have applied.
    OutcomeUnknown,
}

/// A request to re-align one product's node counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationEvent {
    /// Product whose counters diverged.
    pub product_id: ProductId,
    /// What went wrong.
    pub reason: ReconcileReason,
    /// Node-side stock observed at emission time, when known.
    pub observed: Option<u64>,
    /// Wall-clock emission instant.
    pub at: DateTime<Utc>,
}

/// Sender half used by the coordinator to schedule reconciliations.
#[derive(Clone)]
pub struct ReconciliationQueue {
    tx: mpsc::UnboundedSender<ReconciliationEvent>,
}

impl ReconciliationQueue {
    /// Create a queue, returning the receiver for a reconciler task.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReconciliationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit a reconciliation request.
    ///
    /// Never fails: when no reconciler is attached the event is still
    /// logged, and the durable counter remains authoritative.
    pub fn emit(&self, product_id: ProductId, reason: ReconcileReason, observed: Option<u64>) {
        let event = ReconciliationEvent { product_id, reason, observed, at: Utc::now() };
        counter!("hotdrop_reconciliations_total", "product_id" => product_id.to_string())
            .increment(1);
        tracing::warn!(
            product_id = %event.product_id,
            reason = ?event.reason,
            observed = ?event.observed,
            "Scheduled stock reconciliation"
        );
        if self.tx.send(event).is_err() {
            tracing::warn!("No reconciler attached; event dropped after logging");
        }
    }
}

/// Aligns node stock counters to the durable counter.
pub struct Reconciler<N, S> {
    nodes: Vec<Arc<N>>,
    store: Arc<S>,
}

impl<N, S> Reconciler<N, S>
where
    N: CoordinationNode,
    S: PurchaseStore,
{
    /// Create a reconciler over the configured nodes and durable store.
    #[must_use]
    pub const fn new(nodes: Vec<Arc<N>>, store: Arc<S>) -> Self {
        Self { nodes, store }
    }

    /// Force-write the durable stock counter for `product` onto every
    /// node. Returns the durable value written.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] when the durable store does not
    /// know the product, or the store error itself when the read fails.
    pub async fn reconcile(&self, product: ProductId) -> Result<u64> {
        let durable = self
            .store
            .durable_stock(product)
            .await?
            .ok_or(EngineError::NotFound(product))?;

        let key = product.stock_key();
        let writes = self.nodes.iter().map(|node| {
            let key = key.clone();
            async move { node.write_stock(&key, durable).await }
        });
        let results = join_all(writes).await;

        let mut aligned = 0usize;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(()) => aligned += 1,
                Err(err) => {
                    tracing::warn!(node = self.nodes[index].id(), %product, error = %err,
                        "Reconciliation write failed on node");
                }
            }
        }

        tracing::info!(%product, durable, aligned, total = self.nodes.len(),
            "Reconciled node stock from durable counter");
        Ok(durable)
    }

    /// Drain reconciliation events until the queue closes.
    ///
    /// Intended to be spawned as a background task alongside the
    /// coordinator.
    pub async fn run(&self, mut rx: mpsc::UnboundedReceiver<ReconciliationEvent>) {
        while let Some(event) = rx.recv().await {
            if let Err(err) = self.reconcile(event.product_id).await {
                tracing::error!(product_id = %event.product_id, error = %err,
                    "Reconciliation failed; durable counter remains authoritative");
            }
        }
    }
}
