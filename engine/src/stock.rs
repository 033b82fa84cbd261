//! Stock seeding and quorum reads across coordination nodes.
//!
//! Stock counters are created when a product is provisioned, mirroring the
//! durable counter onto every configured node, and are mutated afterwards
//! only through the guarded decrement and the compensating increment.

use futures::future::join_all;
use hotdrop_core::node::CoordinationNode;
use hotdrop_core::types::ProductId;
use std::collections::HashMap;
use std::sync::Arc;

/// Result of seeding a product's stock onto the node set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedOutcome {
    /// Nodes on which the counter was created by this call.
    pub created: usize,
    /// Nodes on which a counter already existed (left untouched).
    pub already_present: usize,
    /// Nodes that failed to reply.
    pub failed: usize,
}

impl SeedOutcome {
    /// Seeding succeeded iff at least `quorum` nodes now hold the counter.
    #[must_use]
    pub const fn reached(&self, quorum: usize) -> bool {
        self.created + self.already_present >= quorum
    }
}

/// Read/seed operations over the full node set.
pub struct StockView<N> {
    nodes: Vec<Arc<N>>,
}

impl<N: CoordinationNode> StockView<N> {
    /// Create a view over the configured nodes.
    #[must_use]
    pub const fn new(nodes: Vec<Arc<N>>) -> Self {
        Self { nodes }
    }

    /// Quorum size for the configured node set.
    #[must_use]
    pub fn quorum(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    /// Seed `quantity` units for `product` on every node, creating the
    /// counter only where it is absent.
    pub async fn seed(&self, product: ProductId, quantity: u64) -> SeedOutcome {
        let key = product.stock_key();
        let seeds = self.nodes.iter().map(|node| {
            let key = key.clone();
            async move { node.seed_stock(&key, quantity).await }
        });
        let results = join_all(seeds).await;

        let mut outcome = SeedOutcome { created: 0, already_present: 0, failed: 0 };
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(true) => outcome.created += 1,
                Ok(false) => outcome.already_present += 1,
                Err(err) => {
                    outcome.failed += 1;
                    tracing::warn!(node = self.nodes[index].id(), %product, error = %err,
                        "Seeding stock failed on node");
                }
            }
        }

        tracing::info!(
            %product,
            quantity,
            created = outcome.created,
            already_present = outcome.already_present,
            failed = outcome.failed,
            "Seeded stock onto coordination nodes"
        );
        outcome
    }

    /// Read the stock counter from every node and return the most frequent
    /// value, provided at least a quorum of nodes replied with one.
    ///
    /// Under healthy operation all nodes agree; after a node failure the
    /// majority value is the meaningful one.
    pub async fn read_quorum(&self, product: ProductId) -> Option<u64> {
        let key = product.stock_key();
        let reads = self.nodes.iter().map(|node| {
            let key = key.clone();
            async move { node.read_stock(&key).await }
        });
        let results = join_all(reads).await;

        let mut observed = Vec::new();
        for result in results {
            if let Ok(Some(value)) = result {
                observed.push(value);
            }
        }

        if observed.len() < self.quorum() {
            return None;
        }

        let mut frequency: HashMap<u64, usize> = HashMap::new();
        for value in &observed {
            *frequency.entry(*value).or_insert(0) += 1;
        }
        frequency
            .into_iter()
            .max_by_key(|&(value, count)| (count, std::cmp::Reverse(value)))
            .map(|(value, _)| value)
    }

    /// Read the stock counter from a single node (the primary), `None`
    /// when absent or unreachable.
    pub async fn read_primary(&self, product: ProductId) -> Option<u64> {
        let node = self.nodes.first()?;
        node.read_stock(&product.stock_key()).await.ok().flatten()
    }
}
