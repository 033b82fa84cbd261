//! End-to-end engine tests against the in-memory coordination node.
//!
//! These cover the no-oversell guarantee under contention, quorum
//! behavior across node failures, compensation after persist failures,
//! and the deadline abort path — all deterministically, without Redis.

use hotdrop_core::config::EngineConfig;
use hotdrop_core::error::EngineError;
use hotdrop_core::node::CoordinationNode;
use hotdrop_core::store::PurchaseStore;
use hotdrop_core::types::{ProductId, Purchase, UserId};
use hotdrop_engine::coordinator::ReservationCoordinator;
use hotdrop_engine::lock::LockOutcome;
use hotdrop_engine::reconcile::{ReconcileReason, ReconciliationEvent, ReconciliationQueue, Reconciler};
use hotdrop_engine::redlock::QuorumLock;
use hotdrop_testing::{MemoryNode, MockPurchaseStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type MemCoordinator = ReservationCoordinator<MemoryNode, MockPurchaseStore>;

struct Harness {
    nodes: Vec<Arc<MemoryNode>>,
    store: Arc<MockPurchaseStore>,
    coordinator: Arc<MemCoordinator>,
    events: mpsc::UnboundedReceiver<ReconciliationEvent>,
}

fn test_config(node_count: usize, use_quorum: bool) -> EngineConfig {
    EngineConfig {
        use_quorum,
        nodes: (0..node_count).map(|i| format!("mem://{i}")).collect(),
        lock_ttl_ms: 1_000,
        node_timeout_ms: 100,
        drift_factor: 0.01,
        drift_floor_ms: 2,
        max_retries: 5,
        base_delay_ms: 1,
        max_delay_ms: 5,
        safety_margin_ms: 50,
    }
}

fn harness_with_config(config: EngineConfig) -> Harness {
    let nodes: Vec<Arc<MemoryNode>> = config
        .nodes
        .iter()
        .map(|id| Arc::new(MemoryNode::new(id.clone())))
        .collect();
    let store = Arc::new(MockPurchaseStore::new());
    let (queue, events) = ReconciliationQueue::new();
    let coordinator = Arc::new(ReservationCoordinator::new(
        nodes.clone(),
        Arc::clone(&store),
        config,
        queue,
    ));
    Harness { nodes, store, coordinator, events }
}

fn harness(node_count: usize, use_quorum: bool) -> Harness {
    harness_with_config(test_config(node_count, use_quorum))
}

/// Provision a product in the durable store and mirror it onto the nodes.
async fn provision(harness: &Harness, product: ProductId, stock: u64) {
    harness.store.insert_product(product, "drop-item", 1_000, stock);
    harness.coordinator.seed_stock(product).await.expect("seeding succeeds");
}

/// Buy one unit, retrying contention until a terminal outcome.
async fn buy_one(
    coordinator: Arc<MemCoordinator>,
    product: ProductId,
    user: i64,
) -> Result<Purchase, EngineError> {
    loop {
        match coordinator.reserve(product, 1, UserId::new(user)).await {
            Err(err) if err.is_retryable() => {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            outcome => return outcome,
        }
    }
}

async fn run_buyers(
    coordinator: &Arc<MemCoordinator>,
    product: ProductId,
    buyers: i64,
) -> Vec<Result<Purchase, EngineError>> {
    let tasks: Vec<_> = (0..buyers)
        .map(|user| tokio::spawn(buy_one(Arc::clone(coordinator), product, user)))
        .collect();

    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        results.push(task.await.expect("buyer task completes"));
    }
    results
}

fn count_outcomes(results: &[Result<Purchase, EngineError>]) -> (usize, usize, usize) {
    let successes = results.iter().filter(|r| r.is_ok()).count();
    let insufficient = results
        .iter()
        .filter(|r| matches!(r, Err(EngineError::InsufficientStock { .. })))
        .count();
    let other = results.len() - successes - insufficient;
    (successes, insufficient, other)
}

// ───────────────────── single-node end to end ─────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn hundred_buyers_hundred_units_all_succeed() {
    let harness = harness(1, false);
    let product = ProductId::new(1);
    provision(&harness, product, 100).await;

    let results = run_buyers(&harness.coordinator, product, 100).await;
    let (successes, insufficient, other) = count_outcomes(&results);

    assert_eq!(successes, 100);
    assert_eq!(insufficient, 0);
    assert_eq!(other, 0);
    assert_eq!(harness.nodes[0].stock(&product.stock_key()), Some(0));
    assert_eq!(harness.store.purchases().len(), 100);
}

#[tokio::test(flavor = "multi_thread")]
async fn oversubscribed_sale_never_oversells() {
    let harness = harness(1, false);
    let product = ProductId::new(1);
    provision(&harness, product, 100).await;

    let results = run_buyers(&harness.coordinator, product, 300).await;
    let (successes, insufficient, other) = count_outcomes(&results);

    assert_eq!(successes, 100);
    assert_eq!(insufficient, 200);
    assert_eq!(other, 0, "no reservation may end Inconsistent in a clean run");
    assert_eq!(harness.nodes[0].stock(&product.stock_key()), Some(0));
    assert_eq!(harness.store.units_sold(product), 100);
}

#[tokio::test]
async fn exact_and_excess_quantities_at_the_boundary() {
    let harness = harness(1, false);
    let product = ProductId::new(1);
    provision(&harness, product, 5).await;

    // One unit more than remaining stock is refused...
    let err = harness
        .coordinator
        .reserve(product, 6, UserId::new(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InsufficientStock { requested: 6, available: 5, .. }
    ));

    // ...while exactly the remaining stock succeeds.
    let receipt = harness
        .coordinator
        .reserve(product, 5, UserId::new(1))
        .await
        .expect("exact remaining stock succeeds");
    assert_eq!(receipt.quantity, 5);
    assert_eq!(harness.nodes[0].stock(&product.stock_key()), Some(0));
}

#[tokio::test]
async fn zero_quantity_and_unknown_product_are_rejected() {
    let harness = harness(1, false);
    let product = ProductId::new(1);
    provision(&harness, product, 5).await;

    assert!(matches!(
        harness.coordinator.reserve(product, 0, UserId::new(1)).await,
        Err(EngineError::InvalidQuantity)
    ));
    assert!(matches!(
        harness.coordinator.reserve(ProductId::new(404), 1, UserId::new(1)).await,
        Err(EngineError::NotFound(_))
    ));
}

// ───────────────────────── quorum end to end ─────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn quorum_sale_drains_every_node_to_zero() {
    let harness = harness(5, true);
    let product = ProductId::new(1);
    provision(&harness, product, 100).await;

    let results = run_buyers(&harness.coordinator, product, 300).await;
    let (successes, insufficient, _) = count_outcomes(&results);

    assert_eq!(successes, 100);
    assert_eq!(insufficient, 200);
    for node in &harness.nodes {
        assert_eq!(node.stock(&product.stock_key()), Some(0));
    }
    assert_eq!(harness.store.units_sold(product), 100);
}

#[tokio::test(flavor = "multi_thread")]
async fn quorum_survives_one_node_dying_mid_sale() {
    let harness = harness(5, true);
    let product = ProductId::new(1);
    provision(&harness, product, 100).await;

    let coordinator = Arc::clone(&harness.coordinator);
    let killer = {
        let node = Arc::clone(&harness.nodes[4]);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            node.set_down(true);
        })
    };

    let results = run_buyers(&coordinator, product, 300).await;
    killer.await.unwrap();
    let (successes, _, _) = count_outcomes(&results);

    // Same correctness as the healthy run: the full stock sells, nothing
    // oversells, and the surviving nodes drain to zero.
    assert_eq!(successes, 100);
    assert_eq!(harness.store.units_sold(product), 100);
    for node in &harness.nodes[..4] {
        assert_eq!(node.stock(&product.stock_key()), Some(0));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn quorum_sale_with_the_minimum_majority_stays_exact() {
    let harness = harness(5, true);
    let product = ProductId::new(1);
    provision(&harness, product, 50).await;

    // Only k+1 of 2k+1 nodes are live from the start; liveness shrinks to
    // the bare majority but exactness must not.
    harness.nodes[0].set_down(true);
    harness.nodes[1].set_down(true);

    let results = run_buyers(&harness.coordinator, product, 120).await;
    let (successes, insufficient, _) = count_outcomes(&results);

    assert_eq!(successes, 50);
    assert_eq!(insufficient, 70);
    assert_eq!(harness.store.units_sold(product), 50);
    for node in &harness.nodes[2..] {
        assert_eq!(node.stock(&product.stock_key()), Some(0));
    }
}

#[tokio::test]
async fn stock_view_reads_the_majority_value() {
    let harness = harness(5, true);
    let product = ProductId::new(1);
    provision(&harness, product, 40).await;

    let view = harness.coordinator.stock();
    assert_eq!(view.read_primary(product).await, Some(40));
    assert_eq!(view.read_quorum(product).await, Some(40));

    // One node drifting does not change the majority view.
    harness.nodes[4].write_stock(&product.stock_key(), 7).await.unwrap();
    assert_eq!(view.read_quorum(product).await, Some(40));

    // With three nodes down, fewer than a quorum reply.
    for node in &harness.nodes[..3] {
        node.set_down(true);
    }
    assert_eq!(view.read_quorum(product).await, None);
}

#[tokio::test]
async fn losing_the_quorum_makes_the_service_unavailable() {
    let harness = harness(5, true);
    let product = ProductId::new(1);
    provision(&harness, product, 100).await;

    for node in &harness.nodes[2..] {
        node.set_down(true);
    }

    let err = harness
        .coordinator
        .reserve(product, 1, UserId::new(1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unavailable));
    assert!(harness.store.purchases().is_empty());

    // The failed rounds must not leave lock records on the live minority.
    for node in &harness.nodes[..2] {
        assert!(!node.holds_lock(&product.lock_name()));
    }
}

#[tokio::test]
async fn lock_held_at_exactly_quorum_and_lost_below_it() {
    let config = test_config(5, true);
    let nodes: Vec<Arc<MemoryNode>> = config
        .nodes
        .iter()
        .map(|id| Arc::new(MemoryNode::new(id.clone())))
        .collect();
    let lock = QuorumLock::new(nodes.clone(), &config);
    let name = "lock:stock:1";

    // Two nodes down: exactly Q = 3 grants, the lock is held.
    nodes[0].set_down(true);
    nodes[1].set_down(true);
    let outcome = lock.acquire(name, Duration::from_secs(1)).await;
    let grant = match outcome {
        LockOutcome::Held(grant) => grant,
        other => panic!("expected Held at exactly quorum, got {other:?}"),
    };
    assert_eq!(grant.granted_nodes.len(), 3);
    lock.release(name, &grant.token).await;

    // Three nodes down: Q − 1 grants, the round fails and purges.
    nodes[2].set_down(true);
    let outcome = lock.acquire(name, Duration::from_secs(1)).await;
    assert!(matches!(outcome, LockOutcome::Unavailable));
    for node in &nodes[3..] {
        assert!(!node.holds_lock(name));
    }
}

#[tokio::test]
async fn slow_round_exhausts_validity_and_releases() {
    let config = test_config(5, true);
    let nodes: Vec<Arc<MemoryNode>> = config
        .nodes
        .iter()
        .map(|id| Arc::new(MemoryNode::new(id.clone())))
        .collect();
    for node in &nodes {
        node.set_latency(Duration::from_millis(150));
    }
    let lock = QuorumLock::new(nodes.clone(), &config);
    let name = "lock:stock:1";

    // Every node grants, but the round takes longer than the TTL can
    // cover after drift compensation.
    let outcome = lock.acquire(name, Duration::from_millis(100)).await;
    assert!(matches!(outcome, LockOutcome::Busy));
    for node in &nodes {
        assert!(!node.holds_lock(name));
    }
}

// ─────────────────── rollback and reconciliation ───────────────────

#[tokio::test(flavor = "multi_thread")]
async fn persist_failures_are_compensated() {
    let harness = harness(1, false);
    let product = ProductId::new(1);
    provision(&harness, product, 100).await;
    harness.store.set_failure_rate(0.1);

    let results = run_buyers(&harness.coordinator, product, 100).await;
    let successes = results.iter().filter(|r| r.is_ok()).count() as u64;
    let store_failures = results
        .iter()
        .filter(|r| matches!(r, Err(EngineError::Store(_))))
        .count() as u64;

    assert_eq!(successes + store_failures, 100);
    assert_eq!(harness.store.units_sold(product), successes);

    // Every failed persist was compensated: units sold plus units still
    // on the node account for the full initial stock.
    let node_stock = harness.nodes[0].stock(&product.stock_key()).unwrap();
    assert_eq!(node_stock + successes, 100);

    // The durable counter is the ground truth and the node already
    // matches it; reconciliation is a no-op here.
    let durable = harness.store.durable_stock(product).await.unwrap().unwrap();
    assert_eq!(durable, node_stock);
    let reconciler = Reconciler::new(harness.nodes.clone(), Arc::clone(&harness.store));
    let written = reconciler.reconcile(product).await.unwrap();
    assert_eq!(written, durable);
    assert_eq!(harness.nodes[0].stock(&product.stock_key()), Some(durable));
}

#[tokio::test]
async fn ambiguous_decrement_schedules_reconciliation() {
    let mut harness = harness(1, false);
    let product = ProductId::new(1);
    provision(&harness, product, 100).await;

    // The node applies the decrement but the reply is lost in flight.
    harness.nodes[0].inject_decrement_errors(1, true);

    let err = harness
        .coordinator
        .reserve(product, 1, UserId::new(1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Inconsistent { .. }));
    assert!(harness.store.purchases().is_empty());

    let event = harness.events.recv().await.expect("reconciliation scheduled");
    assert_eq!(event.product_id, product);
    assert_eq!(event.reason, ReconcileReason::OutcomeUnknown);

    // Reconciliation re-aligns the node to the durable counter.
    let reconciler = Reconciler::new(harness.nodes.clone(), Arc::clone(&harness.store));
    reconciler.reconcile(product).await.unwrap();
    assert_eq!(harness.nodes[0].stock(&product.stock_key()), Some(100));
}

#[tokio::test]
async fn deadline_overrun_aborts_without_persisting() {
    let config = EngineConfig {
        lock_ttl_ms: 80,
        node_timeout_ms: 8,
        safety_margin_ms: 30,
        max_retries: 0,
        ..test_config(1, false)
    };
    let harness = harness_with_config(config);
    let product = ProductId::new(1);
    provision(&harness, product, 100).await;

    // A decrement slower than the deadline allows: by the time it lands,
    // the lock can no longer be trusted and the purchase must not be
    // written.
    harness.nodes[0].set_latency(Duration::from_millis(60));

    let err = harness
        .coordinator
        .reserve(product, 1, UserId::new(1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Busy { .. }));
    assert!(harness.store.purchases().is_empty());

    // The decrement was rolled back.
    harness.nodes[0].set_latency(Duration::ZERO);
    assert_eq!(harness.nodes[0].stock(&product.stock_key()), Some(100));
}

// ───────────────────────── bundle purchases ─────────────────────────

#[tokio::test]
async fn bundle_reserves_every_item() {
    let harness = harness(1, false);
    let first = ProductId::new(1);
    let second = ProductId::new(2);
    provision(&harness, first, 10).await;
    provision(&harness, second, 10).await;

    // Items given out of canonical order; the coordinator sorts them.
    let receipts = harness
        .coordinator
        .reserve_bundle(&[(second, 3), (first, 2)], UserId::new(1))
        .await
        .expect("bundle succeeds");

    assert_eq!(receipts.len(), 2);
    assert_eq!(receipts[0].product_id, first);
    assert_eq!(receipts[1].product_id, second);
    assert_eq!(harness.nodes[0].stock(&first.stock_key()), Some(8));
    assert_eq!(harness.nodes[0].stock(&second.stock_key()), Some(7));
    assert!(!harness.nodes[0].holds_lock(&first.lock_name()));
    assert!(!harness.nodes[0].holds_lock(&second.lock_name()));
}

#[tokio::test(flavor = "multi_thread")]
async fn opposed_bundles_never_deadlock() {
    let harness = harness(1, false);
    let first = ProductId::new(1);
    let second = ProductId::new(2);
    provision(&harness, first, 100).await;
    provision(&harness, second, 100).await;

    let mut tasks = Vec::new();
    for i in 0..20_i64 {
        let coordinator = Arc::clone(&harness.coordinator);
        // Half the bundles name the products in reverse order; canonical
        // lock ordering keeps them from waiting on each other cyclically.
        let items = if i % 2 == 0 {
            vec![(first, 1), (second, 1)]
        } else {
            vec![(second, 1), (first, 1)]
        };
        tasks.push(tokio::spawn(async move {
            loop {
                match coordinator.reserve_bundle(&items, UserId::new(i)).await {
                    Err(err) if err.is_retryable() => {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    }
                    outcome => return outcome,
                }
            }
        }));
    }

    let mut successes = 0_u64;
    for task in tasks {
        if task.await.expect("bundle task completes").is_ok() {
            successes += 1;
        }
    }

    assert_eq!(successes, 20);
    assert_eq!(harness.nodes[0].stock(&first.stock_key()), Some(80));
    assert_eq!(harness.nodes[0].stock(&second.stock_key()), Some(80));
}

#[tokio::test]
async fn bundle_stops_at_the_first_insufficient_item() {
    let harness = harness(1, false);
    let first = ProductId::new(1);
    let second = ProductId::new(2);
    provision(&harness, first, 10).await;
    provision(&harness, second, 1).await;

    let err = harness
        .coordinator
        .reserve_bundle(&[(first, 2), (second, 5)], UserId::new(1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientStock { .. }));

    // The first item persisted before the second was refused; the
    // refused item's stock is untouched.
    assert_eq!(harness.nodes[0].stock(&first.stock_key()), Some(8));
    assert_eq!(harness.nodes[0].stock(&second.stock_key()), Some(1));
    assert!(!harness.nodes[0].holds_lock(&first.lock_name()));
    assert!(!harness.nodes[0].holds_lock(&second.lock_name()));
}
