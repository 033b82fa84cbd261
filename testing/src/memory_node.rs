//! In-memory coordination node.
//!
//! Mirrors the Redis node's script semantics one-for-one (guarded
//! decrement, compensating increment that refuses to create a missing
//! counter, compare-and-delete release, compare-and-refresh extend) so
//! engine tests run deterministically without a Redis instance.
//!
//! Lock TTLs are enforced lazily: an expired record is treated as absent
//! by the next operation that touches it, which is also how a TTL behaves
//! from a client's point of view.

use hotdrop_core::error::NodeError;
use hotdrop_core::node::{
    AcquireOutcome, CompensateOutcome, CoordinationNode, DecrementOutcome, ExtendOutcome,
    ReleaseOutcome,
};
use hotdrop_core::types::LockToken;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct LockRecord {
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct NodeState {
    stock: HashMap<String, u64>,
    locks: HashMap<String, LockRecord>,
    /// Pending injected decrement failures.
    decrement_faults: u32,
    /// Whether an injected decrement failure still applies the decrement
    /// (simulating a lost reply after the server-side script ran).
    fault_applies_first: bool,
}

/// Deterministic in-memory stand-in for one coordination node.
pub struct MemoryNode {
    id: String,
    state: Mutex<NodeState>,
    down: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryNode {
    /// Create a node with the given identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(NodeState::default()),
            down: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Simulate the node going down (every RPC fails) or coming back.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Delay lock acquisitions and decrements by `latency`, simulating a
    /// slow network or a paused process.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    /// Inject `count` decrement failures. With `apply_first` the decrement
    /// is applied before the error is returned, simulating a reply lost in
    /// flight after the server already ran the script.
    pub fn inject_decrement_errors(&self, count: u32, apply_first: bool) {
        let mut state = self.lock_state();
        state.decrement_faults = count;
        state.fault_applies_first = apply_first;
    }

    /// Current stock value for `key`, bypassing fault injection.
    #[must_use]
    pub fn stock(&self, key: &str) -> Option<u64> {
        self.lock_state().stock.get(key).copied()
    }

    /// Whether a live (unexpired) lock record exists for `name`.
    #[must_use]
    pub fn holds_lock(&self, name: &str) -> bool {
        let mut state = self.lock_state();
        Self::purge_expired(&mut state, name);
        state.locks.contains_key(name)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check_up(&self) -> Result<(), NodeError> {
        if self.down.load(Ordering::SeqCst) {
            Err(NodeError::Transport {
                node: self.id.clone(),
                message: "node is down".to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn purge_expired(state: &mut NodeState, name: &str) {
        if let Some(record) = state.locks.get(name) {
            if record.expires_at <= Instant::now() {
                state.locks.remove(name);
            }
        }
    }
}

impl CoordinationNode for MemoryNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn try_decrement(&self, key: &str, quantity: u32) -> Result<DecrementOutcome, NodeError> {
        self.check_up()?;
        self.simulate_latency().await;
        let mut state = self.lock_state();

        let faulted = state.decrement_faults > 0;
        if faulted {
            state.decrement_faults -= 1;
        }

        if faulted && !state.fault_applies_first {
            return Err(NodeError::Transport {
                node: self.id.clone(),
                message: "injected decrement failure".to_string(),
            });
        }

        let outcome = match state.stock.get_mut(key) {
            None => DecrementOutcome::Missing,
            Some(current) if *current < u64::from(quantity) => {
                DecrementOutcome::Insufficient(*current)
            }
            Some(current) => {
                *current -= u64::from(quantity);
                DecrementOutcome::Applied(*current)
            }
        };

        if faulted {
            return Err(NodeError::Timeout { node: self.id.clone() });
        }
        Ok(outcome)
    }

    async fn compensate(&self, key: &str, quantity: u32) -> Result<CompensateOutcome, NodeError> {
        self.check_up()?;
        let mut state = self.lock_state();
        match state.stock.get_mut(key) {
            None => Ok(CompensateOutcome::Missing),
            Some(current) => {
                *current += u64::from(quantity);
                Ok(CompensateOutcome::Applied(*current))
            }
        }
    }

    async fn seed_stock(&self, key: &str, quantity: u64) -> Result<bool, NodeError> {
        self.check_up()?;
        let mut state = self.lock_state();
        if state.stock.contains_key(key) {
            Ok(false)
        } else {
            state.stock.insert(key.to_string(), quantity);
            Ok(true)
        }
    }

    async fn write_stock(&self, key: &str, quantity: u64) -> Result<(), NodeError> {
        self.check_up()?;
        self.lock_state().stock.insert(key.to_string(), quantity);
        Ok(())
    }

    async fn read_stock(&self, key: &str) -> Result<Option<u64>, NodeError> {
        self.check_up()?;
        Ok(self.lock_state().stock.get(key).copied())
    }

    async fn acquire(
        &self,
        name: &str,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<AcquireOutcome, NodeError> {
        self.check_up()?;
        self.simulate_latency().await;
        let mut state = self.lock_state();
        Self::purge_expired(&mut state, name);

        if state.locks.contains_key(name) {
            return Ok(AcquireOutcome::Busy);
        }
        state.locks.insert(
            name.to_string(),
            LockRecord { token: token.to_string(), expires_at: Instant::now() + ttl },
        );
        Ok(AcquireOutcome::Acquired)
    }

    async fn release(&self, name: &str, token: &LockToken) -> Result<ReleaseOutcome, NodeError> {
        self.check_up()?;
        let mut state = self.lock_state();
        Self::purge_expired(&mut state, name);

        match state.locks.get(name) {
            Some(record) if record.token == token.to_string() => {
                state.locks.remove(name);
                Ok(ReleaseOutcome::Released)
            }
            _ => Ok(ReleaseOutcome::NotHeld),
        }
    }

    async fn extend(
        &self,
        name: &str,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<ExtendOutcome, NodeError> {
        self.check_up()?;
        let mut state = self.lock_state();
        Self::purge_expired(&mut state, name);

        match state.locks.get_mut(name) {
            Some(record) if record.token == token.to_string() => {
                record.expires_at = Instant::now() + ttl;
                Ok(ExtendOutcome::Extended)
            }
            _ => Ok(ExtendOutcome::NotHeld),
        }
    }
}
