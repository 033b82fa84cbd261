//! Redis-backed coordination node.
//!
//! One [`RedisNode`] wraps one independent Redis server. The stock counter
//! and the lock record both live on the node; every multi-step operation
//! runs as a server-side Lua script so it is atomic with respect to any
//! concurrent client on the same key.
//!
//! # Scripts
//!
//! - **Guarded decrement**: `GET` + compare + `DECRBY`, distinguishing a
//!   missing counter from an insufficient one
//! - **Compensating increment**: `EXISTS` + `INCRBY`, a reported no-op on
//!   a missing counter
//! - **Compare-and-delete**: release only when the stored token matches
//! - **Compare-and-refresh**: `PEXPIRE` only when the stored token matches
//!
//! Every RPC is capped by the per-node timeout; a timeout or transport
//! failure maps to a typed [`NodeError`] and never panics the caller.

use hotdrop_core::error::NodeError;
use hotdrop_core::node::{
    AcquireOutcome, CompensateOutcome, CoordinationNode, DecrementOutcome, ExtendOutcome,
    ReleaseOutcome,
};
use hotdrop_core::types::LockToken;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::future::Future;
use std::time::Duration;

/// Guarded decrement. Returns `{status, value}` where status is `0` on
/// success (value = new counter), `-1` on insufficient stock (value =
/// available), `-2` on a missing counter.
const DECREMENT_SCRIPT: &str = r#"
local current = redis.call("GET", KEYS[1])
if not current then
    return {-2, 0}
end
current = tonumber(current)
local quantity = tonumber(ARGV[1])
if current < quantity then
    return {-1, current}
end
redis.call("DECRBY", KEYS[1], quantity)
return {0, current - quantity}
"#;

/// Compensating increment. Returns `-1` when the counter is absent (the
/// compensation must not create stock from nothing), else the new value.
const COMPENSATE_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 0 then
    return -1
end
return redis.call("INCRBY", KEYS[1], ARGV[1])
"#;

/// Compare-and-delete. Returns `1` when the record held the presented
/// token and was deleted, `0` otherwise.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Compare-and-refresh. Returns `1` when the record held the presented
/// token and its TTL was refreshed, `0` otherwise.
const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// One coordination node backed by a Redis server.
///
/// Connections are pooled through [`ConnectionManager`]; cloning the
/// manager per call multiplexes over the same underlying connection.
#[derive(Clone)]
pub struct RedisNode {
    id: String,
    conn_manager: ConnectionManager,
    node_timeout: Duration,
}

impl RedisNode {
    /// Connect to one Redis node.
    ///
    /// # Arguments
    ///
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `node_timeout` - per-RPC timeout; must be far smaller than the
    ///   lock TTL
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Transport`] if the client cannot be created or
    /// the initial connection fails.
    pub async fn connect(url: &str, node_timeout: Duration) -> Result<Self, NodeError> {
        let client = Client::open(url).map_err(|e| NodeError::Transport {
            node: url.to_string(),
            message: format!("failed to create client: {e}"),
        })?;

        let conn_manager =
            ConnectionManager::new(client)
                .await
                .map_err(|e| NodeError::Transport {
                    node: url.to_string(),
                    message: format!("failed to connect: {e}"),
                })?;

        Ok(Self {
            id: url.to_string(),
            conn_manager,
            node_timeout,
        })
    }

    /// Cap a Redis future with the per-node timeout and map driver errors.
    async fn run<T>(
        &self,
        fut: impl Future<Output = redis::RedisResult<T>> + Send,
    ) -> Result<T, NodeError> {
        match tokio::time::timeout(self.node_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(NodeError::Transport {
                node: self.id.clone(),
                message: e.to_string(),
            }),
            Err(_) => Err(NodeError::Timeout {
                node: self.id.clone(),
            }),
        }
    }
}

impl CoordinationNode for RedisNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn try_decrement(&self, key: &str, quantity: u32) -> Result<DecrementOutcome, NodeError> {
        let mut conn = self.conn_manager.clone();
        let script = Script::new(DECREMENT_SCRIPT);

        let (status, value): (i64, i64) = self
            .run(async move { script.key(key).arg(quantity).invoke_async(&mut conn).await })
            .await?;

        match status {
            0 => Ok(DecrementOutcome::Applied(value.max(0) as u64)),
            -1 => Ok(DecrementOutcome::Insufficient(value.max(0) as u64)),
            -2 => Ok(DecrementOutcome::Missing),
            other => Err(NodeError::UnexpectedReply {
                node: self.id.clone(),
                message: format!("decrement script returned status {other}"),
            }),
        }
    }

    async fn compensate(&self, key: &str, quantity: u32) -> Result<CompensateOutcome, NodeError> {
        let mut conn = self.conn_manager.clone();
        let script = Script::new(COMPENSATE_SCRIPT);

        let value: i64 = self
            .run(async move { script.key(key).arg(quantity).invoke_async(&mut conn).await })
            .await?;

        if value < 0 {
            tracing::warn!(node = %self.id, key, "Compensation hit a missing counter");
            Ok(CompensateOutcome::Missing)
        } else {
            Ok(CompensateOutcome::Applied(value as u64))
        }
    }

    async fn seed_stock(&self, key: &str, quantity: u64) -> Result<bool, NodeError> {
        let mut conn = self.conn_manager.clone();
        let key = key.to_string();

        let created: bool = self
            .run(async move { conn.set_nx(&key, quantity).await })
            .await?;

        Ok(created)
    }

    async fn write_stock(&self, key: &str, quantity: u64) -> Result<(), NodeError> {
        let mut conn = self.conn_manager.clone();
        let key = key.to_string();

        let _: () = self.run(async move { conn.set(&key, quantity).await }).await?;

        Ok(())
    }

    async fn read_stock(&self, key: &str) -> Result<Option<u64>, NodeError> {
        let mut conn = self.conn_manager.clone();
        let key = key.to_string();

        let value: Option<u64> = self.run(async move { conn.get(&key).await }).await?;

        Ok(value)
    }

    async fn acquire(
        &self,
        name: &str,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<AcquireOutcome, NodeError> {
        let mut conn = self.conn_manager.clone();
        let name = name.to_string();
        let token = token.to_string();
        let ttl_ms = ttl.as_millis() as u64;

        // SET name token NX PX ttl: the create and the expiry are one
        // atomic server-side step.
        let reply: Option<String> = self
            .run(async move {
                redis::cmd("SET")
                    .arg(&name)
                    .arg(&token)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        Ok(match reply {
            Some(_) => AcquireOutcome::Acquired,
            None => AcquireOutcome::Busy,
        })
    }

    async fn release(&self, name: &str, token: &LockToken) -> Result<ReleaseOutcome, NodeError> {
        let mut conn = self.conn_manager.clone();
        let script = Script::new(RELEASE_SCRIPT);
        let token = token.to_string();

        let deleted: i64 = self
            .run(async move { script.key(name).arg(&token).invoke_async(&mut conn).await })
            .await?;

        Ok(if deleted == 1 {
            ReleaseOutcome::Released
        } else {
            ReleaseOutcome::NotHeld
        })
    }

    async fn extend(
        &self,
        name: &str,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<ExtendOutcome, NodeError> {
        let mut conn = self.conn_manager.clone();
        let script = Script::new(EXTEND_SCRIPT);
        let token = token.to_string();
        let ttl_ms = ttl.as_millis() as u64;

        let refreshed: i64 = self
            .run(async move {
                script
                    .key(name)
                    .arg(&token)
                    .arg(ttl_ms)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        Ok(if refreshed == 1 {
            ExtendOutcome::Extended
        } else {
            ExtendOutcome::NotHeld
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: These tests require a running Redis instance
    // Run with: docker run -d -p 6379:6379 redis:7-alpine

    const URL: &str = "redis://127.0.0.1:6379";

    async fn node() -> RedisNode {
        RedisNode::connect(URL, Duration::from_millis(500))
            .await
            .expect("redis available")
    }

    fn unique_key(prefix: &str) -> String {
        format!("{prefix}:{}", uuid::Uuid::new_v4())
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn guarded_decrement_boundaries() {
        let node = node().await;
        let key = unique_key("stock:test");

        assert!(node.seed_stock(&key, 3).await.unwrap());

        // Exactly the remaining stock succeeds.
        assert_eq!(
            node.try_decrement(&key, 3).await.unwrap(),
            DecrementOutcome::Applied(0)
        );
        // One more unit is refused, counter untouched.
        assert_eq!(
            node.try_decrement(&key, 1).await.unwrap(),
            DecrementOutcome::Insufficient(0)
        );
        assert_eq!(node.read_stock(&key).await.unwrap(), Some(0));
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn decrement_on_missing_counter() {
        let node = node().await;
        let key = unique_key("stock:test");

        assert_eq!(
            node.try_decrement(&key, 1).await.unwrap(),
            DecrementOutcome::Missing
        );
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn compensation_never_creates_stock() {
        let node = node().await;
        let key = unique_key("stock:test");

        assert_eq!(
            node.compensate(&key, 5).await.unwrap(),
            CompensateOutcome::Missing
        );
        assert_eq!(node.read_stock(&key).await.unwrap(), None);

        node.seed_stock(&key, 10).await.unwrap();
        node.try_decrement(&key, 4).await.unwrap();
        assert_eq!(
            node.compensate(&key, 4).await.unwrap(),
            CompensateOutcome::Applied(10)
        );
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn release_requires_matching_token() {
        let node = node().await;
        let name = unique_key("lock:test");
        let token = LockToken::new();
        let intruder = LockToken::new();

        assert_eq!(
            node.acquire(&name, &token, Duration::from_secs(5)).await.unwrap(),
            AcquireOutcome::Acquired
        );
        assert_eq!(
            node.acquire(&name, &intruder, Duration::from_secs(5)).await.unwrap(),
            AcquireOutcome::Busy
        );
        // A non-matching token cannot delete the holder's record.
        assert_eq!(
            node.release(&name, &intruder).await.unwrap(),
            ReleaseOutcome::NotHeld
        );
        assert_eq!(
            node.release(&name, &token).await.unwrap(),
            ReleaseOutcome::Released
        );
        // Second release of the same token is a no-op.
        assert_eq!(
            node.release(&name, &token).await.unwrap(),
            ReleaseOutcome::NotHeld
        );
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn lock_record_expires() {
        let node = node().await;
        let name = unique_key("lock:test");
        let token = LockToken::new();

        node.acquire(&name, &token, Duration::from_millis(100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let successor = LockToken::new();
        assert_eq!(
            node.acquire(&name, &successor, Duration::from_secs(5)).await.unwrap(),
            AcquireOutcome::Acquired
        );
        node.release(&name, &successor).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn extend_refreshes_only_for_holder() {
        let node = node().await;
        let name = unique_key("lock:test");
        let token = LockToken::new();
        let intruder = LockToken::new();

        node.acquire(&name, &token, Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            node.extend(&name, &intruder, Duration::from_secs(10)).await.unwrap(),
            ExtendOutcome::NotHeld
        );
        assert_eq!(
            node.extend(&name, &token, Duration::from_secs(10)).await.unwrap(),
            ExtendOutcome::Extended
        );
        node.release(&name, &token).await.unwrap();
    }
}
