//! Bounded per-instance connection pools. One [`PoolManager`] serves every database
//! instance in the fleet; each instance's pool is its own critical section guarded
//! by a `tokio::sync::Mutex` — no pool ever touches another instance's state.

use chrono::{DateTime, Utc};
use core_common::ids::{ConnectionId, DatabaseInstanceId};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PoolMode {
    Transaction,
    Session,
    Statement,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PoolConfig {
    pub mode: PoolMode,
    pub default_pool_size: usize,
    pub max_client_connections: usize,
    pub reserve_pool_size: usize,
    pub query_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            mode: PoolMode::Transaction,
            default_pool_size: 10,
            max_client_connections: 100,
            reserve_pool_size: 2,
            query_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PooledConnection {
    pub id: ConnectionId,
    pub instance: DatabaseInstanceId,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub in_use: bool,
    pub client: Option<String>,
}

impl PooledConnection {
    fn new(instance: DatabaseInstanceId, client: String) -> Self {
        let now = Utc::now();
        Self {
            id: ConnectionId::new(),
            instance,
            created_at: now,
            last_used_at: now,
            in_use: true,
            client: Some(client),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub in_use: usize,
    pub waiters: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool for instance is not configured")]
    Unconfigured,
    #[error("timed out waiting for a connection")]
    Timeout,
    #[error("pool was disposed while waiting")]
    Disposed,
}

impl core_common::error::Classify for PoolError {
    fn kind(&self) -> core_common::error::ErrorKind {
        match self {
            PoolError::Unconfigured => core_common::error::ErrorKind::IllegalState,
            PoolError::Timeout => core_common::error::ErrorKind::Timeout,
            PoolError::Disposed => core_common::error::ErrorKind::IllegalState,
        }
    }
}

type WaiterResult = Result<PooledConnection, PoolError>;

struct Waiter {
    id: Uuid,
    client: String,
    sender: oneshot::Sender<WaiterResult>,
}

struct PoolState {
    config: PoolConfig,
    connections: Vec<PooledConnection>,
    waiters: VecDeque<Waiter>,
}

impl PoolState {
    fn new(config: PoolConfig) -> Self {
        Self {
            config,
            connections: Vec::new(),
            waiters: VecDeque::new(),
        }
    }

    fn floor(&self) -> usize {
        self.config.default_pool_size.min(5)
    }
}

/// Per-instance bounded connection pools with FIFO waiter queues.
#[derive(Clone, Default)]
pub struct PoolManager {
    pools: Arc<DashMap<DatabaseInstanceId, Arc<Mutex<PoolState>>>>,
}

impl PoolManager {
    pub fn new() -> Self {
        Self {
            pools: Arc::new(DashMap::new()),
        }
    }

    /// Creates an empty pool and waiter queue for `instance`. A second call for the
    /// same instance tears the existing pool down first — in-flight in-use
    /// connections are dropped and pending waiters fail with `Disposed` — `configure`
    /// is destructive, not a merge.
    #[instrument(skip(self, config))]
    pub async fn configure(&self, instance: DatabaseInstanceId, config: PoolConfig) {
        if self.pools.contains_key(&instance) {
            debug!("reconfiguring existing pool, tearing down first");
            self.destroy(instance).await;
        }
        self.pools
            .insert(instance, Arc::new(Mutex::new(PoolState::new(config))));
    }

    #[instrument(skip(self, client_id))]
    pub async fn acquire(
        &self,
        instance: DatabaseInstanceId,
        client_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<PooledConnection, PoolError> {
        let client_id = client_id.into();
        let pool_arc = self
            .pools
            .get(&instance)
            .map(|entry| entry.clone())
            .ok_or(PoolError::Unconfigured)?;

        let immediate = {
            let mut pool = pool_arc.lock().await;
            if let Some(conn) = pool.connections.iter_mut().find(|c| !c.in_use) {
                conn.in_use = true;
                conn.client = Some(client_id.clone());
                conn.last_used_at = Utc::now();
                Some(conn.clone())
            } else if pool.connections.len() < pool.config.default_pool_size {
                let conn = PooledConnection::new(instance, client_id.clone());
                pool.connections.push(conn.clone());
                Some(conn)
            } else {
                None
            }
        };

        if let Some(conn) = immediate {
            return Ok(conn);
        }

        let waiter_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        {
            let mut pool = pool_arc.lock().await;
            pool.waiters.push_back(Waiter {
                id: waiter_id,
                client: client_id,
                sender: tx,
            });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PoolError::Disposed),
            Err(_) => {
                let mut pool = pool_arc.lock().await;
                pool.waiters.retain(|w| w.id != waiter_id);
                Err(PoolError::Timeout)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn release(
        &self,
        instance: DatabaseInstanceId,
        connection_id: ConnectionId,
    ) -> Result<(), PoolError> {
        let pool_arc = self
            .pools
            .get(&instance)
            .map(|entry| entry.clone())
            .ok_or(PoolError::Unconfigured)?;
        let mut pool = pool_arc.lock().await;

        let idx = match pool.connections.iter().position(|c| c.id == connection_id) {
            Some(idx) => idx,
            None => return Ok(()), // unknown connection id: ignored per spec
        };

        pool.connections[idx].in_use = false;
        pool.connections[idx].client = None;
        pool.connections[idx].last_used_at = Utc::now();

        if let Some(waiter) = pool.waiters.pop_front() {
            pool.connections[idx].in_use = true;
            pool.connections[idx].client = Some(waiter.client);
            pool.connections[idx].last_used_at = Utc::now();
            let handed_over = pool.connections[idx].clone();
            if waiter.sender.send(Ok(handed_over)).is_err() {
                // waiter gave up between enqueue and hand-over (should be rare since
                // the timeout path removes itself under the same lock); put the
                // connection back to idle so it is not leaked.
                warn!("waiter disappeared before hand-over, returning connection to idle");
                pool.connections[idx].in_use = false;
                pool.connections[idx].client = None;
            }
        }

        Ok(())
    }

    /// While the pool exceeds `min(5, defaultPoolSize)`, removes the first idle
    /// connection that has been idle longer than `max_idle`. Returns the number of
    /// connections removed.
    #[instrument(skip(self))]
    pub async fn cleanup(&self, instance: DatabaseInstanceId, max_idle: Duration) -> usize {
        let Some(pool_arc) = self.pools.get(&instance).map(|entry| entry.clone()) else {
            return 0;
        };
        let mut pool = pool_arc.lock().await;
        let floor = pool.floor();
        let mut removed = 0;
        loop {
            if pool.connections.len() <= floor {
                break;
            }
            let now = Utc::now();
            let candidate = pool.connections.iter().position(|c| {
                !c.in_use
                    && now.signed_duration_since(c.last_used_at)
                        > chrono::Duration::from_std(max_idle).unwrap_or_default()
            });
            match candidate {
                Some(idx) => {
                    pool.connections.remove(idx);
                    removed += 1;
                }
                None => break,
            }
        }
        removed
    }

    /// Drops the pool, its configuration, and fails any pending waiters with `Disposed`.
    #[instrument(skip(self))]
    pub async fn destroy(&self, instance: DatabaseInstanceId) {
        if let Some((_, pool_arc)) = self.pools.remove(&instance) {
            let mut pool = pool_arc.lock().await;
            while let Some(waiter) = pool.waiters.pop_front() {
                let _ = waiter.sender.send(Err(PoolError::Disposed));
            }
        }
    }

    pub async fn stats(&self, instance: DatabaseInstanceId) -> Option<PoolStats> {
        let pool_arc = self.pools.get(&instance)?.clone();
        let pool = pool_arc.lock().await;
        Some(PoolStats {
            size: pool.connections.len(),
            in_use: pool.connections.iter().filter(|c| c.in_use).count(),
            waiters: pool.waiters.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(size: usize) -> PoolConfig {
        PoolConfig {
            default_pool_size: size,
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn pool_timeout_scenario() {
        // Pool size 2, acquire A, acquire B, acquire C with 100ms
        // timeout fails after >=100ms; release A brings the pool back to size 2 with
        // no waiters.
        let manager = PoolManager::new();
        let instance = DatabaseInstanceId::new();
        manager.configure(instance, fast_config(2)).await;

        let a = manager
            .acquire(instance, "client-a", Duration::from_secs(1))
            .await
            .unwrap();
        let _b = manager
            .acquire(instance, "client-b", Duration::from_secs(1))
            .await
            .unwrap();

        let start = tokio::time::Instant::now();
        let c = manager
            .acquire(instance, "client-c", Duration::from_millis(100))
            .await;
        let elapsed = start.elapsed();

        assert!(matches!(c, Err(PoolError::Timeout)));
        assert!(elapsed >= Duration::from_millis(100));

        manager.release(instance, a.id).await.unwrap();
        let stats = manager.stats(instance).await.unwrap();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.waiters, 0);
    }

    #[tokio::test]
    async fn release_hands_connection_to_waiter_fifo() {
        let manager = PoolManager::new();
        let instance = DatabaseInstanceId::new();
        manager.configure(instance, fast_config(1)).await;

        let a = manager
            .acquire(instance, "client-a", Duration::from_secs(1))
            .await
            .unwrap();

        let manager2 = manager.clone();
        let waiter = tokio::spawn(async move {
            manager2
                .acquire(instance, "client-b", Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.release(instance, a.id).await.unwrap();

        let handed_over = waiter.await.unwrap().unwrap();
        assert!(handed_over.in_use);
        assert_eq!(handed_over.client.as_deref(), Some("client-b"));

        let stats = manager.stats(instance).await.unwrap();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.in_use, 1);
    }

    #[tokio::test]
    async fn acquire_against_unconfigured_instance_fails() {
        let manager = PoolManager::new();
        let result = manager
            .acquire(DatabaseInstanceId::new(), "x", Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(PoolError::Unconfigured)));
    }

    #[tokio::test]
    async fn release_of_unknown_connection_is_ignored() {
        let manager = PoolManager::new();
        let instance = DatabaseInstanceId::new();
        manager.configure(instance, fast_config(2)).await;
        let result = manager.release(instance, ConnectionId::new()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn destroy_fails_pending_waiters_with_disposed() {
        let manager = PoolManager::new();
        let instance = DatabaseInstanceId::new();
        manager.configure(instance, fast_config(1)).await;
        let _a = manager
            .acquire(instance, "client-a", Duration::from_secs(1))
            .await
            .unwrap();

        let manager2 = manager.clone();
        let waiter = tokio::spawn(async move {
            manager2
                .acquire(instance, "client-b", Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.destroy(instance).await;

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(PoolError::Disposed)));
    }

    #[tokio::test]
    async fn cleanup_trims_idle_connections_above_floor() {
        let manager = PoolManager::new();
        let instance = DatabaseInstanceId::new();
        manager.configure(instance, fast_config(10)).await;

        let mut acquired = Vec::new();
        for i in 0..6 {
            acquired.push(
                manager
                    .acquire(instance, format!("client-{i}"), Duration::from_secs(1))
                    .await
                    .unwrap(),
            );
        }
        for conn in &acquired {
            manager.release(instance, conn.id).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = manager.cleanup(instance, Duration::from_millis(1)).await;
        assert_eq!(removed, 1); // 6 -> floor of min(5, 10) = 5
        let stats = manager.stats(instance).await.unwrap();
        assert_eq!(stats.size, 5);
    }

    #[tokio::test]
    async fn reconfigure_tears_down_existing_pool() {
        let manager = PoolManager::new();
        let instance = DatabaseInstanceId::new();
        manager.configure(instance, fast_config(2)).await;
        let _a = manager
            .acquire(instance, "client-a", Duration::from_secs(1))
            .await
            .unwrap();

        manager.configure(instance, fast_config(2)).await;
        let stats = manager.stats(instance).await.unwrap();
        assert_eq!(stats.size, 0);
    }
}
