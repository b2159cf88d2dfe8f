//! The state machine driving each tenant database instance. Composes the connection
//! pool manager and backup worker; owns no HTTP surface of its own.

use crate::backup::BackupWorker;
use crate::model::{
    Backup, BackupStatus, Credentials, DatabaseInstanceRecord, Engine, InstanceConfig,
    InstanceState, Replica, ReplicaRole,
};
use chrono::Utc;
use core_common::ids::{BackupId, DatabaseInstanceId, OwnerId, ReplicaId};
use core_content_store::Cid;
use core_pool::{PoolConfig, PoolManager};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("database instance not found")]
    NotFound,
    #[error("not authorized")]
    NotAuthorized,
    #[error("operation not permitted from the current state")]
    IllegalState,
    #[error("invalid instance name: {0}")]
    InvalidName(String),
    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),
}

impl core_common::error::Classify for LifecycleError {
    fn kind(&self) -> core_common::error::ErrorKind {
        use core_common::error::ErrorKind;
        match self {
            LifecycleError::NotFound => ErrorKind::NotFound,
            LifecycleError::NotAuthorized => ErrorKind::NotAuthorized,
            LifecycleError::IllegalState | LifecycleError::InvalidName(_) => ErrorKind::IllegalState,
            LifecycleError::ProvisioningFailed(_) => ErrorKind::Fatal,
        }
    }
}

pub struct NewDatabaseInstance {
    pub name: String,
    pub owner: OwnerId,
    pub engine: Engine,
    pub region: String,
}

#[derive(Debug, Default)]
pub struct UpdatePatch {
    pub vcpus: Option<u32>,
    pub memory_mb: Option<u32>,
    pub storage_gb: Option<u32>,
    pub replica_count: Option<u32>,
    pub max_client_connections: Option<usize>,
    pub pool_size: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_string: String,
    pub engine: Engine,
}

fn validate_name(name: &str) -> Result<(), LifecycleError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.chars().next().is_some_and(|c| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(LifecycleError::InvalidName(name.to_string()))
    }
}

fn deterministic_credentials(id: DatabaseInstanceId) -> Credentials {
    let mut hasher = Sha256::new();
    hasher.update(id.0.as_bytes());
    let digest = hasher.finalize();
    Credentials {
        username: format!("tenant_{}", hex::encode(&digest[0..6])),
        password: hex::encode(&digest[6..18]),
        extra: HashMap::new(),
    }
}

/// Drives every `DatabaseInstanceRecord` through its state graph, composing
/// [`PoolManager`] (provision/stop/reconfigure) and [`BackupWorker`] (backup/restore).
#[derive(Clone)]
pub struct LifecycleController {
    instances: Arc<DashMap<DatabaseInstanceId, DatabaseInstanceRecord>>,
    credentials: Arc<DashMap<DatabaseInstanceId, Credentials>>,
    backups: Arc<DashMap<BackupId, Backup>>,
    replicas: Arc<DashMap<ReplicaId, Replica>>,
    pool: PoolManager,
    backup_worker: Arc<BackupWorker>,
}

impl LifecycleController {
    pub fn new(pool: PoolManager, backup_worker: BackupWorker) -> Self {
        Self {
            instances: Arc::new(DashMap::new()),
            credentials: Arc::new(DashMap::new()),
            backups: Arc::new(DashMap::new()),
            replicas: Arc::new(DashMap::new()),
            pool,
            backup_worker: Arc::new(backup_worker),
        }
    }

    pub fn get(&self, id: DatabaseInstanceId) -> Option<DatabaseInstanceRecord> {
        self.instances.get(&id).map(|e| e.clone())
    }

    fn check_owner(&self, id: DatabaseInstanceId, owner: &OwnerId) -> Result<(), LifecycleError> {
        let instance = self.instances.get(&id).ok_or(LifecycleError::NotFound)?;
        if &instance.owner != owner {
            return Err(LifecycleError::NotAuthorized);
        }
        Ok(())
    }

    fn transition(&self, id: DatabaseInstanceId, to: InstanceState) -> Result<(), LifecycleError> {
        let mut instance = self.instances.get_mut(&id).ok_or(LifecycleError::NotFound)?;
        if !instance.status.can_transition_to(to) {
            return Err(LifecycleError::IllegalState);
        }
        instance.status = to;
        instance.updated_at = Utc::now();
        Ok(())
    }

    /// Bypasses `can_transition_to`: per its own doc comment, `Failed` is reachable
    /// from any state on an unrecoverable error, so it is not in that table.
    fn force_failed(&self, id: DatabaseInstanceId, reason: String) {
        if let Some(mut instance) = self.instances.get_mut(&id) {
            instance.status = InstanceState::Failed;
            instance.updated_at = Utc::now();
            instance.failure_reason = Some(reason);
        }
    }

    /// Validates the name, applies config defaults, stores the record as `pending`,
    /// and kicks off asynchronous provisioning. Returns immediately.
    #[instrument(skip(self))]
    pub fn create(&self, params: NewDatabaseInstance) -> Result<DatabaseInstanceRecord, LifecycleError> {
        validate_name(&params.name)?;
        let now = Utc::now();
        let record = DatabaseInstanceRecord {
            id: DatabaseInstanceId::new(),
            owner: params.owner,
            engine: params.engine,
            name: params.name,
            status: InstanceState::Pending,
            config: InstanceConfig::default(),
            connection_string: None,
            region: params.region,
            created_at: now,
            updated_at: now,
            last_backup_at: None,
            failure_reason: None,
        };
        self.instances.insert(record.id, record.clone());

        let this = self.clone();
        let id = record.id;
        tokio::spawn(async move {
            this.provision(id).await;
        });

        Ok(record)
    }

    /// Generates deterministic credentials and a connection string, configures the
    /// pool for relational instances, and transitions into `running`. On an
    /// unrecoverable provisioning error transitions straight to `failed` and records
    /// the reason, never leaving the instance looking successfully provisioned.
    #[instrument(skip(self))]
    async fn provision(&self, id: DatabaseInstanceId) {
        let transitioned = self.transition(id, InstanceState::Provisioning);
        if transitioned.is_err() {
            return;
        }

        if let Err(err) = self.try_provision(id).await {
            error!(instance_id = %id, %err, "provisioning failed");
            self.force_failed(id, err.to_string());
        }
    }

    async fn try_provision(&self, id: DatabaseInstanceId) -> Result<(), LifecycleError> {
        let instance = self.get(id).ok_or(LifecycleError::NotFound)?;

        if matches!(instance.engine, Engine::Relational) && instance.config.pool_size == 0 {
            return Err(LifecycleError::ProvisioningFailed(
                "relational instance cannot be provisioned with a pool_size of 0".to_string(),
            ));
        }

        let creds = deterministic_credentials(id);
        let connection_string = format!(
            "{}://{}:{}@db-{}.internal/{}",
            engine_scheme(instance.engine),
            creds.username,
            creds.password,
            id,
            instance.name
        );

        if matches!(instance.engine, Engine::Relational) {
            self.pool
                .configure(
                    id,
                    PoolConfig {
                        default_pool_size: instance.config.pool_size,
                        ..PoolConfig::default()
                    },
                )
                .await;
        }

        self.credentials.insert(id, creds);
        if let Some(mut record) = self.instances.get_mut(&id) {
            record.connection_string = Some(connection_string);
            record.status = InstanceState::Running;
            record.updated_at = Utc::now();
        }
        info!(instance_id = %id, "database instance provisioned");
        Ok(())
    }

    /// Only permitted from `running`: transitions to `scaling`, applies the patch,
    /// reconfigures the pool if its size changed, then returns to `running`.
    #[instrument(skip(self, patch))]
    pub async fn update(
        &self,
        id: DatabaseInstanceId,
        owner: &OwnerId,
        patch: UpdatePatch,
    ) -> Result<DatabaseInstanceRecord, LifecycleError> {
        self.check_owner(id, owner)?;
        self.transition(id, InstanceState::Scaling)?;

        let pool_size_changed;
        {
            let mut record = self.instances.get_mut(&id).ok_or(LifecycleError::NotFound)?;
            if let Some(v) = patch.vcpus {
                record.config.vcpus = v;
            }
            if let Some(v) = patch.memory_mb {
                record.config.memory_mb = v;
            }
            if let Some(v) = patch.storage_gb {
                record.config.storage_gb = v;
            }
            if let Some(v) = patch.replica_count {
                record.config.replica_count = v;
            }
            pool_size_changed = patch.pool_size.is_some();
            if let Some(v) = patch.pool_size {
                record.config.pool_size = v;
            }
        }

        if pool_size_changed {
            let record = self.get(id).ok_or(LifecycleError::NotFound)?;
            if matches!(record.engine, Engine::Relational) {
                self.pool
                    .configure(
                        id,
                        PoolConfig {
                            default_pool_size: record.config.pool_size,
                            ..PoolConfig::default()
                        },
                    )
                    .await;
            }
        }

        self.transition(id, InstanceState::Running)?;
        self.get(id).ok_or(LifecycleError::NotFound)
    }

    #[instrument(skip(self))]
    pub async fn stop(&self, id: DatabaseInstanceId, owner: &OwnerId) -> Result<(), LifecycleError> {
        self.check_owner(id, owner)?;
        self.transition(id, InstanceState::Stopped)?;
        self.pool.destroy(id).await;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn start(&self, id: DatabaseInstanceId, owner: &OwnerId) -> Result<(), LifecycleError> {
        self.check_owner(id, owner)?;
        self.transition(id, InstanceState::Provisioning)?;
        self.provision(id).await;
        Ok(())
    }

    /// Transitions to `terminated`, tears down the pool and credentials. The record
    /// itself is retained for audit.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: DatabaseInstanceId, owner: &OwnerId) -> Result<(), LifecycleError> {
        self.check_owner(id, owner)?;
        self.transition(id, InstanceState::Terminated)?;
        self.pool.destroy(id).await;
        self.credentials.remove(&id);
        Ok(())
    }

    pub fn get_connection(&self, id: DatabaseInstanceId, owner: &OwnerId) -> Result<ConnectionInfo, LifecycleError> {
        self.check_owner(id, owner)?;
        let record = self.get(id).ok_or(LifecycleError::NotFound)?;
        if record.status != InstanceState::Running {
            return Err(LifecycleError::IllegalState);
        }
        Ok(ConnectionInfo {
            connection_string: record.connection_string.unwrap_or_default(),
            engine: record.engine,
        })
    }

    /// Transitions to `backing_up`, enqueues the backup in the background, and returns
    /// the pending `Backup` record immediately; the background task updates it and
    /// transitions the instance back to `running` on completion. The expiry window is
    /// derived from the instance's own `config.backup_retention_days`, not a
    /// caller-supplied value.
    #[instrument(skip(self))]
    pub async fn create_backup(
        &self,
        id: DatabaseInstanceId,
        owner: &OwnerId,
    ) -> Result<Backup, LifecycleError> {
        self.check_owner(id, owner)?;
        let instance = self.get(id).ok_or(LifecycleError::NotFound)?;
        self.transition(id, InstanceState::BackingUp)?;

        let now = Utc::now();
        let backup = Backup {
            id: BackupId::new(),
            source_instance: id,
            status: BackupStatus::Pending,
            started_at: now,
            ended_at: None,
            byte_size: None,
            content_cid: None,
            expires_at: now + chrono::Duration::days(instance.config.backup_retention_days as i64),
            automatic: false,
        };
        self.backups.insert(backup.id, backup.clone());

        let this = self.clone();
        let backup_id = backup.id;
        tokio::spawn(async move {
            this.run_backup_job(id, backup_id).await;
        });

        Ok(backup)
    }

    async fn run_backup_job(&self, instance_id: DatabaseInstanceId, backup_id: BackupId) {
        let Some(instance) = self.get(instance_id) else { return };
        let Some(creds) = self.credentials.get(&instance_id).map(|e| e.clone()) else {
            return;
        };

        if let Some(mut backup) = self.backups.get_mut(&backup_id) {
            backup.status = BackupStatus::InProgress;
        }

        match self.backup_worker.run_backup(&instance, &creds, backup_id).await {
            Ok((byte_size, cid)) => {
                if let Some(mut backup) = self.backups.get_mut(&backup_id) {
                    backup.status = BackupStatus::Completed;
                    backup.ended_at = Some(Utc::now());
                    backup.byte_size = Some(byte_size);
                    backup.content_cid = Some(cid);
                }
                if let Some(mut record) = self.instances.get_mut(&instance_id) {
                    record.last_backup_at = Some(Utc::now());
                }
                let _ = self.transition(instance_id, InstanceState::Running);
                info!(%backup_id, "backup completed");
            }
            Err(err) => {
                if let Some(mut backup) = self.backups.get_mut(&backup_id) {
                    backup.status = BackupStatus::Failed;
                    backup.ended_at = Some(Utc::now());
                }
                self.force_failed(instance_id, err.to_string());
                error!(%backup_id, %err, "backup failed");
            }
        }
    }

    pub fn get_backup(&self, id: BackupId) -> Option<Backup> {
        self.backups.get(&id).map(|e| e.clone())
    }

    /// Requires the target backup to be `completed`. Transitions to `restoring`,
    /// restores in place, and returns to `running`. The pool is not quiesced during
    /// the restore window, so callers can observe mid-restore state through a live
    /// connection.
    #[instrument(skip(self))]
    pub async fn restore_backup(
        &self,
        id: DatabaseInstanceId,
        backup_id: BackupId,
        owner: &OwnerId,
    ) -> Result<(), LifecycleError> {
        self.check_owner(id, owner)?;
        let backup = self.backups.get(&backup_id).ok_or(LifecycleError::NotFound)?.clone();
        if backup.status != BackupStatus::Completed {
            return Err(LifecycleError::IllegalState);
        }
        let cid = backup.content_cid.ok_or(LifecycleError::IllegalState)?;

        self.transition(id, InstanceState::Restoring)?;
        warn!(instance_id = %id, "restoring without quiescing the live pool");

        let instance = self.get(id).ok_or(LifecycleError::NotFound)?;
        let creds = self
            .credentials
            .get(&id)
            .map(|e| e.clone())
            .ok_or(LifecycleError::IllegalState)?;

        match self.backup_worker.run_restore(&instance, &creds, &cid).await {
            Ok(()) => {
                self.transition(id, InstanceState::Running)?;
                Ok(())
            }
            Err(err) => {
                self.force_failed(id, err.to_string());
                Err(LifecycleError::ProvisioningFailed(err.to_string()))
            }
        }
    }

    /// Relational engine only. Returns a deterministically derived endpoint; promotion
    /// is a status change only.
    pub fn create_replica(
        &self,
        id: DatabaseInstanceId,
        owner: &OwnerId,
        region: String,
    ) -> Result<Replica, LifecycleError> {
        self.check_owner(id, owner)?;
        let instance = self.get(id).ok_or(LifecycleError::NotFound)?;
        if !matches!(instance.engine, Engine::Relational) {
            return Err(LifecycleError::IllegalState);
        }
        if instance.status != InstanceState::Running {
            return Err(LifecycleError::IllegalState);
        }

        let replica_id = ReplicaId::new();
        let replica = Replica {
            id: replica_id,
            primary_instance: id,
            role: ReplicaRole::ReadReplica,
            endpoint: format!("replica-{replica_id}.{region}.internal"),
            region,
            replication_lag_ms: 0,
            healthy: true,
        };
        self.replicas.insert(replica_id, replica.clone());
        Ok(replica)
    }
}

fn engine_scheme(engine: Engine) -> &'static str {
    match engine {
        Engine::DocumentStore => "docstore",
        Engine::Relational => "postgres",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_content_store::{ContentStoreClient, MemoryBackend};

    fn controller() -> LifecycleController {
        let pool = PoolManager::new();
        let content_store = ContentStoreClient::new(Arc::new(MemoryBackend::new()));
        LifecycleController::new(pool, BackupWorker::new(content_store))
    }

    fn owner() -> OwnerId {
        OwnerId("tenant-1".to_string())
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert!(validate_name("Has-Upper").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name(&"a".repeat(64)).is_err());
        assert!(validate_name("valid-name-1").is_ok());
    }

    #[tokio::test]
    async fn create_then_provision_reaches_running() {
        let controller = controller();
        let record = controller
            .create(NewDatabaseInstance {
                name: "my-db".to_string(),
                owner: owner(),
                engine: Engine::Relational,
                region: "us-east".to_string(),
            })
            .unwrap();
        assert_eq!(record.status, InstanceState::Pending);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let updated = controller.get(record.id).unwrap();
        assert_eq!(updated.status, InstanceState::Running);
        assert!(updated.connection_string.is_some());
    }

    #[tokio::test]
    async fn operations_from_illegal_state_are_rejected() {
        let controller = controller();
        let record = controller
            .create(NewDatabaseInstance {
                name: "my-db".to_string(),
                owner: owner(),
                engine: Engine::Relational,
                region: "us-east".to_string(),
            })
            .unwrap();

        // still pending/provisioning: stop() requires running.
        let result = controller.stop(record.id, &owner()).await;
        assert!(matches!(result, Err(LifecycleError::IllegalState)));
    }

    #[tokio::test]
    async fn owner_mismatch_on_stop_is_rejected() {
        let controller = controller();
        let record = controller
            .create(NewDatabaseInstance {
                name: "my-db".to_string(),
                owner: owner(),
                engine: Engine::Relational,
                region: "us-east".to_string(),
            })
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let other = OwnerId("someone-else".to_string());
        let result = controller.stop(record.id, &other).await;
        assert!(matches!(result, Err(LifecycleError::NotAuthorized)));
    }

    #[tokio::test]
    async fn stop_then_start_returns_to_running() {
        let controller = controller();
        let record = controller
            .create(NewDatabaseInstance {
                name: "my-db".to_string(),
                owner: owner(),
                engine: Engine::Relational,
                region: "us-east".to_string(),
            })
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        controller.stop(record.id, &owner()).await.unwrap();
        assert_eq!(controller.get(record.id).unwrap().status, InstanceState::Stopped);

        controller.start(record.id, &owner()).await.unwrap();
        assert_eq!(controller.get(record.id).unwrap().status, InstanceState::Running);
    }

    #[tokio::test]
    async fn create_replica_requires_relational_running_instance() {
        let controller = controller();
        let record = controller
            .create(NewDatabaseInstance {
                name: "doc-db".to_string(),
                owner: owner(),
                engine: Engine::DocumentStore,
                region: "us-east".to_string(),
            })
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let result = controller.create_replica(record.id, &owner(), "us-west".to_string());
        assert!(matches!(result, Err(LifecycleError::IllegalState)));
    }

    #[tokio::test]
    async fn unrecoverable_provisioning_error_moves_instance_to_failed() {
        let controller = controller();
        let id = DatabaseInstanceId::new();
        let now = Utc::now();
        controller.instances.insert(
            id,
            DatabaseInstanceRecord {
                id,
                owner: owner(),
                engine: Engine::Relational,
                name: "zero-pool".to_string(),
                status: InstanceState::Pending,
                config: InstanceConfig {
                    pool_size: 0,
                    ..InstanceConfig::default()
                },
                connection_string: None,
                region: "us-east".to_string(),
                created_at: now,
                updated_at: now,
                last_backup_at: None,
                failure_reason: None,
            },
        );

        controller.provision(id).await;

        let record = controller.get(id).unwrap();
        assert_eq!(record.status, InstanceState::Failed);
        assert!(record.failure_reason.is_some());
    }

    #[tokio::test]
    async fn restore_failure_moves_instance_to_failed_not_running() {
        let controller = controller();
        let record = controller
            .create(NewDatabaseInstance {
                name: "doc-db".to_string(),
                owner: owner(),
                engine: Engine::DocumentStore,
                region: "us-east".to_string(),
            })
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(controller.get(record.id).unwrap().status, InstanceState::Running);

        // Restoring from an unknown cid drives `run_restore` to fail; the instance
        // must not be left looking healthy.
        let bogus_backup_id = BackupId::new();
        controller.backups.insert(
            bogus_backup_id,
            Backup {
                id: bogus_backup_id,
                source_instance: record.id,
                status: BackupStatus::Completed,
                started_at: Utc::now(),
                ended_at: Some(Utc::now()),
                byte_size: Some(0),
                content_cid: Some(core_content_store::Cid("not-uploaded-anywhere".to_string())),
                expires_at: Utc::now() + chrono::Duration::days(7),
                automatic: false,
            },
        );

        let result = controller.restore_backup(record.id, bogus_backup_id, &owner()).await;
        assert!(matches!(result, Err(LifecycleError::ProvisioningFailed(_))));
        assert_eq!(controller.get(record.id).unwrap().status, InstanceState::Failed);
    }
}
