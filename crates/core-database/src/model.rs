//! Entities driven by the lifecycle controller and backup worker.

use chrono::{DateTime, Utc};
use core_common::ids::{BackupId, DatabaseInstanceId, OwnerId, ReplicaId};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Engine {
    /// Document-style engine reachable over a small HTTP dump/restore API.
    DocumentStore,
    /// Relational engine whose dump/restore is performed by an external CLI utility.
    Relational,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InstanceState {
    Pending,
    Provisioning,
    Running,
    Scaling,
    BackingUp,
    Restoring,
    Stopped,
    Terminated,
    Failed,
}

impl InstanceState {
    /// `Failed` is reachable from any state on an unrecoverable provisioning error,
    /// so it is checked separately from this table.
    pub fn can_transition_to(self, to: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, to),
            (Pending, Provisioning)
                | (Provisioning, Running)
                | (Running, Scaling)
                | (Scaling, Running)
                | (Running, BackingUp)
                | (BackingUp, Running)
                | (Running, Restoring)
                | (Restoring, Running)
                | (Running, Stopped)
                | (Stopped, Running)
                | (Stopped, Provisioning)
                | (Running, Terminated)
                | (Stopped, Terminated)
        )
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstanceConfig {
    pub vcpus: u32,
    pub memory_mb: u32,
    pub storage_gb: u32,
    pub replica_count: u32,
    pub pool_size: usize,
    pub backup_retention_days: u32,
    pub consistency_mode: String,
    pub encryption_at_rest: bool,
    pub public_access: bool,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            vcpus: 1,
            memory_mb: 1024,
            storage_gb: 10,
            replica_count: 0,
            pool_size: 10,
            backup_retention_days: 7,
            consistency_mode: "strong".to_string(),
            encryption_at_rest: true,
            public_access: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseInstanceRecord {
    pub id: DatabaseInstanceId,
    pub owner: OwnerId,
    pub engine: Engine,
    pub name: String,
    pub status: InstanceState,
    pub config: InstanceConfig,
    pub connection_string: Option<String>,
    pub region: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BackupStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Expired,
}

#[derive(Debug, Clone)]
pub struct Backup {
    pub id: BackupId,
    pub source_instance: DatabaseInstanceId,
    pub status: BackupStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub byte_size: Option<u64>,
    pub content_cid: Option<core_content_store::Cid>,
    pub expires_at: DateTime<Utc>,
    pub automatic: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ReplicaRole {
    Primary,
    ReadReplica,
    Standby,
}

#[derive(Debug, Clone)]
pub struct Replica {
    pub id: ReplicaId,
    pub primary_instance: DatabaseInstanceId,
    pub role: ReplicaRole,
    pub endpoint: String,
    pub region: String,
    pub replication_lag_ms: u64,
    pub healthy: bool,
}

/// Credentials are kept out of `DatabaseInstanceRecord` so a snapshot clone of the
/// record (returned to callers) never carries secret material.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub extra: HashMap<String, String>,
}
