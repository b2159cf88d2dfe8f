//! Database instance entities, the backup worker, and the lifecycle state machine.

pub mod backup;
pub mod lifecycle;
pub mod model;

pub use backup::{BackupError, BackupWorker, DocumentStoreAdapter, EngineAdapter, RelationalAdapter};
pub use lifecycle::{
    ConnectionInfo, LifecycleController, LifecycleError, NewDatabaseInstance, UpdatePatch,
};
pub use model::{
    Backup, BackupStatus, Credentials, DatabaseInstanceRecord, Engine, InstanceConfig,
    InstanceState, Replica, ReplicaRole,
};
