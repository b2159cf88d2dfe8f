//! Streaming dumps out of a live instance into the content store, and reversing the
//! flow on restore. One job runs per instance at a time; that exclusion is enforced
//! by the lifecycle controller transitioning to `backing_up` before calling in here,
//! not by this module.

use crate::model::{Credentials, DatabaseInstanceRecord, Engine};
use async_trait::async_trait;
use core_content_store::{Cid, ContentStoreClient, UploadOptions};
use std::io::{Read, Write};
use std::process::Stdio;
use std::sync::Arc;
use tracing::{info, warn};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("dump request failed: {0}")]
    DumpFailed(String),
    #[error("restore request failed: {0}")]
    RestoreFailed(String),
    #[error("content store error: {0}")]
    ContentStore(#[from] core_content_store::ContentStoreError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl core_common::error::Classify for BackupError {
    fn kind(&self) -> core_common::error::ErrorKind {
        match self {
            BackupError::ContentStore(_) => core_common::error::ErrorKind::ContentUnavailable,
            _ => core_common::error::ErrorKind::UpstreamFailure,
        }
    }
}

/// One engine's dump/restore behavior. Engine A speaks HTTP to the instance; engine B
/// shells out to a dump/restore utility.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    async fn dump(&self, instance: &DatabaseInstanceRecord, creds: &Credentials) -> Result<Vec<u8>, BackupError>;
    async fn restore(
        &self,
        instance: &DatabaseInstanceRecord,
        creds: &Credentials,
        bytes: &[u8],
    ) -> Result<(), BackupError>;
}

/// Engine A: POST `{}` to the backup endpoint with a bearer token; on non-200, fall
/// back to a SQL dump via the `/query` endpoint.
pub struct DocumentStoreAdapter {
    client: reqwest::Client,
}

impl Default for DocumentStoreAdapter {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EngineAdapter for DocumentStoreAdapter {
    async fn dump(&self, instance: &DatabaseInstanceRecord, creds: &Credentials) -> Result<Vec<u8>, BackupError> {
        let backup_url = format!("{}/backup", endpoint_base(instance));
        let response = self
            .client
            .post(&backup_url)
            .bearer_auth(&creds.password)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| BackupError::DumpFailed(e.to_string()))?;

        if response.status().is_success() {
            return Ok(response
                .bytes()
                .await
                .map_err(|e| BackupError::DumpFailed(e.to_string()))?
                .to_vec());
        }

        warn!(instance_id = %instance.id, status = %response.status(), "backup endpoint failed, falling back to sql dump");
        let query_url = format!("{}/query", endpoint_base(instance));
        let fallback = self
            .client
            .post(&query_url)
            .bearer_auth(&creds.password)
            .json(&serde_json::json!({ "sql": "SELECT * FROM information_schema.tables" }))
            .send()
            .await
            .map_err(|e| BackupError::DumpFailed(e.to_string()))?;
        if !fallback.status().is_success() {
            return Err(BackupError::DumpFailed(format!(
                "sql fallback dump returned {}",
                fallback.status()
            )));
        }
        Ok(fallback
            .bytes()
            .await
            .map_err(|e| BackupError::DumpFailed(e.to_string()))?
            .to_vec())
    }

    async fn restore(
        &self,
        instance: &DatabaseInstanceRecord,
        creds: &Credentials,
        bytes: &[u8],
    ) -> Result<(), BackupError> {
        let restore_url = format!("{}/restore", endpoint_base(instance));
        let response = self
            .client
            .post(&restore_url)
            .bearer_auth(&creds.password)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| BackupError::RestoreFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BackupError::RestoreFailed(format!(
                "restore endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

fn endpoint_base(instance: &DatabaseInstanceRecord) -> String {
    instance
        .connection_string
        .clone()
        .unwrap_or_else(|| format!("http://127.0.0.1/{}", instance.id))
}

/// Engine B: invokes an external dump/restore utility via a subprocess. pg_restore
/// style warnings on stderr are non-fatal; anything else with a non-zero exit is.
pub struct RelationalAdapter {
    pub dump_utility: String,
    pub restore_utility: String,
}

impl Default for RelationalAdapter {
    fn default() -> Self {
        Self {
            dump_utility: "pg_dump".to_string(),
            restore_utility: "pg_restore".to_string(),
        }
    }
}

#[async_trait]
impl EngineAdapter for RelationalAdapter {
    async fn dump(&self, instance: &DatabaseInstanceRecord, creds: &Credentials) -> Result<Vec<u8>, BackupError> {
        let connection_string = instance
            .connection_string
            .clone()
            .unwrap_or_else(|| format!("postgres://{}@localhost/{}", creds.username, instance.name));

        let output = tokio::process::Command::new(&self.dump_utility)
            .arg("--format=custom")
            .arg(&connection_string)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BackupError::DumpFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackupError::DumpFailed(stderr.to_string()));
        }
        Ok(output.stdout)
    }

    async fn restore(
        &self,
        instance: &DatabaseInstanceRecord,
        creds: &Credentials,
        bytes: &[u8],
    ) -> Result<(), BackupError> {
        let connection_string = instance
            .connection_string
            .clone()
            .unwrap_or_else(|| format!("postgres://{}@localhost/{}", creds.username, instance.name));

        let mut child = tokio::process::Command::new(&self.restore_utility)
            .arg("--dbname")
            .arg(&connection_string)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BackupError::RestoreFailed(e.to_string()))?;

        {
            use tokio::io::AsyncWriteExt;
            let stdin = child.stdin.as_mut().expect("stdin was piped");
            stdin
                .write_all(bytes)
                .await
                .map_err(|e| BackupError::RestoreFailed(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BackupError::RestoreFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_non_fatal_warning(&stderr) {
                warn!(instance_id = %instance.id, "restore utility exited non-zero with only warnings");
            } else {
                return Err(BackupError::RestoreFailed(stderr.to_string()));
            }
        }
        Ok(())
    }
}

fn is_non_fatal_warning(stderr: &str) -> bool {
    !stderr.lines().any(|line| {
        let line = line.to_ascii_lowercase();
        !line.contains("warning") && (line.contains("error") || line.contains("fatal"))
    })
}

fn gzip_compress(bytes: &[u8]) -> Result<Vec<u8>, BackupError> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

/// If `bytes` is gzip-wrapped (magic bytes `1f 8b`), decompress it; otherwise pass it
/// through unchanged.
fn maybe_decompress(bytes: &[u8]) -> Result<Vec<u8>, BackupError> {
    if bytes.len() >= 2 && bytes[0..2] == GZIP_MAGIC {
        let mut decoder = flate2::read::GzDecoder::new(bytes);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    } else {
        Ok(bytes.to_vec())
    }
}

pub struct BackupWorker {
    content_store: ContentStoreClient,
    document_store_adapter: Arc<dyn EngineAdapter>,
    relational_adapter: Arc<dyn EngineAdapter>,
}

impl BackupWorker {
    pub fn new(content_store: ContentStoreClient) -> Self {
        Self::with_adapters(
            content_store,
            Arc::new(DocumentStoreAdapter::default()),
            Arc::new(RelationalAdapter::default()),
        )
    }

    /// Lets callers substitute test doubles for the real HTTP/subprocess adapters,
    /// same injection seam `ContentStoreClient` uses for its backends.
    pub fn with_adapters(
        content_store: ContentStoreClient,
        document_store_adapter: Arc<dyn EngineAdapter>,
        relational_adapter: Arc<dyn EngineAdapter>,
    ) -> Self {
        Self {
            content_store,
            document_store_adapter,
            relational_adapter,
        }
    }

    fn adapter_for(&self, engine: Engine) -> &Arc<dyn EngineAdapter> {
        match engine {
            Engine::DocumentStore => &self.document_store_adapter,
            Engine::Relational => &self.relational_adapter,
        }
    }

    /// Dumps the instance, gzips the result, and uploads it permanently to the content
    /// store under `backup-<id>.sql.gz`, returning the byte size and content hash to
    /// stamp on the `Backup` record.
    pub async fn run_backup(
        &self,
        instance: &DatabaseInstanceRecord,
        creds: &Credentials,
        backup_id: core_common::ids::BackupId,
    ) -> Result<(u64, Cid), BackupError> {
        let adapter = self.adapter_for(instance.engine);
        let raw = adapter.dump(instance, creds).await?;
        let gzipped = gzip_compress(&raw)?;
        let byte_size = gzipped.len() as u64;

        let upload = self
            .content_store
            .upload(
                &gzipped,
                &UploadOptions {
                    filename: format!("backup-{backup_id}.sql.gz"),
                    permanent: true,
                },
            )
            .await?;

        info!(%backup_id, byte_size, cid = %upload.cid, "backup uploaded");
        Ok((byte_size, upload.cid))
    }

    /// Downloads by content hash, decompresses if the bytes are gzip-wrapped, and
    /// restores into the instance via its engine adapter.
    pub async fn run_restore(
        &self,
        instance: &DatabaseInstanceRecord,
        creds: &Credentials,
        cid: &Cid,
    ) -> Result<(), BackupError> {
        let download = self.content_store.download(cid).await?;
        let bytes = maybe_decompress(&download.content)?;
        let adapter = self.adapter_for(instance.engine);
        adapter.restore(instance, creds, &bytes).await
    }
}
