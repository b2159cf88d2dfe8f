//! Content-addressed blob storage client. Every other subsystem in the core shares
//! one of these: the worker supervisor fetches code artifacts through it, the backup
//! worker uploads and downloads dumps through it. It is the only resource shared
//! across components, so every backend implementation must be safe for concurrent
//! upload/download.

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Cid(pub String);

impl Cid {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hex::encode(hasher.finalize()))
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub filename: String,
    pub permanent: bool,
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub cid: Cid,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct Download {
    pub content: Vec<u8>,
    pub backend: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ContentStoreError {
    #[error("content unavailable for {cid}: {reason}")]
    Unavailable { cid: String, reason: String },
    #[error("upload failed: {0}")]
    UploadFailed(String),
}

impl core_common::error::Classify for ContentStoreError {
    fn kind(&self) -> core_common::error::ErrorKind {
        core_common::error::ErrorKind::ContentUnavailable
    }
}

/// One storage backend. Implementations are expected to be cheap to clone (an `Arc`
/// internally) since the client may hold several for fallback.
#[async_trait]
pub trait ContentStoreBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    async fn upload(&self, bytes: &[u8], opts: &UploadOptions) -> Result<Upload, ContentStoreError>;
    async fn download(&self, cid: &Cid) -> Result<Vec<u8>, ContentStoreError>;
    async fn exists(&self, cid: &Cid) -> bool;
    async fn health_check(&self) -> bool;
}

/// The client composes one primary backend with an ordered list of fallbacks. Uploads
/// always go to the primary (callers get back a cid they can later download through
/// any backend); downloads try the primary first and fall through the fallbacks on
/// failure, returning `ContentUnavailable` only once every backend has failed.
#[derive(Clone)]
pub struct ContentStoreClient {
    primary: Arc<dyn ContentStoreBackend>,
    fallbacks: Vec<Arc<dyn ContentStoreBackend>>,
}

impl ContentStoreClient {
    pub fn new(primary: Arc<dyn ContentStoreBackend>) -> Self {
        Self {
            primary,
            fallbacks: Vec::new(),
        }
    }

    pub fn with_fallback(mut self, backend: Arc<dyn ContentStoreBackend>) -> Self {
        self.fallbacks.push(backend);
        self
    }

    pub async fn upload(
        &self,
        bytes: &[u8],
        opts: &UploadOptions,
    ) -> Result<Upload, ContentStoreError> {
        self.primary.upload(bytes, opts).await
    }

    pub async fn download(&self, cid: &Cid) -> Result<Download, ContentStoreError> {
        let mut last_err = None;
        for backend in std::iter::once(&self.primary).chain(self.fallbacks.iter()) {
            match backend.download(cid).await {
                Ok(content) => {
                    return Ok(Download {
                        content,
                        backend: backend.name().to_string(),
                    })
                }
                Err(err) => {
                    warn!(backend = backend.name(), cid = %cid, "backend download failed, trying next");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or(ContentStoreError::Unavailable {
            cid: cid.to_string(),
            reason: "no backends configured".to_string(),
        }))
    }

    pub async fn exists(&self, cid: &Cid) -> bool {
        if self.primary.exists(cid).await {
            return true;
        }
        for backend in &self.fallbacks {
            if backend.exists(cid).await {
                return true;
            }
        }
        false
    }

    pub async fn health_check(&self) -> bool {
        self.primary.health_check().await
    }
}

/// In-process backend used by tests and as a local cache tier; also doubles as a
/// reference implementation for what a real HTTP-backed gateway must satisfy.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    store: DashMap<String, Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentStoreBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upload(
        &self,
        bytes: &[u8],
        opts: &UploadOptions,
    ) -> Result<Upload, ContentStoreError> {
        let cid = Cid::of(bytes);
        debug!(filename = %opts.filename, permanent = opts.permanent, cid = %cid, "uploading blob");
        self.store.insert(cid.0.clone(), bytes.to_vec());
        Ok(Upload {
            url: format!("memory://{cid}"),
            cid,
        })
    }

    async fn download(&self, cid: &Cid) -> Result<Vec<u8>, ContentStoreError> {
        self.store
            .get(&cid.0)
            .map(|entry| entry.clone())
            .ok_or_else(|| ContentStoreError::Unavailable {
                cid: cid.to_string(),
                reason: "not found in memory backend".to_string(),
            })
    }

    async fn exists(&self, cid: &Cid) -> bool {
        self.store.contains_key(&cid.0)
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Content-addressed gateway reached over HTTP: objects are PUT/GET by their own
/// `Cid`, so uploads are naturally idempotent.
#[derive(Debug)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn object_url(&self, cid: &Cid) -> String {
        format!("{}/objects/{}", self.base_url.trim_end_matches('/'), cid)
    }
}

#[async_trait]
impl ContentStoreBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn upload(&self, bytes: &[u8], opts: &UploadOptions) -> Result<Upload, ContentStoreError> {
        let cid = Cid::of(bytes);
        let url = self.object_url(&cid);
        let response = self
            .client
            .put(&url)
            .query(&[
                ("filename", opts.filename.as_str()),
                ("permanent", if opts.permanent { "true" } else { "false" }),
            ])
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| ContentStoreError::UploadFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ContentStoreError::UploadFailed(format!(
                "gateway returned {} for PUT {url}",
                response.status()
            )));
        }
        Ok(Upload { url, cid })
    }

    async fn download(&self, cid: &Cid) -> Result<Vec<u8>, ContentStoreError> {
        let url = self.object_url(cid);
        let response = self.client.get(&url).send().await.map_err(|e| ContentStoreError::Unavailable {
            cid: cid.to_string(),
            reason: e.to_string(),
        })?;
        if !response.status().is_success() {
            return Err(ContentStoreError::Unavailable {
                cid: cid.to_string(),
                reason: format!("gateway returned {}", response.status()),
            });
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| ContentStoreError::Unavailable {
                cid: cid.to_string(),
                reason: e.to_string(),
            })
    }

    async fn exists(&self, cid: &Cid) -> bool {
        self.client
            .head(self.object_url(cid))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url.trim_end_matches('/'));
        self.client
            .get(&url)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_then_download_roundtrips() {
        let client = ContentStoreClient::new(Arc::new(MemoryBackend::new()));
        let upload = client
            .upload(
                b"hello world",
                &UploadOptions {
                    filename: "backup-1.sql.gz".to_string(),
                    permanent: true,
                },
            )
            .await
            .unwrap();

        let downloaded = client.download(&upload.cid).await.unwrap();
        assert_eq!(downloaded.content, b"hello world");
        assert_eq!(downloaded.backend, "memory");
    }

    #[tokio::test]
    async fn download_falls_back_when_primary_misses() {
        let primary = Arc::new(MemoryBackend::new());
        let fallback = Arc::new(MemoryBackend::new());
        let upload = fallback
            .upload(
                b"only in fallback",
                &UploadOptions {
                    filename: "x".to_string(),
                    permanent: false,
                },
            )
            .await
            .unwrap();

        let client = ContentStoreClient::new(primary).with_fallback(fallback);
        let downloaded = client.download(&upload.cid).await.unwrap();
        assert_eq!(downloaded.content, b"only in fallback");
        assert_eq!(downloaded.backend, "memory");
    }

    #[tokio::test]
    async fn download_of_unknown_cid_is_unavailable() {
        let client = ContentStoreClient::new(Arc::new(MemoryBackend::new()));
        let result = client.download(&Cid("deadbeef".to_string())).await;
        assert!(matches!(result, Err(ContentStoreError::Unavailable { .. })));
    }

    #[test]
    fn cid_is_deterministic() {
        let a = Cid::of(b"same bytes");
        let b = Cid::of(b"same bytes");
        assert_eq!(a, b);
    }
}
