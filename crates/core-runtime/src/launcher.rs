//! Materializing a code artifact to disk and spawning a worker subprocess. One
//! `ProcessLauncher` is shared by the supervisor; launching itself holds no state
//! beyond the filesystem and OS process table.

use core_common::ids::{FunctionId, InstanceId};
use core_common::ids::OwnerId;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(200);
const READINESS_BUDGET: Duration = Duration::from_secs(30);
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, thiserror::Error)]
pub enum LauncherError {
    #[error("i/o error materializing artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive did not contain a `main` entry point")]
    NoEntryPoint,
    #[error("process failed to become ready within the readiness budget")]
    ReadinessTimeout,
    #[error("spawn failed: {0}")]
    SpawnFailed(String),
}

impl core_common::error::Classify for LauncherError {
    fn kind(&self) -> core_common::error::ErrorKind {
        match self {
            LauncherError::ReadinessTimeout => core_common::error::ErrorKind::Timeout,
            LauncherError::NoEntryPoint | LauncherError::SpawnFailed(_) => {
                core_common::error::ErrorKind::Fatal
            }
            LauncherError::Io(_) => core_common::error::ErrorKind::Fatal,
        }
    }
}

/// The curated, typed allow-list passed to every spawned worker; no string-keyed
/// environment map. `into_env_vars` is the one place this crosses into
/// untyped `(String, String)` pairs, right before `exec`.
#[derive(Debug, Clone)]
pub struct WorkerEnv {
    pub port: u16,
    pub function_id: FunctionId,
    pub instance_id: InstanceId,
    pub owner_id: OwnerId,
    pub memory_limit_mb: u32,
    pub timeout_ms: u64,
    pub network_id: String,
    pub public_endpoint: String,
    pub key_material_endpoint: String,
}

impl WorkerEnv {
    fn into_env_vars(self) -> Vec<(String, String)> {
        vec![
            ("WORKER_PORT".to_string(), self.port.to_string()),
            ("WORKER_FUNCTION_ID".to_string(), self.function_id.to_string()),
            ("WORKER_INSTANCE_ID".to_string(), self.instance_id.to_string()),
            ("WORKER_OWNER_ID".to_string(), self.owner_id.to_string()),
            ("WORKER_MEMORY_LIMIT_MB".to_string(), self.memory_limit_mb.to_string()),
            ("WORKER_TIMEOUT_MS".to_string(), self.timeout_ms.to_string()),
            ("WORKER_NETWORK_ID".to_string(), self.network_id),
            ("WORKER_PUBLIC_ENDPOINT".to_string(), self.public_endpoint),
            ("WORKER_KEY_MATERIAL_ENDPOINT".to_string(), self.key_material_endpoint),
        ]
    }
}

pub struct LaunchedProcess {
    pub child: Child,
    pub port: u16,
    pub work_dir: PathBuf,
}

#[derive(Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }

    /// Detects the artifact shape by magic bytes and produces an executable entry
    /// point under `work_dir` named `main`. Gzip-wrapped tar archives are extracted;
    /// anything else is treated as a single source file.
    pub fn materialize(&self, artifact: &[u8], work_dir: &Path) -> Result<PathBuf, LauncherError> {
        std::fs::create_dir_all(work_dir)?;
        if artifact.len() >= 2 && artifact[0..2] == GZIP_MAGIC {
            let decoder = flate2::read::GzDecoder::new(artifact);
            let mut archive = tar::Archive::new(decoder);
            archive.unpack(work_dir)?;
            let entry = work_dir.join("main");
            if entry.exists() {
                Ok(entry)
            } else {
                Err(LauncherError::NoEntryPoint)
            }
        } else {
            let entry = work_dir.join("main");
            std::fs::write(&entry, artifact)?;
            Ok(entry)
        }
    }

    /// Writes the bootstrap shim: a thin shell wrapper that `exec`s the entry point so
    /// the worker process becomes PID 1 of the subprocess tree the launcher spawns.
    fn write_bootstrap_shim(&self, work_dir: &Path, entry: &Path) -> Result<PathBuf, LauncherError> {
        let shim_path = work_dir.join("bootstrap.sh");
        let mut file = std::fs::File::create(&shim_path)?;
        writeln!(file, "#!/bin/sh")?;
        writeln!(file, "set -e")?;
        writeln!(file, "exec \"{}\" \"$@\"", entry.display())?;
        drop(file);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&shim_path, std::fs::Permissions::from_mode(0o755))?;
            std::fs::set_permissions(entry, std::fs::Permissions::from_mode(0o755))?;
        }
        Ok(shim_path)
    }

    /// Spawns the subprocess with the curated environment and streams its stdout and
    /// stderr into per-function log files under `work_dir/logs`.
    pub fn launch(&self, work_dir: &Path, entry: &Path, env: WorkerEnv) -> Result<LaunchedProcess, LauncherError> {
        let port = env.port;
        let shim = self.write_bootstrap_shim(work_dir, entry)?;

        let log_dir = work_dir.join("logs");
        std::fs::create_dir_all(&log_dir)?;

        let mut command = Command::new("/bin/sh");
        command
            .arg(&shim)
            .current_dir(work_dir)
            .envs(env.into_env_vars())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| LauncherError::SpawnFailed(e.to_string()))?;

        if let Some(stdout) = child.stdout.take() {
            spawn_log_pump(stdout, log_dir.join("stdout.log"));
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_pump(stderr, log_dir.join("stderr.log"));
        }

        Ok(LaunchedProcess {
            child,
            port,
            work_dir: work_dir.to_path_buf(),
        })
    }

    /// Polls `GET /health` on `port` every 200 ms for up to 30 s; `200` or `404` both
    /// count as ready (`404` means the process bound the port without registering a
    /// health route).
    pub async fn wait_ready(&self, port: u16) -> Result<(), LauncherError> {
        let client = reqwest::Client::builder()
            .timeout(READINESS_POLL_INTERVAL)
            .build()
            .map_err(|e| LauncherError::SpawnFailed(e.to_string()))?;
        let url = format!("http://127.0.0.1:{port}/health");
        let deadline = tokio::time::Instant::now() + READINESS_BUDGET;

        loop {
            if tokio::time::Instant::now() >= deadline {
                warn!(port, "worker did not become ready within budget");
                return Err(LauncherError::ReadinessTimeout);
            }
            match client.get(&url).send().await {
                Ok(resp) if resp.status() == 200 || resp.status() == 404 => {
                    info!(port, status = %resp.status(), "worker ready");
                    return Ok(());
                }
                _ => tokio::time::sleep(READINESS_POLL_INTERVAL).await,
            }
        }
    }
}

fn spawn_log_pump<R>(reader: R, dest: PathBuf)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Ok(file) = tokio::fs::File::create(&dest).await else {
            return;
        };
        let mut writer = tokio::io::BufWriter::new(file);
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            use tokio::io::AsyncWriteExt;
            let _ = writer.write_all(line.as_bytes()).await;
            let _ = writer.write_all(b"\n").await;
        }
        use tokio::io::AsyncWriteExt;
        let _ = writer.flush().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn materialize_plain_file_writes_main_entry() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new();
        let entry = launcher.materialize(b"#!/bin/sh\necho hi\n", dir.path()).unwrap();
        assert_eq!(entry, dir.path().join("main"));
        assert_eq!(std::fs::read(&entry).unwrap(), b"#!/bin/sh\necho hi\n");
    }

    #[test]
    fn materialize_gzip_tar_extracts_archive() {
        use std::io::Write as _;
        let dir = tempfile::tempdir().unwrap();
        let mut tar_bytes = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_bytes);
            let data = b"#!/bin/sh\necho hi\n";
            let mut header = tar::Header::new_gnu();
            header.set_path("main").unwrap();
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder.append(&header, &data[..]).unwrap();
            builder.finish().unwrap();
        }
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        let gzipped = encoder.finish().unwrap();

        let launcher = ProcessLauncher::new();
        let entry = launcher.materialize(&gzipped, dir.path()).unwrap();
        assert_eq!(entry, dir.path().join("main"));
    }

    #[test]
    fn missing_entry_point_in_archive_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut tar_bytes = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_bytes);
            let data = b"not the entry";
            let mut header = tar::Header::new_gnu();
            header.set_path("other.txt").unwrap();
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder.append(&header, &data[..]).unwrap();
            builder.finish().unwrap();
        }
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(&mut encoder, &tar_bytes).unwrap();
        let gzipped = encoder.finish().unwrap();

        let launcher = ProcessLauncher::new();
        let result = launcher.materialize(&gzipped, dir.path());
        assert!(matches!(result, Err(LauncherError::NoEntryPoint)));
    }
}
