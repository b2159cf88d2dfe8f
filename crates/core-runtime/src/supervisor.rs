//! Per-function warm pool, HTTP invocation routing, and the background reaper.
//! Composes the port allocator, process launcher, and content store client behind
//! one component boundary; its internal maps are never touched by any other
//! subsystem.

use crate::launcher::{LaunchedProcess, ProcessLauncher, WorkerEnv};
use crate::port::PortAllocator;
use chrono::{DateTime, Utc};
use core_common::ids::{FunctionId, InstanceId, InvocationId};
use core_common::ids::OwnerId;
use core_common::telemetry::Metrics as TelemetryMetrics;
use core_content_store::{Cid, ContentStoreClient};
use prometheus::{Histogram, HistogramOpts, IntCounter};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub id: FunctionId,
    pub name: String,
    pub owner: OwnerId,
    pub code_cid: Cid,
    pub entry_point: String,
    pub memory_limit_mb: u32,
    pub timeout_ms: u64,
    pub version: u32,
    pub status: FunctionStatus,
    pub env: HashMap<String, String>,
    pub invocation_count: u64,
    pub error_count: u64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Starting,
    Ready,
    Busy,
    Stopping,
    Stopped,
    Error,
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub id: InstanceId,
    pub function_id: FunctionId,
    pub function_version: u32,
    pub port: u16,
    pub status: InstanceStatus,
    pub active_invocations: u32,
    pub total_invocations: u64,
    pub started_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStatus {
    Pending,
    Running,
    Success,
    Error,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub id: InvocationId,
    pub function_id: FunctionId,
    pub status: InvocationStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub log_lines: Vec<String>,
    pub memory_high_water_mb: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct HttpEvent {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

pub struct NewFunction {
    pub name: String,
    pub owner: OwnerId,
    pub code_cid: Cid,
    pub entry_point: String,
    pub memory_limit_mb: u32,
    pub timeout_ms: u64,
    pub env: HashMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("function not found")]
    NotFound,
    #[error("not authorized")]
    NotAuthorized,
    #[error("no warm capacity available")]
    CapacityExhausted,
    #[error("upstream worker error: {0}")]
    UpstreamFailure(String),
    #[error("operation timed out")]
    Timeout,
    #[error("content store could not serve the code artifact")]
    ContentUnavailable,
    #[error(transparent)]
    Port(#[from] crate::port::PortError),
    #[error(transparent)]
    Launch(#[from] crate::launcher::LauncherError),
}

impl core_common::error::Classify for WorkerError {
    fn kind(&self) -> core_common::error::ErrorKind {
        use core_common::error::ErrorKind;
        match self {
            WorkerError::NotFound => ErrorKind::NotFound,
            WorkerError::NotAuthorized => ErrorKind::NotAuthorized,
            WorkerError::CapacityExhausted => ErrorKind::CapacityExhausted,
            WorkerError::UpstreamFailure(_) => ErrorKind::UpstreamFailure,
            WorkerError::Timeout => ErrorKind::Timeout,
            WorkerError::ContentUnavailable => ErrorKind::ContentUnavailable,
            WorkerError::Port(e) => e.kind(),
            WorkerError::Launch(e) => e.kind(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSupervisorConfig {
    pub max_warm_instances: usize,
    pub max_concurrent_invocations: u32,
    pub idle_timeout: Duration,
    pub undeploy_drain_budget: Duration,
    pub work_root: PathBuf,
    pub network_id: String,
    pub public_endpoint: String,
    pub key_material_endpoint: String,
    pub sample_cap: usize,
}

impl Default for WorkerSupervisorConfig {
    fn default() -> Self {
        Self {
            max_warm_instances: 4,
            max_concurrent_invocations: 8,
            idle_timeout: Duration::from_secs(300),
            undeploy_drain_budget: Duration::from_secs(10),
            work_root: std::env::temp_dir().join("core-runtime-workers"),
            network_id: "default".to_string(),
            public_endpoint: "https://api.invalid".to_string(),
            key_material_endpoint: "https://keys.invalid".to_string(),
            sample_cap: 1000,
        }
    }
}

/// Per-function rolling sample window backing the p50/p95/p99 snapshot API.
/// Distinct from [`TelemetryMetrics`]: this keeps raw samples for percentile math,
/// while the Prometheus registry on [`WorkerSupervisor`] exports running totals.
struct SampleWindow {
    samples: VecDeque<(DateTime<Utc>, Duration)>,
    error_count: AtomicU64,
}

impl SampleWindow {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            error_count: AtomicU64::new(0),
        }
    }

    fn record(&mut self, at: DateTime<Utc>, duration: Duration, cap: usize) {
        self.samples.push_back((at, duration));
        if self.samples.len() > cap {
            self.samples.pop_front();
        }
    }

    fn percentiles(&self) -> (Duration, Duration, Duration) {
        if self.samples.is_empty() {
            return (Duration::ZERO, Duration::ZERO, Duration::ZERO);
        }
        let mut durations: Vec<Duration> = self.samples.iter().map(|(_, d)| *d).collect();
        durations.sort();
        let pick = |p: f64| {
            let idx = ((durations.len() as f64 - 1.0) * p).round() as usize;
            durations[idx.min(durations.len() - 1)]
        };
        (pick(0.50), pick(0.95), pick(0.99))
    }

    fn rps(&self, now: DateTime<Utc>) -> f64 {
        let window_start = now - chrono::Duration::seconds(60);
        let count = self.samples.iter().filter(|(t, _)| *t >= window_start).count();
        count as f64 / 60.0
    }
}

pub struct FunctionMetricsSnapshot {
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub rps: f64,
    pub error_count: u64,
}

struct FunctionState {
    function: Function,
    instances: Vec<Instance>,
    handles: HashMap<InstanceId, LaunchedProcess>,
    metrics: SampleWindow,
    artifact_path: PathBuf,
}

pub struct WorkerSupervisor {
    functions: Mutex<HashMap<FunctionId, FunctionState>>,
    config: WorkerSupervisorConfig,
    content_store: Arc<ContentStoreClient>,
    ports: Arc<PortAllocator>,
    launcher: ProcessLauncher,
    telemetry: TelemetryMetrics,
    invocation_duration: Histogram,
    invocation_errors: IntCounter,
}

impl WorkerSupervisor {
    pub fn new(
        config: WorkerSupervisorConfig,
        content_store: Arc<ContentStoreClient>,
        ports: Arc<PortAllocator>,
    ) -> Self {
        let telemetry = TelemetryMetrics::new();
        let invocation_duration = Histogram::with_opts(HistogramOpts::new(
            "worker_invocation_duration_seconds",
            "Duration of worker HTTP invocations in seconds",
        ))
        .expect("static histogram opts are always valid");
        let invocation_errors = IntCounter::new(
            "worker_invocation_errors_total",
            "Count of worker invocations that returned a non-2xx response or timed out",
        )
        .expect("static counter opts are always valid");
        telemetry
            .registry
            .register(Box::new(invocation_duration.clone()))
            .expect("metric name is registered exactly once");
        telemetry
            .registry
            .register(Box::new(invocation_errors.clone()))
            .expect("metric name is registered exactly once");

        Self {
            functions: Mutex::new(HashMap::new()),
            config,
            content_store,
            ports,
            launcher: ProcessLauncher::new(),
            telemetry,
            invocation_duration,
            invocation_errors,
        }
    }

    /// The Prometheus registry backing this supervisor's invocation metrics, for a
    /// caller to fold into a `/metrics` exporter.
    pub fn telemetry(&self) -> &TelemetryMetrics {
        &self.telemetry
    }

    #[instrument(skip(self, spec))]
    pub async fn deploy_function(&self, spec: NewFunction) -> Result<Function, WorkerError> {
        let function_id = FunctionId::new();
        let work_dir = self.config.work_root.join(function_id.to_string());
        std::fs::create_dir_all(&work_dir).map_err(crate::launcher::LauncherError::from)?;

        let download = self
            .content_store
            .download(&spec.code_cid)
            .await
            .map_err(|_| WorkerError::ContentUnavailable)?;
        let artifact_path = work_dir.join("artifact.blob");
        std::fs::write(&artifact_path, &download.content)
            .map_err(crate::launcher::LauncherError::from)?;

        let function = Function {
            id: function_id,
            name: spec.name,
            owner: spec.owner,
            code_cid: spec.code_cid,
            entry_point: spec.entry_point,
            memory_limit_mb: spec.memory_limit_mb,
            timeout_ms: spec.timeout_ms,
            version: 1,
            status: FunctionStatus::Active,
            env: spec.env,
            invocation_count: 0,
            error_count: 0,
            avg_duration_ms: 0.0,
        };

        let mut functions = self.functions.lock().await;
        functions.insert(
            function_id,
            FunctionState {
                function: function.clone(),
                instances: Vec::new(),
                handles: HashMap::new(),
                metrics: SampleWindow::new(),
                artifact_path,
            },
        );
        info!(%function_id, "function deployed");
        Ok(function)
    }

    /// Stops every instance (graceful drain up to the configured budget, then kill),
    /// releases their ports, and drops the function's cached artifact and records.
    #[instrument(skip(self))]
    pub async fn undeploy_function(&self, id: FunctionId) -> Result<(), WorkerError> {
        let mut functions = self.functions.lock().await;
        let Some(mut state) = functions.remove(&id) else {
            return Err(WorkerError::NotFound);
        };
        drop(functions);

        for instance in &state.instances {
            if let Some(mut handle) = state.handles.remove(&instance.id) {
                let drained = tokio::time::timeout(
                    self.config.undeploy_drain_budget,
                    handle.child.wait(),
                )
                .await;
                if drained.is_err() {
                    warn!(instance_id = %instance.id, "drain budget exceeded, killing worker");
                    let _ = handle.child.kill().await;
                }
            }
            self.ports.release(instance.port);
        }
        info!(function_id = %id, "function undeployed");
        Ok(())
    }

    pub async fn get_function(&self, id: FunctionId) -> Option<Function> {
        self.functions.lock().await.get(&id).map(|s| s.function.clone())
    }

    /// Resolution order: an idle-ready instance with spare concurrency, then
    /// a busy instance with spare concurrency, then a fresh spawn under the warm cap,
    /// else `None` (the caller turns this into a 503).
    async fn acquire_instance(&self, function_id: FunctionId) -> Result<Option<InstanceId>, WorkerError> {
        {
            let functions = self.functions.lock().await;
            let state = functions.get(&function_id).ok_or(WorkerError::NotFound)?;

            if let Some(instance) = state.instances.iter().find(|i| {
                i.status == InstanceStatus::Ready
                    && i.active_invocations < self.config.max_concurrent_invocations
            }) {
                return Ok(Some(instance.id));
            }
            if let Some(instance) = state.instances.iter().find(|i| {
                i.status == InstanceStatus::Busy
                    && i.active_invocations < self.config.max_concurrent_invocations
            }) {
                return Ok(Some(instance.id));
            }
            if state.instances.len() >= self.config.max_warm_instances {
                return Ok(None);
            }
        }
        Ok(Some(self.create_instance(function_id).await?))
    }

    /// Spawns a fresh subprocess for `function_id`: allocate a port, materialize the
    /// artifact, write the bootstrap shim, launch, probe readiness, transition to ready.
    #[instrument(skip(self))]
    pub async fn create_instance(&self, function_id: FunctionId) -> Result<InstanceId, WorkerError> {
        let (artifact_path, work_dir, owner, memory_limit_mb, timeout_ms, version) = {
            let functions = self.functions.lock().await;
            let state = functions.get(&function_id).ok_or(WorkerError::NotFound)?;
            (
                state.artifact_path.clone(),
                self.config.work_root.join(function_id.to_string()),
                state.function.owner.clone(),
                state.function.memory_limit_mb,
                state.function.timeout_ms,
                state.function.version,
            )
        };

        let port = self.ports.allocate()?;
        let instance_id = InstanceId::new();
        let instance_dir = work_dir.join(instance_id.to_string());

        let artifact = tokio::fs::read(&artifact_path)
            .await
            .map_err(crate::launcher::LauncherError::from)?;
        let entry = self.launcher.materialize(&artifact, &instance_dir)?;

        let env = WorkerEnv {
            port,
            function_id,
            instance_id,
            owner_id: owner,
            memory_limit_mb,
            timeout_ms,
            network_id: self.config.network_id.clone(),
            public_endpoint: self.config.public_endpoint.clone(),
            key_material_endpoint: self.config.key_material_endpoint.clone(),
        };

        let launch_result = self.launcher.launch(&instance_dir, &entry, env);
        let launched = match launch_result {
            Ok(l) => l,
            Err(e) => {
                self.ports.release(port);
                return Err(e.into());
            }
        };

        if let Err(e) = self.launcher.wait_ready(port).await {
            self.ports.release(port);
            return Err(e.into());
        }

        let now = Utc::now();
        let instance = Instance {
            id: instance_id,
            function_id,
            function_version: version,
            port,
            status: InstanceStatus::Ready,
            active_invocations: 0,
            total_invocations: 0,
            started_at: now,
            last_used_at: now,
        };

        let mut functions = self.functions.lock().await;
        if let Some(state) = functions.get_mut(&function_id) {
            state.instances.push(instance.clone());
            state.handles.insert(instance_id, launched);
        }
        info!(%function_id, %instance_id, port, "instance ready");
        Ok(instance_id)
    }

    /// Forwards an HTTP-shaped invocation to the resolved instance.
    #[instrument(skip(self, event))]
    pub async fn invoke_http(&self, function_id: FunctionId, event: HttpEvent) -> Result<HttpResponse, WorkerError> {
        let (timeout_ms, entry_missing) = {
            let functions = self.functions.lock().await;
            match functions.get(&function_id) {
                Some(state) => (state.function.timeout_ms, false),
                None => (0, true),
            }
        };
        if entry_missing {
            return Err(WorkerError::NotFound);
        }

        let instance_id = self
            .acquire_instance(function_id)
            .await?
            .ok_or(WorkerError::CapacityExhausted)?;

        let port = self.mark_instance_busy(function_id, instance_id).await?;

        let url = match &event.query {
            Some(q) => format!("http://127.0.0.1:{port}{}?{q}", event.path),
            None => format!("http://127.0.0.1:{port}{}", event.path),
        };

        let client = reqwest::Client::new();
        let method = reqwest::Method::from_bytes(event.method.as_bytes())
            .map_err(|e| WorkerError::UpstreamFailure(e.to_string()))?;
        let mut request = client.request(method, &url).body(event.body);
        for (k, v) in &event.headers {
            request = request.header(k, v);
        }

        let started = Utc::now();
        let outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), request.send()).await;

        let result = match outcome {
            Err(_) => Err(WorkerError::Timeout),
            Ok(Err(e)) => Err(WorkerError::UpstreamFailure(e.to_string())),
            Ok(Ok(resp)) => {
                let status = resp.status().as_u16();
                let mut headers = HashMap::new();
                for (k, v) in resp.headers() {
                    if let Ok(value) = v.to_str() {
                        headers.insert(k.to_string(), value.to_string());
                    }
                }
                let body = resp.bytes().await.unwrap_or_default().to_vec();
                if (200..300).contains(&status) {
                    Ok(HttpResponse { status, headers, body })
                } else {
                    Err(WorkerError::UpstreamFailure(format!("upstream returned {status}")))
                }
            }
        };

        let duration = (Utc::now() - started).to_std().unwrap_or(Duration::ZERO);
        self.finish_invocation(function_id, instance_id, started, duration, result.is_ok())
            .await;
        result
    }

    async fn mark_instance_busy(&self, function_id: FunctionId, instance_id: InstanceId) -> Result<u16, WorkerError> {
        let mut functions = self.functions.lock().await;
        let state = functions.get_mut(&function_id).ok_or(WorkerError::NotFound)?;
        let instance = state
            .instances
            .iter_mut()
            .find(|i| i.id == instance_id)
            .ok_or(WorkerError::NotFound)?;
        instance.active_invocations += 1;
        instance.status = InstanceStatus::Busy;
        instance.last_used_at = Utc::now();
        instance.total_invocations += 1;
        Ok(instance.port)
    }

    async fn finish_invocation(
        &self,
        function_id: FunctionId,
        instance_id: InstanceId,
        started: DateTime<Utc>,
        duration: Duration,
        success: bool,
    ) {
        let mut functions = self.functions.lock().await;
        let Some(state) = functions.get_mut(&function_id) else {
            return;
        };
        if let Some(instance) = state.instances.iter_mut().find(|i| i.id == instance_id) {
            instance.active_invocations = instance.active_invocations.saturating_sub(1);
            if instance.active_invocations == 0 {
                instance.status = InstanceStatus::Ready;
            }
            instance.last_used_at = Utc::now();
        }
        state.function.invocation_count += 1;
        if !success {
            state.function.error_count += 1;
            state.metrics.error_count.fetch_add(1, Ordering::Relaxed);
            self.invocation_errors.inc();
        }
        let n = state.function.invocation_count as f64;
        let ms = duration.as_secs_f64() * 1000.0;
        state.function.avg_duration_ms += (ms - state.function.avg_duration_ms) / n;
        state.metrics.record(started, duration, self.config.sample_cap);
        self.invocation_duration.observe(duration.as_secs_f64());
    }

    /// RPC-shaped invocation: wraps `invoke_http` in a richer envelope, adding a
    /// synthetic invocation record with logs and high-water memory placeholders
    /// (subprocess memory sampling is out of scope for this core).
    pub async fn invoke(&self, function_id: FunctionId, event: HttpEvent) -> Result<Invocation, WorkerError> {
        let started = Utc::now();
        let result = self.invoke_http(function_id, event).await;
        let ended = Utc::now();
        let invocation = Invocation {
            id: InvocationId::new(),
            function_id,
            status: match &result {
                Ok(_) => InvocationStatus::Success,
                Err(WorkerError::Timeout) => InvocationStatus::Timeout,
                Err(_) => InvocationStatus::Error,
            },
            started_at: started,
            ended_at: Some(ended),
            duration: (ended - started).to_std().ok(),
            log_lines: Vec::new(),
            memory_high_water_mb: None,
        };
        result.map(|_| invocation)
    }

    pub async fn metrics_for(&self, function_id: FunctionId) -> Option<FunctionMetricsSnapshot> {
        let functions = self.functions.lock().await;
        let state = functions.get(&function_id)?;
        let (p50, p95, p99) = state.metrics.percentiles();
        Some(FunctionMetricsSnapshot {
            p50,
            p95,
            p99,
            rps: state.metrics.rps(Utc::now()),
            error_count: state.metrics.error_count.load(Ordering::Relaxed),
        })
    }

    /// Drop instances whose process has exited; stop idle-beyond-timeout ready
    /// instances while always keeping at least one warm.
    #[instrument(skip(self))]
    pub async fn reap(&self) {
        let mut functions = self.functions.lock().await;
        for (function_id, state) in functions.iter_mut() {
            let mut exited = Vec::new();
            for instance in &state.instances {
                if let Some(handle) = state.handles.get_mut(&instance.id) {
                    if handle.child.try_wait().ok().flatten().is_some() {
                        exited.push(instance.id);
                    }
                }
            }
            for id in &exited {
                state.instances.retain(|i| i.id != *id);
                if let Some(mut handle) = state.handles.remove(id) {
                    self.ports.release(handle.port);
                    let _ = handle.child.kill().await;
                }
                warn!(function_id = %function_id, instance_id = %id, "reaped crashed instance");
            }

            let now = Utc::now();
            let warm_count = state
                .instances
                .iter()
                .filter(|i| i.status == InstanceStatus::Ready)
                .count();
            let idle_candidate = state.instances.iter().position(|i| {
                i.status == InstanceStatus::Ready
                    && i.active_invocations == 0
                    && (now - i.last_used_at)
                        .to_std()
                        .map(|d| d > self.config.idle_timeout)
                        .unwrap_or(false)
            });
            if warm_count > 1 {
                if let Some(idx) = idle_candidate {
                    let instance = state.instances.remove(idx);
                    if let Some(mut handle) = state.handles.remove(&instance.id) {
                        self.ports.release(instance.port);
                        let _ = handle.child.kill().await;
                    }
                    info!(function_id = %function_id, instance_id = %instance.id, "reaped idle instance");
                }
            }
        }
    }
}
