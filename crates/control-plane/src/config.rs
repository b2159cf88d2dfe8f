//! The top-level application config: one struct per subsystem, loaded together through
//! a single [`core_common::config::ConfigLoader`].

use core_common::config::TracingConfig;
use core_common::SafeDisplay;
use core_runtime::{PortRange, WorkerSupervisorConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRangeConfig {
    pub min: u16,
    pub max: u16,
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self { min: 20000, max: 29999 }
    }
}

impl From<PortRangeConfig> for PortRange {
    fn from(c: PortRangeConfig) -> Self {
        PortRange { min: c.min, max: c.max }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub max_warm_instances: usize,
    pub max_concurrent_invocations: u32,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub undeploy_drain_budget: Duration,
    pub work_root: PathBuf,
    pub network_id: String,
    pub public_endpoint: String,
    pub key_material_endpoint: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let defaults = WorkerSupervisorConfig::default();
        Self {
            max_warm_instances: defaults.max_warm_instances,
            max_concurrent_invocations: defaults.max_concurrent_invocations,
            idle_timeout: defaults.idle_timeout,
            undeploy_drain_budget: defaults.undeploy_drain_budget,
            work_root: defaults.work_root,
            network_id: defaults.network_id,
            public_endpoint: defaults.public_endpoint,
            key_material_endpoint: defaults.key_material_endpoint,
        }
    }
}

impl From<WorkerConfig> for WorkerSupervisorConfig {
    fn from(c: WorkerConfig) -> Self {
        WorkerSupervisorConfig {
            max_warm_instances: c.max_warm_instances,
            max_concurrent_invocations: c.max_concurrent_invocations,
            idle_timeout: c.idle_timeout,
            undeploy_drain_budget: c.undeploy_drain_budget,
            work_root: c.work_root,
            network_id: c.network_id,
            public_endpoint: c.public_endpoint,
            key_material_endpoint: c.key_material_endpoint,
            sample_cap: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ControlPlaneConfig {
    pub tracing: TracingConfig,
    pub ports: PortRangeConfig,
    pub worker: WorkerConfig,
    pub cron: CronConfig,
    pub reaper: ReaperConfig,
}

impl SafeDisplay for ControlPlaneConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "tracing:\n{}\nports: {}-{}\nworker.work_root: {}\ncron.tick_interval: {:?}",
            self.tracing.to_safe_string_indented(),
            self.ports.min,
            self.ports.max,
            self.worker.work_root.display(),
            self.cron.tick_interval,
        )
    }
}
