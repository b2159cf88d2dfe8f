//! Typed configuration loading: a TOML file merged with environment variable
//! overrides, deserialized into a plain `serde`-derived struct with a `Default`
//! impl supplying every numeric default.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),
}

pub struct ConfigLoader<T> {
    path: PathBuf,
    env_prefix: &'static str,
    _marker: PhantomData<T>,
}

impl<T> ConfigLoader<T>
where
    T: DeserializeOwned + Serialize + Default,
{
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            env_prefix: "CONTROL_PLANE_",
            _marker: PhantomData,
        }
    }

    pub fn with_env_prefix(mut self, prefix: &'static str) -> Self {
        self.env_prefix = prefix;
        self
    }

    /// Layers: built-in defaults < TOML file (if present) < environment variables.
    pub fn load(&self) -> Result<T, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(T::default()));
        if self.path.exists() {
            figment = figment.merge(Toml::file(&self.path));
        }
        figment = figment.merge(Env::prefixed(self.env_prefix).split("__"));
        Ok(figment.extract()?)
    }
}

/// Configuration for the `tracing-subscriber` initialization shared by every binary.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TracingConfig {
    pub service_name: String,
    pub json: bool,
    pub env_filter: String,
}

impl TracingConfig {
    pub fn local_dev(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            json: false,
            env_filter: "info".to_string(),
        }
    }
}

impl crate::SafeDisplay for TracingConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "service: {}\njson: {}\nfilter: {}",
            self.service_name, self.json, self.env_filter
        )
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::local_dev("control-plane")
    }
}
