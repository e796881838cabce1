//! Application configuration
//!
//! Built from defaults, then an optional TOML file, then `TRC_*` environment
//! variables. Command-line flags are applied last by `main`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::pipeline::{OrchestratorConfig, WorkerConfig};
use crate::retry::RetryConfig;
use crate::storage::{
    BackendSettings, ObjectStoreConfig, QueueBackend, QueueConfig, RedisConfig, StoreBackend,
    StoreConfig,
};

/// HTTP server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

/// Application configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Verbosity level for logging
    #[serde(skip)]
    pub verbose: u8,
    pub server: ServerConfig,
    pub object_store: ObjectStoreConfig,
    pub queue: QueueConfig,
    pub store: StoreConfig,
    pub redis: RedisConfig,
    pub orchestrator: OrchestratorConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
}

impl AppConfig {
    /// Load from an optional file plus the process environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `TRC_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvOverrides { lookup };

        env.set("TRC_BIND", &mut self.server.bind, parse_from_str)?;
        env.set("TRC_OBJECT_STORE", &mut self.object_store.backend, parse_enum)?;
        env.set("TRC_CONTAINER", &mut self.object_store.container, parse_string)?;
        env.set("TRC_DATA_ROOT", &mut self.object_store.root, parse_path)?;
        env.set_opt("TRC_S3_ENDPOINT", &mut self.object_store.s3.endpoint)?;
        env.set_opt("TRC_S3_REGION", &mut self.object_store.s3.region)?;
        env.set("TRC_QUEUE", &mut self.queue.backend, parse_enum)?;
        env.set("TRC_MAX_DELIVERIES", &mut self.queue.max_deliveries, parse_from_str)?;
        env.set("TRC_STORE", &mut self.store.backend, parse_enum)?;
        env.set("TRC_KEY_PREFIX", &mut self.store.key_prefix, parse_string)?;
        env.set("TRC_RECORD_TTL", &mut self.store.record_ttl, parse_duration)?;
        env.set("TRC_LOCK_SCOPE", &mut self.store.lock_scope, parse_enum)?;
        env.set("TRC_REDIS_URL", &mut self.redis.url, parse_string)?;
        env.set("TRC_POLL_INTERVAL", &mut self.orchestrator.poll_interval, parse_duration)?;
        env.set("TRC_TIMEOUT", &mut self.orchestrator.timeout, parse_duration)?;
        env.set("TRC_WORKER_CONCURRENCY", &mut self.worker.concurrency, parse_from_str)?;
        if let Some(value) = (env.lookup)("TRC_WORKER_PARALLELISM") {
            self.worker.parallelism = Some(parse_from_str("TRC_WORKER_PARALLELISM", &value)?);
        }
        Ok(())
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let orchestrator = &self.orchestrator;
        if orchestrator.poll_interval.is_zero() || orchestrator.timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "orchestrator poll_interval and timeout must be non-zero".into(),
            ));
        }
        if orchestrator.poll_interval >= orchestrator.timeout {
            return Err(ConfigError::Invalid(format!(
                "orchestrator poll_interval ({:?}) must be shorter than timeout ({:?})",
                orchestrator.poll_interval, orchestrator.timeout
            )));
        }
        if self.worker.concurrency == 0 || self.worker.parallelism == Some(0) {
            return Err(ConfigError::Invalid(
                "worker concurrency and parallelism must be at least 1".into(),
            ));
        }
        let durations = [
            ("store.record_ttl", self.store.record_ttl),
            ("store.lock_ttl", self.store.lock_ttl),
            ("store.lock_wait", self.store.lock_wait),
            ("queue.receive_timeout", self.queue.receive_timeout),
            ("queue.visibility_timeout", self.queue.visibility_timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
        }
        if self.queue.max_deliveries == 0 || self.retry.attempts == 0 {
            return Err(ConfigError::Invalid(
                "queue.max_deliveries and retry.attempts must be at least 1".into(),
            ));
        }
        if self.object_store.container.is_empty() {
            return Err(ConfigError::Invalid("object_store.container is empty".into()));
        }
        Ok(())
    }

    /// True when queue and store are reachable by other processes
    pub fn has_shared_backends(&self) -> bool {
        self.queue.backend != QueueBackend::Memory && self.store.backend != StoreBackend::Memory
    }

    pub fn backend_settings<'a>(&'a self, instance: &'a str) -> BackendSettings<'a> {
        BackendSettings {
            object_store: &self.object_store,
            queue: &self.queue,
            store: &self.store,
            redis: &self.redis,
            instance,
        }
    }

    /// Get the log level string based on verbosity
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            2 => "trace",
            _ => "trace,hyper=debug,tower=debug",
        }
    }
}

struct EnvOverrides<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvOverrides<F> {
    fn set<T>(
        &self,
        var: &str,
        target: &mut T,
        parse: fn(&str, &str) -> Result<T, ConfigError>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = (self.lookup)(var) {
            *target = parse(var, &value)?;
        }
        Ok(())
    }

    fn set_opt(&self, var: &str, target: &mut Option<String>) -> Result<(), ConfigError> {
        if let Some(value) = (self.lookup)(var) {
            *target = (!value.is_empty()).then_some(value);
        }
        Ok(())
    }
}

fn parse_string(_var: &str, value: &str) -> Result<String, ConfigError> {
    Ok(value.to_string())
}

fn parse_path(_var: &str, value: &str) -> Result<PathBuf, ConfigError> {
    Ok(PathBuf::from(value))
}

fn parse_from_str<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Env {
        var: var.to_string(),
        message: e.to_string(),
    })
}

fn parse_enum<T: DeserializeOwned>(var: &str, value: &str) -> Result<T, ConfigError> {
    serde_json::from_value(serde_json::Value::String(value.to_lowercase())).map_err(|e| {
        ConfigError::Env {
            var: var.to_string(),
            message: e.to_string(),
        }
    })
}

fn parse_duration(var: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime_serde::deserialize(serde_json::Value::String(value.to_string())).map_err(
        |e: serde_json::Error| ConfigError::Env {
            var: var.to_string(),
            message: e.to_string(),
        },
    )
}
