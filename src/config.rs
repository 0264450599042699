//! Invoker configuration, loaded from YAML.

use std::{collections::HashMap, time::Duration};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use uuid::Uuid;

const LOCAL_ENV: &str = "local";
const DEFAULT_METRICS_INTERVAL_SECS: u64 = 10;

/// One prewarm pool entry: keep `count` containers of `kind` at `memory_mb`
/// booted and waiting for code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrewarmSpec {
    pub kind: String,
    pub memory_mb: u64,
    pub count: usize,
    /// Prewarmed containers older than this are destroyed and replaced.
    #[serde(default)]
    pub max_age_s: Option<u64>,
}

impl PrewarmSpec {
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_s.map(Duration::from_secs)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DriverConfig {
    #[default]
    Docker,
    DockerAt {
        /// Docker daemon address; unix socket path or tcp:// endpoint.
        address: String,
        #[serde(default)]
        network: Option<String>,
    },
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Enable OTLP metrics export.
    #[serde(default)]
    pub enable_metrics: bool,
    /// Collector endpoint; falls back to OTEL_EXPORTER_OTLP_ENDPOINT.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde_inline_default(DEFAULT_METRICS_INTERVAL_SECS)]
    pub metrics_interval_s: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            endpoint: None,
            metrics_interval_s: DEFAULT_METRICS_INTERVAL_SECS,
        }
    }
}

impl TelemetryConfig {
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_s)
    }
}

/// Top-level invoker configuration.
#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokerConfig {
    /// Environment name; anything but "local" switches to JSON logging.
    #[serde_inline_default(LOCAL_ENV.to_string())]
    pub env: String,

    /// Identity of this invoker instance.
    #[serde(default = "default_invoker_id")]
    pub invoker_id: String,

    /// Hard aggregate memory budget across all containers.
    pub memory_limit_mb: u64,

    /// Prewarm pools, keyed by (kind, memory_mb).
    #[serde(default)]
    pub prewarm: Vec<PrewarmSpec>,

    /// Idle time before an initialized container is paused.
    #[serde_inline_default(50_000)]
    pub idle_grace_ms: u64,

    /// LRU eviction when true; FIFO by creation time when false.
    #[serde_inline_default(true)]
    pub eviction_lru: bool,

    /// Feed batch size: maximum messages in flight across namespaces.
    #[serde_inline_default(128)]
    pub concurrent_peek: usize,

    /// Per-namespace in-flight cap.
    #[serde_inline_default(16)]
    pub namespace_concurrency_default: usize,

    /// Treat a failed pause as fatal for the container.
    #[serde(default)]
    pub pause_failure_fatal: bool,

    /// How long to wait for the log sentinel before cutting off by
    /// timestamp.
    #[serde_inline_default(2_000)]
    pub log_collect_timeout_ms: u64,

    /// Response body cap; larger bodies are truncated and flagged.
    #[serde_inline_default(1_048_576)]
    pub max_response_bytes: usize,

    /// Grace window for draining in-flight work on shutdown.
    #[serde_inline_default(10_000)]
    pub shutdown_grace_ms: u64,

    /// How often a rejected submission is retried before failing with
    /// SystemOverloaded.
    #[serde_inline_default(5)]
    pub submit_max_retries: u32,
    #[serde_inline_default(100)]
    pub submit_backoff_initial_ms: u64,
    #[serde_inline_default(5_000)]
    pub submit_backoff_max_ms: u64,

    /// Runtime kind to container image, e.g. "nodejs:14" ->
    /// "action-nodejs-v14:latest".
    #[serde(default)]
    pub runtimes: HashMap<String, String>,

    #[serde(default)]
    pub driver: DriverConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_invoker_id() -> String {
    format!("invoker-{}", Uuid::new_v4())
}

impl InvokerConfig {
    pub fn from_path(path: &str) -> Result<InvokerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    pub fn from_yaml_str(config_str: &str) -> Result<InvokerConfig> {
        let config: InvokerConfig = serde_saphyr::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory_limit_mb == 0 {
            anyhow::bail!("memory_limit_mb must be positive");
        }
        if self.concurrent_peek == 0 {
            anyhow::bail!("concurrent_peek must be positive");
        }
        if self.namespace_concurrency_default == 0 {
            anyhow::bail!("namespace_concurrency_default must be positive");
        }
        for spec in &self.prewarm {
            if spec.memory_mb == 0 || spec.memory_mb > self.memory_limit_mb {
                anyhow::bail!(
                    "prewarm entry for kind {} has memory {} MB outside (0, {}]",
                    spec.kind,
                    spec.memory_mb,
                    self.memory_limit_mb
                );
            }
            if !self.runtimes.contains_key(&spec.kind) {
                anyhow::bail!("prewarm kind {} has no runtime image configured", spec.kind);
            }
        }
        Ok(())
    }

    /// Image for a runtime kind, if configured.
    pub fn runtime_image(&self, kind: &str) -> Option<&str> {
        self.runtimes.get(kind).map(String::as_str)
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_millis(self.idle_grace_ms)
    }

    pub fn log_collect_timeout(&self) -> Duration {
        Duration::from_millis(self.log_collect_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn submit_backoff(&self) -> crate::retry::Backoff {
        crate::retry::Backoff::Exponential {
            initial: Duration::from_millis(self.submit_backoff_initial_ms),
            max: Duration::from_millis(self.submit_backoff_max_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
memory_limit_mb: 2048
runtimes:
  "nodejs:14": "action-nodejs-v14:latest"
"#
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = InvokerConfig::from_yaml_str(minimal_yaml()).unwrap();
        assert_eq!(config.env, "local");
        assert_eq!(config.memory_limit_mb, 2048);
        assert_eq!(config.idle_grace_ms, 50_000);
        assert!(config.eviction_lru);
        assert_eq!(config.concurrent_peek, 128);
        assert!(!config.pause_failure_fatal);
        assert!(config.invoker_id.starts_with("invoker-"));
        assert!(!config.structured_logging());
    }

    #[test]
    fn test_memory_limit_required() {
        let result = InvokerConfig::from_yaml_str("env: local\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_prewarm_validation() {
        let yaml = r#"
memory_limit_mb: 512
runtimes:
  "nodejs:14": "action-nodejs-v14:latest"
prewarm:
  - kind: "python:3"
    memory_mb: 256
    count: 1
"#;
        let err = InvokerConfig::from_yaml_str(yaml).unwrap_err().to_string();
        assert!(err.contains("no runtime image"));
    }

    #[test]
    fn test_prewarm_memory_over_limit_rejected() {
        let yaml = r#"
memory_limit_mb: 512
runtimes:
  "nodejs:14": "action-nodejs-v14:latest"
prewarm:
  - kind: "nodejs:14"
    memory_mb: 1024
    count: 1
"#;
        assert!(InvokerConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
env: production
memory_limit_mb: 4096
idle_grace_ms: 10000
eviction_lru: false
concurrent_peek: 64
namespace_concurrency_default: 8
runtimes:
  "nodejs:14": "action-nodejs-v14:latest"
prewarm:
  - kind: "nodejs:14"
    memory_mb: 256
    count: 2
    max_age_s: 600
driver:
  type: docker_at
  address: "unix:///var/run/docker.sock"
telemetry:
  enable_metrics: true
  metrics_interval_s: 5
"#;
        let config = InvokerConfig::from_yaml_str(yaml).unwrap();
        assert!(config.structured_logging());
        assert!(!config.eviction_lru);
        assert_eq!(config.prewarm[0].max_age(), Some(Duration::from_secs(600)));
        assert!(matches!(config.driver, DriverConfig::DockerAt { .. }));
        assert_eq!(
            config.telemetry.metrics_interval(),
            Duration::from_secs(5)
        );
        assert_eq!(config.runtime_image("nodejs:14"), Some("action-nodejs-v14:latest"));
        assert_eq!(config.runtime_image("go:1"), None);
    }
}
