//! Configuration structures for Switchyard
//!
//! This module defines the static fleet description and every tunable used by
//! the coordinator. Configurations are loaded from YAML files and can be
//! overridden by environment variables (`SWITCHYARD__SECTION__KEY`).

use crate::error::{Result, SwitchyardError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "SWITCHYARD";

/// Top-level configuration for the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchyardConfig {
    /// Server binding address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Accelerator device groups backends are pinned to
    pub device_groups: Vec<DeviceGroupConfig>,

    /// Static backend descriptors
    pub backends: Vec<BackendConfig>,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub admission: AdmissionConfig,

    #[serde(default)]
    pub prefix_cache: PrefixCacheConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// A set of accelerator devices shared by one or more backends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceGroupConfig {
    pub id: String,

    /// Device indices (exported as CUDA/HIP visible devices at launch)
    #[serde(default)]
    pub devices: Vec<u32>,
}

/// One model-serving backend instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,

    /// Base URL of the backend's control endpoint
    pub endpoint: String,

    pub device_group: String,

    /// Maximum supported context length in tokens; signed so that a
    /// negative value is reported instead of failing to parse
    pub max_context_tokens: i64,

    /// Specialization tags (e.g. "long-context", "fast", "coding")
    #[serde(default)]
    pub specializations: Vec<String>,

    #[serde(default)]
    pub throughput_class: ThroughputClass,

    /// Alternative names accepted as an explicit backend preference
    #[serde(default)]
    pub aliases: Vec<String>,

    /// How to start the process; unmanaged backends omit this
    #[serde(default)]
    pub launch: Option<LaunchConfig>,

    /// Overrides `supervisor.startup_timeout_secs` for this backend
    #[serde(default)]
    pub startup_timeout_secs: Option<u64>,
}

/// Declared throughput class, higher is preferred on ties
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ThroughputClass {
    Low,
    Medium,
    High,
}

impl Default for ThroughputClass {
    fn default() -> Self {
        ThroughputClass::Medium
    }
}

/// Process launch description
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaunchConfig {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment; a list because map keys lose their case when
    /// merged with environment overrides
    #[serde(default)]
    pub env: Vec<EnvVar>,

    /// Directory receiving `<backend>.log`
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

/// One environment variable exported to a launched backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Health probing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Consecutive failures before Ready becomes Degraded
    #[serde(default = "default_degraded_after")]
    pub degraded_after_failures: u32,

    /// Consecutive failures before a backend is declared Down
    #[serde(default = "default_down_after")]
    pub down_after_failures: u32,

    /// Consecutive successes needed to leave Degraded/Down
    #[serde(default = "default_recovery_successes")]
    pub recovery_successes: u32,

    #[serde(default = "default_probe_path")]
    pub probe_path: String,
}

/// Per-caller admission ceilings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    #[serde(default = "default_tokens_per_minute")]
    pub tokens_per_minute: u64,

    #[serde(default = "default_window")]
    pub window_secs: u64,
}

/// Whether prefixes are shared across callers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheScope {
    /// Keys are namespaced by session (or caller when no session is given)
    Session,
    /// One namespace for the whole fleet
    Global,
}

impl Default for CacheScope {
    fn default() -> Self {
        CacheScope::Session
    }
}

/// Prefix cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefixCacheConfig {
    /// Total cost budget, measured in prefix tokens
    #[serde(default = "default_cache_capacity")]
    pub capacity_tokens: u64,

    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default)]
    pub scope: CacheScope,

    /// Upper bound on waiting for another request's in-flight computation
    #[serde(default = "default_cache_wait")]
    pub wait_timeout_ms: u64,
}

/// Keyword rule mapping a task type onto a specialization tag
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskRule {
    pub tag: String,
    pub keywords: Vec<String>,
}

/// Routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: u32,

    /// Retry on a different backend after a backend fault
    #[serde(default)]
    pub retry_on_backend_fault: bool,

    #[serde(default = "default_max_attempts")]
    pub max_backend_attempts: u32,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Tag preferred when a request sets `prefer_speed`
    #[serde(default = "default_fast_tag")]
    pub fast_tag: String,

    /// Ordered task classification rules; first match wins
    #[serde(default = "default_task_rules")]
    pub task_rules: Vec<TaskRule>,
}

/// Lifecycle supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Backend ids in launch order; empty means descriptor order
    #[serde(default)]
    pub startup_order: Vec<String>,

    #[serde(default = "default_startup_poll")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,

    /// Emit JSON log lines
    #[serde(default = "default_structured_logging")]
    pub structured_logging: bool,
}

/// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_probe_interval() -> u64 {
    5
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_degraded_after() -> u32 {
    3
}

fn default_down_after() -> u32 {
    60 // 5 minutes at the default interval
}

fn default_recovery_successes() -> u32 {
    2
}

fn default_probe_path() -> String {
    "/health".to_string()
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_tokens_per_minute() -> u64 {
    100_000
}

fn default_window() -> u64 {
    60
}

fn default_cache_capacity() -> u64 {
    1_000_000
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_cache_wait() -> u64 {
    30_000
}

fn default_chars_per_token() -> u32 {
    4
}

fn default_max_attempts() -> u32 {
    2
}

fn default_request_timeout() -> u64 {
    300
}

fn default_fast_tag() -> String {
    "fast".to_string()
}

fn default_task_rules() -> Vec<TaskRule> {
    let rule = |tag: &str, keywords: &[&str]| TaskRule {
        tag: tag.to_string(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
    };
    vec![
        rule(
            "coding",
            &[
                "code", "function", "class", "debug", "error", "bug", "python", "javascript",
                "typescript", "implement", "algorithm", "def ", "import ", "const ", "let ",
                "var ",
            ],
        ),
        rule(
            "creative",
            &["write", "story", "creative", "poem", "essay", "describe", "imagine", "create a"],
        ),
    ]
}

fn default_startup_poll() -> u64 {
    5
}

fn default_startup_timeout() -> u64 {
    300
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

fn default_structured_logging() -> bool {
    false
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
            probe_timeout_ms: default_probe_timeout(),
            degraded_after_failures: default_degraded_after(),
            down_after_failures: default_down_after(),
            recovery_successes: default_recovery_successes(),
            probe_path: default_probe_path(),
        }
    }
}

impl HealthConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            tokens_per_minute: default_tokens_per_minute(),
            window_secs: default_window(),
        }
    }
}

impl AdmissionConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for PrefixCacheConfig {
    fn default() -> Self {
        Self {
            capacity_tokens: default_cache_capacity(),
            ttl_secs: default_cache_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            scope: CacheScope::default(),
            wait_timeout_ms: default_cache_wait(),
        }
    }
}

impl PrefixCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            chars_per_token: default_chars_per_token(),
            retry_on_backend_fault: false,
            max_backend_attempts: default_max_attempts(),
            request_timeout_secs: default_request_timeout(),
            fast_tag: default_fast_tag(),
            task_rules: default_task_rules(),
        }
    }
}

impl RoutingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_order: Vec::new(),
            poll_interval_secs: default_startup_poll(),
            startup_timeout_secs: default_startup_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
            structured_logging: default_structured_logging(),
        }
    }
}

impl SwitchyardConfig {
    /// Load configuration from a YAML file, applying environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SwitchyardError::config(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| {
                SwitchyardError::config(format!("Failed to read config file {}: {}", path.display(), e))
            })?;

        let config: SwitchyardConfig = settings.try_deserialize().map_err(|e| {
            SwitchyardError::config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML text, without environment overrides
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: SwitchyardConfig = serde_yaml::from_str(content)
            .map_err(|e| SwitchyardError::config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| SwitchyardError::config(format!("Failed to render config: {}", e)))
    }

    /// Validate configuration
    ///
    /// Descriptor-level checks (device groups, context lengths) live in the
    /// coordinator's descriptor store, which refuses to build on bad input.
    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            return Err(SwitchyardError::config("At least one backend must be configured"));
        }

        let mut names = HashSet::new();
        for backend in &self.backends {
            if !names.insert(backend.id.as_str()) {
                return Err(SwitchyardError::config(format!("Duplicate backend id: {}", backend.id)));
            }
        }
        for backend in &self.backends {
            for alias in &backend.aliases {
                if !names.insert(alias.as_str()) {
                    return Err(SwitchyardError::config(format!(
                        "Alias {} of backend {} collides with another backend name",
                        alias, backend.id
                    )));
                }
            }
        }

        if self.health.probe_interval_secs == 0 || self.health.probe_timeout_ms == 0 {
            return Err(SwitchyardError::config("Probe interval and timeout must be positive"));
        }
        if self.health.degraded_after_failures == 0
            || self.health.degraded_after_failures >= self.health.down_after_failures
        {
            return Err(SwitchyardError::config(format!(
                "degraded_after_failures ({}) must be positive and below down_after_failures ({})",
                self.health.degraded_after_failures, self.health.down_after_failures
            )));
        }
        if self.health.recovery_successes == 0 {
            return Err(SwitchyardError::config("recovery_successes must be positive"));
        }

        if self.admission.requests_per_minute == 0
            || self.admission.tokens_per_minute == 0
            || self.admission.window_secs == 0
        {
            return Err(SwitchyardError::config("Admission ceilings and window must be positive"));
        }

        if self.prefix_cache.ttl_secs == 0 || self.prefix_cache.sweep_interval_secs == 0 {
            return Err(SwitchyardError::config("Prefix cache TTL and sweep interval must be positive"));
        }

        if self.routing.chars_per_token == 0 || self.routing.max_backend_attempts == 0 {
            return Err(SwitchyardError::config(
                "chars_per_token and max_backend_attempts must be positive",
            ));
        }

        if self.supervisor.poll_interval_secs == 0 {
            return Err(SwitchyardError::config("Supervisor poll interval must be positive"));
        }
        let ids: HashSet<&str> = self.backends.iter().map(|b| b.id.as_str()).collect();
        let mut ordered = HashSet::new();
        for id in &self.supervisor.startup_order {
            if !ids.contains(id.as_str()) {
                return Err(SwitchyardError::config(format!(
                    "Startup order names unknown backend: {}",
                    id
                )));
            }
            if !ordered.insert(id.as_str()) {
                return Err(SwitchyardError::config(format!(
                    "Startup order lists backend {} twice",
                    id
                )));
            }
        }

        Ok(())
    }

    /// Backend ids in supervisor launch order
    pub fn startup_order(&self) -> Vec<String> {
        if self.supervisor.startup_order.is_empty() {
            self.backends.iter().map(|b| b.id.clone()).collect()
        } else {
            self.supervisor.startup_order.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FLEET: &str = r#"
device_groups:
  - id: gpus-0-3
    devices: [0, 1, 2, 3]
  - id: gpus-4-7
    devices: [4, 5, 6, 7]
backends:
  - id: glm-4.7
    endpoint: http://localhost:8000
    device_group: gpus-0-3
    max_context_tokens: 1048576
    specializations: [long-context, coding]
    throughput_class: medium
    aliases: [glm, coding]
  - id: minimax-m2.1
    endpoint: http://localhost:8001
    device_group: gpus-4-7
    max_context_tokens: 204800
    specializations: [fast, creative]
    throughput_class: high
    aliases: [minimax, m2, fast]
supervisor:
  startup_order: [glm-4.7, minimax-m2.1]
"#;

    #[test]
    fn test_config_defaults_applied() {
        let config = SwitchyardConfig::from_yaml_str(FLEET).unwrap();

        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.health.probe_interval_secs, 5);
        assert_eq!(config.health.degraded_after_failures, 3);
        assert_eq!(config.health.down_after_failures, 60);
        assert_eq!(config.admission.requests_per_minute, 60);
        assert_eq!(config.admission.tokens_per_minute, 100_000);
        assert_eq!(config.prefix_cache.scope, CacheScope::Session);
        assert_eq!(config.backends[1].throughput_class, ThroughputClass::High);
        assert_eq!(config.routing.task_rules[0].tag, "coding");
    }

    #[test]
    fn test_config_validation_rejects_alias_collision() {
        let yaml = FLEET.replace("aliases: [minimax, m2, fast]", "aliases: [glm]");
        let err = SwitchyardConfig::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, SwitchyardError::Config(_)));
    }

    #[test]
    fn test_config_validation_rejects_unknown_startup_entry() {
        let yaml = FLEET.replace("startup_order: [glm-4.7, minimax-m2.1]", "startup_order: [qwen]");
        assert!(SwitchyardConfig::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn test_config_validation_threshold_order() {
        let mut config = SwitchyardConfig::from_yaml_str(FLEET).unwrap();
        config.health.degraded_after_failures = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(FLEET.as_bytes()).unwrap();

        let config = SwitchyardConfig::from_file(file.path()).unwrap();
        assert_eq!(config.startup_order(), vec!["glm-4.7", "minimax-m2.1"]);
    }

    #[test]
    fn test_config_missing_file() {
        let err = SwitchyardConfig::from_file("/nonexistent/switchyard.yaml").unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
