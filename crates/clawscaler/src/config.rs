//! Daemon configuration.
//!
//! Configuration for the clawscaler daemon, including:
//! - Where policies are loaded from
//! - The metric source (Prometheus or in-memory)
//! - The workload control plane (HTTP or in-memory dry run)
//! - Reconciliation timing and conflict handling
//! - The status/metrics listener

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use claw_autoscaler::{ConflictPolicy, ReconcilerConfig};
use claw_metrics::PrometheusConfig;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScalerError};

/// Default Prometheus URL inside the cluster.
pub const DEFAULT_PROMETHEUS_URL: &str = "http://prometheus-service.monitoring.svc.cluster.local:9090";

/// Default status/metrics listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9464";

/// Where metrics are read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    /// A Prometheus-compatible HTTP API.
    Prometheus(PrometheusConfig),
    /// An empty in-memory store (dry runs and tests).
    InMemory,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::Prometheus(PrometheusConfig::new(DEFAULT_PROMETHEUS_URL))
    }
}

/// Where replica counts are read and written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlPlaneConfig {
    /// An HTTP replica API.
    Http {
        /// Base URL.
        base_url: String,
        /// Optional bearer token.
        #[serde(default)]
        bearer_token: Option<String>,
        /// Request timeout in seconds.
        #[serde(default = "default_request_timeout_secs")]
        timeout_secs: u64,
    },
    /// In-memory replica counts; nothing leaves the process.
    InMemory {
        /// Initial replicas per workload. Unlisted workloads start at their minimum.
        #[serde(default)]
        replicas: BTreeMap<String, u32>,
    },
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self::InMemory {
            replicas: BTreeMap::new(),
        }
    }
}

/// Decision history settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Keep past decisions per workload.
    pub enabled: bool,
    /// How many past decisions to keep.
    pub capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: 100,
        }
    }
}

const fn default_request_timeout_secs() -> u64 {
    10
}

const fn default_period_secs() -> u64 {
    15
}

const fn default_deadline_factor() -> u32 {
    2
}

const fn default_backoff_base_ms() -> u64 {
    1_000
}

const fn default_query_timeout_secs() -> u64 {
    10
}

const fn default_stale_factor() -> u32 {
    3
}

fn default_listen_addr() -> Option<SocketAddr> {
    DEFAULT_LISTEN_ADDR.parse().ok()
}

/// Main daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Path of the policy document.
    pub policies_path: PathBuf,
    /// Metric source.
    #[serde(default)]
    pub source: SourceConfig,
    /// Workload control plane.
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
    /// Reconciliation period in seconds.
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    /// Tick deadline as a multiple of the period.
    #[serde(default = "default_deadline_factor")]
    pub deadline_factor: u32,
    /// First retry delay after a metric source failure, in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Per-query timeout in seconds.
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    /// A workload is reported stale after this many periods without success.
    #[serde(default = "default_stale_factor")]
    pub stale_after_periods: u32,
    /// Decision history.
    #[serde(default)]
    pub history: HistoryConfig,
    /// Reaction to manual replica overrides.
    #[serde(default)]
    pub on_conflict: ConflictPolicy,
    /// Status/metrics listener; `null` disables it.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: Option<SocketAddr>,
    /// Emit logs as JSON.
    #[serde(default)]
    pub json_logs: bool,
}

impl DaemonConfig {
    /// Creates a config with defaults for everything but the policy path.
    #[must_use]
    pub fn new(policies_path: impl Into<PathBuf>) -> Self {
        Self {
            policies_path: policies_path.into(),
            source: SourceConfig::default(),
            control_plane: ControlPlaneConfig::default(),
            period_secs: default_period_secs(),
            deadline_factor: default_deadline_factor(),
            backoff_base_ms: default_backoff_base_ms(),
            query_timeout_secs: default_query_timeout_secs(),
            stale_after_periods: default_stale_factor(),
            history: HistoryConfig::default(),
            on_conflict: ConflictPolicy::default(),
            listen_addr: default_listen_addr(),
            json_logs: false,
        }
    }

    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ScalerError::config(format!(
                "failed to read config file '{}': {e}",
                path.display()
            ))
        })?;

        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| ScalerError::config(format!("invalid JSON: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ScalerError::config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, json + "\n")?;
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.policies_path.as_os_str().is_empty() {
            return Err(ScalerError::config("policies_path cannot be empty"));
        }

        if self.period_secs == 0 {
            return Err(ScalerError::config("period_secs must be non-zero"));
        }

        if self.deadline_factor == 0 {
            return Err(ScalerError::config("deadline_factor must be non-zero"));
        }

        if self.query_timeout_secs == 0 {
            return Err(ScalerError::config("query_timeout_secs must be non-zero"));
        }

        if self.history.enabled && self.history.capacity == 0 {
            return Err(ScalerError::config(
                "history.capacity must be non-zero when history is enabled",
            ));
        }

        if let SourceConfig::Prometheus(prometheus) = &self.source {
            check_url("source.url", &prometheus.url)?;
        }

        if let ControlPlaneConfig::Http { base_url, .. } = &self.control_plane {
            check_url("control_plane.base_url", base_url)?;
        }

        Ok(())
    }

    /// Reconciliation period.
    #[must_use]
    pub const fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    /// Per-query timeout.
    #[must_use]
    pub const fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    /// Age after which a workload without a successful tick is stale.
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        self.period().saturating_mul(self.stale_after_periods.max(1))
    }

    /// Reconciler settings derived from this config.
    #[must_use]
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            period: self.period(),
            deadline_factor: self.deadline_factor,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            history_capacity: self.history.enabled.then_some(self.history.capacity),
            on_conflict: self.on_conflict,
        }
    }
}

fn check_url(field: &str, url: &str) -> Result<()> {
    if url.trim().is_empty() {
        return Err(ScalerError::config(format!("{field} cannot be empty")));
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ScalerError::config(format!(
            "{field} must start with http:// or https://"
        )));
    }
    Ok(())
}
