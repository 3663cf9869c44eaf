//! keel.toml configuration parser.
//!
//! Every section is optional; missing keys fall back to the engine
//! defaults. Durations are strings such as `"30s"` or `"5m"` and are
//! checked once at load time by [`KeelConfig::validate`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeelConfig {
    pub engine: EngineConfig,
    pub retry: RetryConfig,
    pub canary: CanaryDefaults,
    pub rollback: RollbackDefaults,
    pub routing: RoutingConfig,
    pub storage: StorageConfig,
    pub network: NetworkConfig,
    pub cluster: ClusterConfig,
    pub state: StateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of long-lived reconcile workers.
    pub workers: usize,
    /// Period of the full resync that re-enqueues every known service.
    pub resync_interval: String,
    /// Delay before re-checking a workload that is not ready yet.
    pub readiness_recheck: String,
    /// Delay before re-checking hosts held pending on verification or TLS.
    pub domain_recheck: String,
    /// Grace period for in-flight work on shutdown.
    pub shutdown_timeout: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            resync_interval: "30s".to_string(),
            readiness_recheck: "30s".to_string(),
            domain_recheck: "1m".to_string(),
            shutdown_timeout: "30s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub base_backoff: String,
    pub max_backoff: String,
    /// Attempts before a service is marked failed with "retries exhausted".
    pub max_attempts: u32,
    /// Upper bound of the random jitter added to each backoff.
    pub jitter: String,
    /// Re-read/retry rounds for a single optimistic-concurrency conflict.
    pub conflict_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_backoff: "1s".to_string(),
            max_backoff: "5m".to_string(),
            max_attempts: 8,
            jitter: "500ms".to_string(),
            conflict_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CanaryDefaults {
    pub traffic_percent: u32,
    pub analysis_window: String,
    pub check_interval: String,
    /// Error rate threshold in percent.
    pub error_rate_threshold: f64,
    pub latency_threshold_ms: u64,
}

impl Default for CanaryDefaults {
    fn default() -> Self {
        Self {
            traffic_percent: 10,
            analysis_window: "5m".to_string(),
            check_interval: "30s".to_string(),
            error_rate_threshold: 5.0,
            latency_threshold_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RollbackDefaults {
    pub monitor_window: String,
}

impl Default for RollbackDefaults {
    fn default() -> Self {
        Self {
            monitor_window: "10m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoutingConfig {
    pub ingress_class: String,
    pub default_tls_issuer: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            ingress_class: "nginx".to_string(),
            default_tls_issuer: "letsencrypt-prod".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub default_storage_class: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default_storage_class: "standard".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Emit per-service ingress and egress network policies.
    pub policies: bool,
    /// Namespaces whose pods may reach services (the ingress controller).
    pub ingress_namespaces: Vec<String>,
    /// Namespaces services may reach besides their own and DNS.
    pub egress_namespaces: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            policies: true,
            ingress_namespaces: vec!["ingress-nginx".to_string()],
            egress_namespaces: Vec::new(),
        }
    }
}

/// Where resources are written.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterBackend {
    /// The Kubernetes API server from the in-cluster account or kubeconfig.
    #[default]
    Kubernetes,
    /// An in-process cluster; nothing leaves the daemon.
    DryRun,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    pub backend: ClusterBackend,
    /// Server-side apply field manager.
    pub field_manager: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            backend: ClusterBackend::Kubernetes,
            field_manager: "keel".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StateConfig {
    pub data_dir: PathBuf,
    /// Entries kept in the status reporter's in-memory cache.
    pub status_cache_capacity: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/keel"),
            status_cache_capacity: 1024,
        }
    }
}

impl KeelConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: KeelConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (key, value) in [
            ("engine.resync_interval", &self.engine.resync_interval),
            ("engine.readiness_recheck", &self.engine.readiness_recheck),
            ("engine.domain_recheck", &self.engine.domain_recheck),
            ("engine.shutdown_timeout", &self.engine.shutdown_timeout),
            ("retry.base_backoff", &self.retry.base_backoff),
            ("retry.max_backoff", &self.retry.max_backoff),
            ("retry.jitter", &self.retry.jitter),
            ("canary.analysis_window", &self.canary.analysis_window),
            ("canary.check_interval", &self.canary.check_interval),
            ("rollback.monitor_window", &self.rollback.monitor_window),
        ] {
            parse_duration(value).map_err(|e| anyhow::anyhow!("{key}: {e}"))?;
        }

        if self.engine.workers == 0 {
            anyhow::bail!("engine.workers must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if !(1..=99).contains(&self.canary.traffic_percent) {
            anyhow::bail!(
                "canary.traffic_percent must be between 1 and 99, got {}",
                self.canary.traffic_percent
            );
        }
        for (key, value) in [
            ("canary.analysis_window", &self.canary.analysis_window),
            ("canary.check_interval", &self.canary.check_interval),
        ] {
            if parse_duration(value)?.as_secs() == 0 {
                anyhow::bail!("{key} must be at least 1s");
            }
        }
        if self.canary.error_rate_threshold < 0.0 {
            anyhow::bail!("canary.error_rate_threshold must not be negative");
        }
        if self.cluster.field_manager.trim().is_empty() {
            anyhow::bail!("cluster.field_manager must not be empty");
        }
        if self.state.status_cache_capacity == 0 {
            anyhow::bail!("state.status_cache_capacity must be at least 1");
        }
        Ok(())
    }

    // ── Resolved durations ─────────────────────────────────────────

    pub fn resync_interval(&self) -> Duration {
        duration_or(&self.engine.resync_interval, 30)
    }

    pub fn readiness_recheck(&self) -> Duration {
        duration_or(&self.engine.readiness_recheck, 30)
    }

    pub fn domain_recheck(&self) -> Duration {
        duration_or(&self.engine.domain_recheck, 60)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        duration_or(&self.engine.shutdown_timeout, 30)
    }

    pub fn base_backoff(&self) -> Duration {
        duration_or(&self.retry.base_backoff, 1)
    }

    pub fn max_backoff(&self) -> Duration {
        duration_or(&self.retry.max_backoff, 300)
    }

    pub fn jitter(&self) -> Duration {
        parse_duration(&self.retry.jitter).unwrap_or(Duration::from_millis(500))
    }

    pub fn analysis_window(&self) -> Duration {
        duration_or(&self.canary.analysis_window, 300)
    }

    pub fn check_interval(&self) -> Duration {
        duration_or(&self.canary.check_interval, 30)
    }

    pub fn monitor_window(&self) -> Duration {
        duration_or(&self.rollback.monitor_window, 600)
    }
}

fn duration_or(value: &str, default_secs: u64) -> Duration {
    parse_duration(value).unwrap_or(Duration::from_secs(default_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = KeelConfig::from_toml_str("").unwrap();
        assert_eq!(config, KeelConfig::default());
        assert_eq!(config.engine.workers, 5);
        assert_eq!(config.resync_interval(), Duration::from_secs(30));
        assert_eq!(config.analysis_window(), Duration::from_secs(300));
        assert_eq!(config.monitor_window(), Duration::from_secs(600));
        assert_eq!(config.routing.default_tls_issuer, "letsencrypt-prod");
        assert_eq!(config.storage.default_storage_class, "standard");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = KeelConfig::from_toml_str(
            r#"
[engine]
workers = 12

[canary]
traffic_percent = 25
analysis_window = "10m"
"#,
        )
        .unwrap();
        assert_eq!(config.engine.workers, 12);
        assert_eq!(config.engine.resync_interval, "30s");
        assert_eq!(config.canary.traffic_percent, 25);
        assert_eq!(config.analysis_window(), Duration::from_secs(600));
        assert_eq!(config.canary.latency_threshold_ms, 1000);
    }

    #[test]
    fn rejects_bad_duration() {
        let err = KeelConfig::from_toml_str(
            r#"
[retry]
max_backoff = "forever"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("retry.max_backoff"));
    }

    #[test]
    fn rejects_zero_workers_and_bad_weight() {
        assert!(KeelConfig::from_toml_str("[engine]\nworkers = 0\n").is_err());
        assert!(KeelConfig::from_toml_str("[canary]\ntraffic_percent = 100\n").is_err());
    }

    #[test]
    fn rejects_zero_canary_windows() {
        let err = KeelConfig::from_toml_str("[canary]\nanalysis_window = \"0s\"\n").unwrap_err();
        assert!(err.to_string().contains("canary.analysis_window"));
        assert!(KeelConfig::from_toml_str("[canary]\ncheck_interval = \"0s\"\n").is_err());
    }

    #[test]
    fn cluster_and_network_sections() {
        let config = KeelConfig::default();
        assert_eq!(config.cluster.backend, ClusterBackend::Kubernetes);
        assert!(config.network.policies);
        assert_eq!(config.network.ingress_namespaces, vec!["ingress-nginx"]);

        let config = KeelConfig::from_toml_str(
            r#"
[cluster]
backend = "dry-run"

[network]
policies = false
egress_namespaces = ["data"]
"#,
        )
        .unwrap();
        assert_eq!(config.cluster.backend, ClusterBackend::DryRun);
        assert_eq!(config.cluster.field_manager, "keel");
        assert!(!config.network.policies);
        assert_eq!(config.network.egress_namespaces, vec!["data"]);
    }

    #[test]
    fn toml_roundtrip_and_file_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.toml");
        let mut config = KeelConfig::default();
        config.routing.ingress_class = "traefik".to_string();
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = KeelConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
