//! Resolved engine settings, built from `keel.toml`.

use std::time::Duration;

use keel_core::KeelConfig;
use keel_rollout::{CanaryConfig, RollbackConfig};

use crate::dispatcher::Backoff;
use crate::manifest::ComposeOptions;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub workers: usize,
    pub resync_interval: Duration,
    pub readiness_recheck: Duration,
    pub domain_recheck: Duration,
    pub shutdown_timeout: Duration,
    pub backoff: Backoff,
    pub max_attempts: u32,
    pub conflict_retries: u32,
    /// Canary parameters used when a promotion asks for the defaults.
    pub canary: CanaryConfig,
    pub rollback: RollbackConfig,
    pub compose: ComposeOptions,
    pub status_cache_capacity: usize,
    /// Traffic-plan changes one pass may apply before yielding.
    pub max_steps_per_pass: u32,
}

impl EngineSettings {
    pub fn from_config(config: &KeelConfig) -> Self {
        let canary = CanaryConfig {
            traffic_percent: config.canary.traffic_percent,
            analysis_secs: config.analysis_window().as_secs(),
            check_interval_secs: config.check_interval().as_secs().max(1),
            error_rate_threshold: config.canary.error_rate_threshold,
            latency_threshold_ms: config.canary.latency_threshold_ms,
        };
        let rollback = RollbackConfig {
            monitor_secs: config.monitor_window().as_secs(),
            check_interval_secs: canary.check_interval_secs,
            error_rate_threshold: canary.error_rate_threshold,
            latency_threshold_ms: canary.latency_threshold_ms,
        };
        Self {
            workers: config.engine.workers,
            resync_interval: config.resync_interval(),
            readiness_recheck: config.readiness_recheck(),
            domain_recheck: config.domain_recheck(),
            shutdown_timeout: config.shutdown_timeout(),
            backoff: Backoff {
                base: config.base_backoff(),
                max: config.max_backoff(),
                jitter: config.jitter(),
            },
            max_attempts: config.retry.max_attempts,
            conflict_retries: config.retry.conflict_retries,
            canary,
            rollback,
            compose: ComposeOptions {
                ingress_class: config.routing.ingress_class.clone(),
                default_issuer: config.routing.default_tls_issuer.clone(),
                default_storage_class: config.storage.default_storage_class.clone(),
                network_policies: config.network.policies,
                ingress_namespaces: config.network.ingress_namespaces.clone(),
                egress_namespaces: config.network.egress_namespaces.clone(),
            },
            status_cache_capacity: config.state.status_cache_capacity,
            max_steps_per_pass: 8,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&KeelConfig::default())
    }
}
