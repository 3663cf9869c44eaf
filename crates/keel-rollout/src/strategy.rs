//! Rollout strategies — direct replacement, canary, monitored rollback.

use serde::{Deserialize, Serialize};

/// How to roll out a new release of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RolloutStrategy {
    /// Replace the running release with a rolling update. Default.
    #[default]
    Direct,
    /// Route a percentage of traffic to the new release and analyze it first.
    Canary(CanaryConfig),
}

impl RolloutStrategy {
    pub fn is_canary(&self) -> bool {
        matches!(self, Self::Canary(_))
    }
}

/// Configuration for canary deployments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanaryConfig {
    /// Percentage of traffic to route to the canary (1-99).
    pub traffic_percent: u32,
    /// Seconds the canary must stay within thresholds before promotion.
    pub analysis_secs: u64,
    /// Seconds between SLO checks while analyzing.
    pub check_interval_secs: u64,
    /// Error rate threshold (percentage). Rollback if exceeded.
    pub error_rate_threshold: f64,
    /// Latency threshold in milliseconds. Rollback if p99 exceeds this.
    pub latency_threshold_ms: u64,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            traffic_percent: 10,
            analysis_secs: 300,
            check_interval_secs: 30,
            error_rate_threshold: 5.0,
            latency_threshold_ms: 1000,
        }
    }
}

impl CanaryConfig {
    /// Problems that make the configuration unusable; empty when valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !(1..=99).contains(&self.traffic_percent) {
            problems.push(format!(
                "canary traffic_percent must be within 1..=99, got {}",
                self.traffic_percent
            ));
        }
        if self.analysis_secs == 0 {
            problems.push("canary analysis_secs must be positive".to_string());
        }
        if self.check_interval_secs == 0 {
            problems.push("canary check_interval_secs must be positive".to_string());
        }
        if !self.error_rate_threshold.is_finite() || self.error_rate_threshold < 0.0 {
            problems.push(format!(
                "canary error_rate_threshold must be a non-negative number, got {}",
                self.error_rate_threshold
            ));
        }
        problems
    }

    /// Returns a reason if the sample violates either threshold.
    pub fn breach(&self, error_rate: f64, p99_latency_ms: u64) -> Option<String> {
        breach(
            self.error_rate_threshold,
            self.latency_threshold_ms,
            error_rate,
            p99_latency_ms,
        )
    }
}

/// Monitoring applied after a manual rollback to an earlier release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// Seconds the restored release is watched after it is serving.
    pub monitor_secs: u64,
    pub check_interval_secs: u64,
    pub error_rate_threshold: f64,
    pub latency_threshold_ms: u64,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            monitor_secs: 600,
            check_interval_secs: 30,
            error_rate_threshold: 5.0,
            latency_threshold_ms: 1000,
        }
    }
}

impl RollbackConfig {
    pub fn breach(&self, error_rate: f64, p99_latency_ms: u64) -> Option<String> {
        breach(
            self.error_rate_threshold,
            self.latency_threshold_ms,
            error_rate,
            p99_latency_ms,
        )
    }
}

fn breach(
    error_threshold: f64,
    latency_threshold_ms: u64,
    error_rate: f64,
    p99_latency_ms: u64,
) -> Option<String> {
    if error_rate > error_threshold {
        return Some(format!(
            "error rate {error_rate:.1}% above threshold {error_threshold:.1}%"
        ));
    }
    if p99_latency_ms > latency_threshold_ms {
        return Some(format!(
            "p99 latency {p99_latency_ms}ms above threshold {latency_threshold_ms}ms"
        ));
    }
    None
}
