//! Rollout controller — drives the rollout state machine.
//!
//! A promotion moves `Pending → CanaryPartial → Analyzing → Promoting →
//! Healthy`, or leaves analysis for `RollingBack → Failed` when the canary
//! breaches its SLO thresholds. A direct promotion skips straight to
//! `Promoting`. A manual rollback serves the chosen release immediately and
//! watches it in `Monitoring` until the window closes; a breach there
//! restores the release that was serving before the rollback.
//!
//! Time is always passed in as epoch seconds so that callers (and tests)
//! control it.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::strategy::{RollbackConfig, RolloutStrategy};

/// Current phase of a rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RolloutPhase {
    /// Rollout accepted but not started.
    Pending,
    /// Canary workload deployed; traffic shifts once it reports ready.
    CanaryPartial { weight: u32 },
    /// Canary receiving `weight` percent of traffic since `since`.
    Analyzing { weight: u32, since: u64 },
    /// All traffic moving to the target release.
    Promoting,
    /// Restored release serving; watched for breaches until `until`.
    Monitoring { until: u64 },
    /// Traffic returning to the previous release.
    RollingBack { reason: String },
    /// Completed successfully.
    Healthy,
    /// Rolled back; the previous release serves all traffic.
    Failed { reason: String },
}

impl RolloutPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Healthy | Self::Failed { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::CanaryPartial { .. } => "canary_partial",
            Self::Analyzing { .. } => "analyzing",
            Self::Promoting => "promoting",
            Self::Monitoring { .. } => "monitoring",
            Self::RollingBack { .. } => "rolling_back",
            Self::Healthy => "healthy",
            Self::Failed { .. } => "failed",
        }
    }
}

/// What started this rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RolloutKind {
    /// Operator promoted a new release.
    Promotion { strategy: RolloutStrategy },
    /// Operator rolled back to an earlier release.
    Rollback { monitor: RollbackConfig },
}

/// A point-in-time SLO reading for the release under observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SloSample {
    /// Error rate as a percentage (0-100).
    pub error_rate: f64,
    /// P99 latency in milliseconds.
    pub p99_latency_ms: u64,
    pub request_count: u64,
}

/// Facts the reconciler observed before calling [`Rollout::advance`].
#[derive(Debug, Clone, Default)]
pub struct Observation {
    /// The workload carrying the target release reports all replicas ready.
    pub target_ready: bool,
    /// The workload carrying the previous release reports all replicas ready.
    pub previous_ready: bool,
    /// Latest SLO sample for the target release, if the signal source had one.
    pub sample: Option<SloSample>,
    /// The target workload hit a state it will not recover from on its own
    /// (image pull failure, crash loop).
    pub target_failure: Option<String>,
}

/// Which workload track carries a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    Stable,
    Canary,
}

impl Track {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Canary => "canary",
        }
    }
}

/// Which release(s) should receive traffic in the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficShare {
    /// Only the release that was serving before the rollout.
    Previous,
    /// Only the rollout's target release.
    Target,
    /// Previous release on the stable track, target on the canary track.
    Split { canary_weight: u32 },
}

/// Action the reconciler must take after advancing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutAction {
    /// Apply the split with this canary weight, then advance again.
    ShiftTraffic { canary_weight: u32 },
    /// Target workload not ready yet; re-check after the readiness interval.
    AwaitReady,
    /// Nothing to do until `recheck_after_secs` have passed.
    Wait { recheck_after_secs: u64 },
    /// Move all traffic to the target release, then advance again.
    Promote,
    /// Move all traffic back to the previous release, then advance again.
    RestoreStable { reason: String },
    /// Rollout completed; the target release is now the deployed release.
    Finalize,
    /// Rollback completed; the previous release is the deployed release.
    Abort { reason: String },
    /// Terminal or not started.
    None,
}

/// A rollout in progress. Persisted with the service's reconciliation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollout {
    pub service_id: String,
    pub kind: RolloutKind,
    pub phase: RolloutPhase,
    /// Release serving before the rollout. `None` on first deploy.
    pub previous_release: Option<String>,
    pub target_release: String,
    /// Healthy samples seen in the current observation window.
    pub samples: u32,
    pub last_sample: Option<SloSample>,
    pub started_at: Option<u64>,
    pub updated_at: u64,
}

impl Rollout {
    /// Create a promotion of `target_release`.
    pub fn promotion(
        service_id: &str,
        strategy: RolloutStrategy,
        previous_release: Option<&str>,
        target_release: &str,
        now: u64,
    ) -> Self {
        Self::new(
            service_id,
            RolloutKind::Promotion { strategy },
            previous_release,
            target_release,
            now,
        )
    }

    /// Create a monitored rollback from `previous_release` to `target_release`.
    pub fn rollback(
        service_id: &str,
        monitor: RollbackConfig,
        previous_release: &str,
        target_release: &str,
        now: u64,
    ) -> Self {
        Self::new(
            service_id,
            RolloutKind::Rollback { monitor },
            Some(previous_release),
            target_release,
            now,
        )
    }

    fn new(
        service_id: &str,
        kind: RolloutKind,
        previous_release: Option<&str>,
        target_release: &str,
        now: u64,
    ) -> Self {
        Self {
            service_id: service_id.to_string(),
            kind,
            phase: RolloutPhase::Pending,
            previous_release: previous_release.map(str::to_string),
            target_release: target_release.to_string(),
            samples: 0,
            last_sample: None,
            started_at: None,
            updated_at: now,
        }
    }

    /// Start the rollout.
    pub fn start(&mut self, now: u64) {
        if self.phase != RolloutPhase::Pending {
            return;
        }
        self.started_at = Some(now);
        self.updated_at = now;

        let previous = self.previous_release.clone();
        let next = match &self.kind {
            RolloutKind::Promotion {
                strategy: RolloutStrategy::Canary(cfg),
            } if previous.is_some() => {
                info!(
                    service = %self.service_id,
                    release = %self.target_release,
                    weight = cfg.traffic_percent,
                    "started canary rollout"
                );
                RolloutPhase::CanaryPartial {
                    weight: cfg.traffic_percent,
                }
            }
            RolloutKind::Promotion { .. } => {
                info!(
                    service = %self.service_id,
                    release = %self.target_release,
                    "started direct rollout"
                );
                RolloutPhase::Promoting
            }
            RolloutKind::Rollback { monitor } => {
                info!(
                    service = %self.service_id,
                    release = %self.target_release,
                    monitor_secs = monitor.monitor_secs,
                    "started rollback"
                );
                RolloutPhase::Monitoring {
                    until: now + monitor.monitor_secs,
                }
            }
        };
        self.phase = next;
    }

    /// Advance the rollout by one step.
    ///
    /// `ShiftTraffic`, `Promote` and `RestoreStable` change the traffic
    /// plan; the caller applies the new plan and advances again in the
    /// same pass. Every other action ends the pass.
    pub fn advance(&mut self, observation: &Observation, now: u64) -> RolloutAction {
        self.updated_at = now;
        if let Some(sample) = observation.sample {
            self.last_sample = Some(sample);
        }

        match self.phase.clone() {
            RolloutPhase::Pending => {
                self.start(now);
                self.advance(observation, now)
            }

            RolloutPhase::Healthy | RolloutPhase::Failed { .. } => RolloutAction::None,

            RolloutPhase::CanaryPartial { .. }
            | RolloutPhase::Analyzing { .. }
            | RolloutPhase::Promoting
            | RolloutPhase::Monitoring { .. }
                if observation.target_failure.is_some() =>
            {
                let failure = observation.target_failure.clone().unwrap_or_default();
                let reason = format!("release {} cannot start: {failure}", self.target_release);
                self.roll_back(reason)
            }

            RolloutPhase::CanaryPartial { weight } => {
                if !observation.target_ready {
                    debug!(service = %self.service_id, "canary not ready, holding traffic");
                    return RolloutAction::AwaitReady;
                }
                self.samples = 0;
                self.phase = RolloutPhase::Analyzing { weight, since: now };
                info!(
                    service = %self.service_id,
                    weight,
                    "canary ready, shifting traffic"
                );
                RolloutAction::ShiftTraffic {
                    canary_weight: weight,
                }
            }

            RolloutPhase::Analyzing { since, .. } => {
                let RolloutKind::Promotion {
                    strategy: RolloutStrategy::Canary(cfg),
                } = &self.kind
                else {
                    return self.roll_back("analysis without a canary strategy".to_string());
                };
                let cfg = cfg.clone();

                if let Some(sample) = observation.sample {
                    if let Some(reason) = cfg.breach(sample.error_rate, sample.p99_latency_ms) {
                        return self.roll_back(format!("canary failed: {reason}"));
                    }
                    self.samples += 1;
                }

                let deadline = since + cfg.analysis_secs;
                if now >= deadline {
                    if self.samples == 0 {
                        return self
                            .roll_back("no SLO signals during analysis window".to_string());
                    }
                    self.phase = RolloutPhase::Promoting;
                    info!(
                        service = %self.service_id,
                        samples = self.samples,
                        "canary passed, promoting"
                    );
                    return RolloutAction::Promote;
                }

                RolloutAction::Wait {
                    recheck_after_secs: cfg.check_interval_secs.min(deadline - now).max(1),
                }
            }

            RolloutPhase::Promoting => {
                if !observation.target_ready {
                    return RolloutAction::AwaitReady;
                }
                self.phase = RolloutPhase::Healthy;
                info!(
                    service = %self.service_id,
                    release = %self.target_release,
                    "rollout completed"
                );
                RolloutAction::Finalize
            }

            RolloutPhase::Monitoring { until } => {
                let RolloutKind::Rollback { monitor } = &self.kind else {
                    return self.roll_back("monitoring outside a rollback".to_string());
                };
                let monitor = monitor.clone();

                if let Some(sample) = observation.sample {
                    if let Some(reason) = monitor.breach(sample.error_rate, sample.p99_latency_ms)
                    {
                        return self.roll_back(format!("rollback target failed: {reason}"));
                    }
                    self.samples += 1;
                }

                if !observation.target_ready {
                    return RolloutAction::AwaitReady;
                }
                if now >= until {
                    self.phase = RolloutPhase::Healthy;
                    info!(
                        service = %self.service_id,
                        release = %self.target_release,
                        "rollback monitoring window closed"
                    );
                    return RolloutAction::Finalize;
                }
                RolloutAction::Wait {
                    recheck_after_secs: monitor.check_interval_secs.min(until - now).max(1),
                }
            }

            RolloutPhase::RollingBack { reason } => {
                if self.previous_release.is_some() && !observation.previous_ready {
                    return RolloutAction::AwaitReady;
                }
                self.phase = RolloutPhase::Failed {
                    reason: reason.clone(),
                };
                info!(service = %self.service_id, %reason, "rollback completed");
                RolloutAction::Abort { reason }
            }
        }
    }

    fn roll_back(&mut self, reason: String) -> RolloutAction {
        warn!(
            service = %self.service_id,
            release = %self.target_release,
            %reason,
            "rolling back"
        );
        self.phase = RolloutPhase::RollingBack {
            reason: reason.clone(),
        };
        RolloutAction::RestoreStable { reason }
    }

    /// Stop a rollout that can no longer make progress, without restoring
    /// traffic. The caller owns putting the previous release back.
    pub fn abandon(&mut self, reason: impl Into<String>, now: u64) {
        if self.phase.is_terminal() {
            return;
        }
        let reason = reason.into();
        warn!(
            service = %self.service_id,
            release = %self.target_release,
            phase = self.phase.name(),
            %reason,
            "rollout abandoned"
        );
        self.updated_at = now;
        self.phase = RolloutPhase::Failed { reason };
    }

    /// Which release(s) take traffic in the current phase.
    pub fn traffic(&self) -> TrafficShare {
        match &self.phase {
            RolloutPhase::Pending => {
                if self.previous_release.is_some() {
                    TrafficShare::Previous
                } else {
                    TrafficShare::Target
                }
            }
            RolloutPhase::CanaryPartial { .. } => TrafficShare::Split { canary_weight: 0 },
            RolloutPhase::Analyzing { weight, .. } => TrafficShare::Split {
                canary_weight: *weight,
            },
            RolloutPhase::Promoting | RolloutPhase::Monitoring { .. } | RolloutPhase::Healthy => {
                TrafficShare::Target
            }
            RolloutPhase::RollingBack { .. } | RolloutPhase::Failed { .. } => {
                if self.previous_release.is_some() {
                    TrafficShare::Previous
                } else {
                    TrafficShare::Target
                }
            }
        }
    }

    /// The track whose workload runs the target release.
    pub fn target_track(&self) -> Track {
        match self.traffic() {
            TrafficShare::Split { .. } => Track::Canary,
            _ => Track::Stable,
        }
    }

    /// The release that is deployed once this rollout is terminal.
    pub fn settled_release(&self) -> Option<&str> {
        match &self.phase {
            RolloutPhase::Healthy => Some(&self.target_release),
            RolloutPhase::Failed { .. } => self.previous_release.as_deref(),
            _ => None,
        }
    }

    pub fn is_rollback(&self) -> bool {
        matches!(self.kind, RolloutKind::Rollback { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::CanaryConfig;

    fn healthy_sample() -> SloSample {
        SloSample {
            error_rate: 0.5,
            p99_latency_ms: 50,
            request_count: 1000,
        }
    }

    fn ready() -> Observation {
        Observation {
            target_ready: true,
            previous_ready: true,
            sample: Some(healthy_sample()),
            target_failure: None,
        }
    }

    fn canary(cfg: CanaryConfig) -> Rollout {
        Rollout::promotion(
            "proj/api",
            RolloutStrategy::Canary(cfg),
            Some("r1"),
            "r2",
            1000,
        )
    }

    #[test]
    fn direct_rollout_waits_for_readiness() {
        let mut rollout =
            Rollout::promotion("proj/api", RolloutStrategy::Direct, Some("r1"), "r2", 1000);
        assert_eq!(rollout.traffic(), TrafficShare::Previous);

        rollout.start(1000);
        assert_eq!(rollout.phase, RolloutPhase::Promoting);
        assert_eq!(rollout.traffic(), TrafficShare::Target);

        let not_ready = Observation::default();
        assert_eq!(rollout.advance(&not_ready, 1010), RolloutAction::AwaitReady);
        assert_eq!(rollout.advance(&ready(), 1040), RolloutAction::Finalize);
        assert_eq!(rollout.phase, RolloutPhase::Healthy);
        assert_eq!(rollout.settled_release(), Some("r2"));
    }

    #[test]
    fn canary_without_previous_release_is_direct() {
        let mut rollout = Rollout::promotion(
            "proj/api",
            RolloutStrategy::Canary(CanaryConfig::default()),
            None,
            "r1",
            1000,
        );
        rollout.start(1000);
        assert_eq!(rollout.phase, RolloutPhase::Promoting);
    }

    #[test]
    fn canary_promotes_after_window() {
        let mut rollout = canary(CanaryConfig {
            analysis_secs: 60,
            check_interval_secs: 30,
            ..Default::default()
        });
        rollout.start(1000);
        assert_eq!(rollout.phase, RolloutPhase::CanaryPartial { weight: 10 });
        assert_eq!(rollout.traffic(), TrafficShare::Split { canary_weight: 0 });
        assert_eq!(rollout.target_track(), Track::Canary);

        assert_eq!(
            rollout.advance(&ready(), 1000),
            RolloutAction::ShiftTraffic { canary_weight: 10 }
        );
        assert_eq!(rollout.traffic(), TrafficShare::Split { canary_weight: 10 });

        assert_eq!(
            rollout.advance(&ready(), 1000),
            RolloutAction::Wait {
                recheck_after_secs: 30
            }
        );
        assert_eq!(
            rollout.advance(&ready(), 1030),
            RolloutAction::Wait {
                recheck_after_secs: 30
            }
        );
        assert_eq!(rollout.advance(&ready(), 1060), RolloutAction::Promote);
        assert_eq!(rollout.phase, RolloutPhase::Promoting);
        assert_eq!(rollout.target_track(), Track::Stable);
        assert_eq!(rollout.advance(&ready(), 1060), RolloutAction::Finalize);
        assert_eq!(rollout.samples, 3);
    }

    #[test]
    fn canary_holds_traffic_until_ready() {
        let mut rollout = canary(CanaryConfig::default());
        rollout.start(1000);
        let not_ready = Observation {
            target_ready: false,
            previous_ready: true,
            sample: None,
            target_failure: None,
        };
        assert_eq!(rollout.advance(&not_ready, 1005), RolloutAction::AwaitReady);
        assert_eq!(rollout.traffic(), TrafficShare::Split { canary_weight: 0 });
    }

    #[test]
    fn canary_rollback_on_high_error_rate() {
        let mut rollout = canary(CanaryConfig {
            error_rate_threshold: 2.0,
            ..Default::default()
        });
        rollout.start(1000);
        rollout.advance(&ready(), 1000);

        let bad = Observation {
            sample: Some(SloSample {
                error_rate: 3.0,
                ..healthy_sample()
            }),
            ..ready()
        };
        let action = rollout.advance(&bad, 1030);
        assert!(matches!(action, RolloutAction::RestoreStable { .. }));
        assert!(matches!(rollout.phase, RolloutPhase::RollingBack { .. }));
        assert_eq!(rollout.traffic(), TrafficShare::Previous);

        let action = rollout.advance(&ready(), 1030);
        assert!(matches!(action, RolloutAction::Abort { .. }));
        assert_eq!(rollout.settled_release(), Some("r1"));
    }

    #[test]
    fn canary_rollback_on_high_latency() {
        let mut rollout = canary(CanaryConfig {
            latency_threshold_ms: 100,
            ..Default::default()
        });
        rollout.start(1000);
        rollout.advance(&ready(), 1000);

        let slow = Observation {
            sample: Some(SloSample {
                p99_latency_ms: 200,
                ..healthy_sample()
            }),
            ..ready()
        };
        assert!(matches!(
            rollout.advance(&slow, 1010),
            RolloutAction::RestoreStable { .. }
        ));
    }

    #[test]
    fn missing_signals_roll_back() {
        let mut rollout = canary(CanaryConfig {
            analysis_secs: 60,
            ..Default::default()
        });
        rollout.start(1000);
        rollout.advance(&ready(), 1000);

        let silent = Observation {
            sample: None,
            ..ready()
        };
        let action = rollout.advance(&silent, 1060);
        match action {
            RolloutAction::RestoreStable { reason } => assert!(reason.contains("no SLO signals")),
            other => panic!("expected RestoreStable, got {other:?}"),
        }
    }

    #[test]
    fn rollback_monitoring_finishes_after_window() {
        let mut rollout = Rollout::rollback(
            "proj/api",
            RollbackConfig {
                monitor_secs: 120,
                ..Default::default()
            },
            "r2",
            "r1",
            1000,
        );
        rollout.start(1000);
        assert_eq!(rollout.phase, RolloutPhase::Monitoring { until: 1120 });
        assert_eq!(rollout.traffic(), TrafficShare::Target);

        assert_eq!(
            rollout.advance(&ready(), 1100),
            RolloutAction::Wait {
                recheck_after_secs: 20
            }
        );
        assert_eq!(rollout.advance(&ready(), 1120), RolloutAction::Finalize);
        assert_eq!(rollout.settled_release(), Some("r1"));
    }

    #[test]
    fn rollback_breach_restores_previous() {
        let mut rollout =
            Rollout::rollback("proj/api", RollbackConfig::default(), "r2", "r1", 1000);
        rollout.start(1000);

        let bad = Observation {
            sample: Some(SloSample {
                error_rate: 50.0,
                ..healthy_sample()
            }),
            ..ready()
        };
        assert!(matches!(
            rollout.advance(&bad, 1010),
            RolloutAction::RestoreStable { .. }
        ));
        assert!(matches!(rollout.advance(&ready(), 1010), RolloutAction::Abort { .. }));
        assert_eq!(rollout.settled_release(), Some("r2"));
    }

    #[test]
    fn terminal_phases_do_nothing() {
        let mut rollout =
            Rollout::promotion("proj/api", RolloutStrategy::Direct, None, "r1", 1000);
        rollout.start(1000);
        rollout.advance(&ready(), 1001);
        assert!(rollout.phase.is_terminal());
        assert_eq!(rollout.advance(&ready(), 1002), RolloutAction::None);
    }

    #[test]
    fn serializes_with_phase_tag() {
        let mut rollout = canary(CanaryConfig::default());
        rollout.start(1000);
        let json = serde_json::to_value(&rollout).unwrap();
        assert_eq!(json["phase"]["phase"], "canary_partial");
        let back: Rollout = serde_json::from_value(json).unwrap();
        assert_eq!(back, rollout);
    }

    #[test]
    fn unstartable_target_rolls_back_from_any_active_phase() {
        let crashing = Observation {
            target_failure: Some("CrashLoopBackOff".to_string()),
            ..ready()
        };

        let mut rollout = canary(CanaryConfig::default());
        rollout.start(1000);
        match rollout.advance(&crashing, 1005) {
            RolloutAction::RestoreStable { reason } => {
                assert!(reason.contains("release r2 cannot start"));
                assert!(reason.contains("CrashLoopBackOff"));
            }
            other => panic!("expected RestoreStable, got {other:?}"),
        }
        assert_eq!(rollout.traffic(), TrafficShare::Previous);
        assert!(matches!(rollout.advance(&ready(), 1006), RolloutAction::Abort { .. }));
        assert_eq!(rollout.settled_release(), Some("r1"));

        let mut direct =
            Rollout::promotion("proj/api", RolloutStrategy::Direct, Some("r1"), "r2", 1000);
        direct.start(1000);
        assert!(matches!(
            direct.advance(&crashing, 1001),
            RolloutAction::RestoreStable { .. }
        ));
    }

    #[test]
    fn abandon_fails_without_touching_terminal_rollouts() {
        let mut rollout = canary(CanaryConfig::default());
        rollout.start(1000);
        rollout.abandon("spec became invalid", 1020);
        assert_eq!(
            rollout.phase,
            RolloutPhase::Failed {
                reason: "spec became invalid".to_string()
            }
        );
        assert_eq!(rollout.updated_at, 1020);
        assert_eq!(rollout.settled_release(), Some("r1"));

        let mut done = Rollout::promotion("proj/api", RolloutStrategy::Direct, None, "r1", 1000);
        done.start(1000);
        done.advance(&ready(), 1001);
        done.abandon("late", 1002);
        assert_eq!(done.phase, RolloutPhase::Healthy);
    }
}
