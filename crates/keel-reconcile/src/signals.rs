//! Outbound collaborators: SLO signals and domain verification/TLS.
//!
//! Both sit behind object-safe async traits so the engine can run against
//! the state store (daemon) or scripted in-memory fakes (tests).

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use keel_rollout::SloSample;
use keel_state::{CustomDomain, StateStore, TlsState, VerificationState};

// ── SLO signals ────────────────────────────────────────────────────

#[async_trait]
pub trait SloSignals: Send + Sync {
    /// Worst reading for `release_id` over samples taken at or after
    /// `since`: the highest error rate and p99 of any single snapshot, with
    /// request counts summed. `None` when nothing was reported.
    async fn sample(
        &self,
        service_id: &str,
        release_id: &str,
        since: u64,
    ) -> anyhow::Result<Option<SloSample>>;
}

/// Reads the snapshots the metrics collaborator writes into the store.
#[derive(Clone)]
pub struct StoreSignals {
    store: StateStore,
}

impl StoreSignals {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SloSignals for StoreSignals {
    async fn sample(
        &self,
        service_id: &str,
        release_id: &str,
        since: u64,
    ) -> anyhow::Result<Option<SloSample>> {
        let snapshots = self.store.signals_since(service_id, release_id, since)?;
        if snapshots.is_empty() {
            return Ok(None);
        }

        // Each snapshot is judged on its own so a short breach is not
        // averaged away by earlier healthy traffic.
        let requests: u64 = snapshots.iter().map(|s| s.request_count).sum();
        let error_rate = snapshots
            .iter()
            .map(|s| s.error_rate)
            .fold(0.0_f64, f64::max);
        let p99_latency_ms = snapshots
            .iter()
            .map(|s| s.p99_latency_ms)
            .max()
            .unwrap_or_default();

        Ok(Some(SloSample {
            error_rate,
            p99_latency_ms,
            request_count: requests,
        }))
    }
}

// ── Domains ────────────────────────────────────────────────────────

#[async_trait]
pub trait DomainVerifier: Send + Sync {
    /// Whether ownership of the domain is currently proven.
    async fn check_verification(&self, domain: &CustomDomain) -> anyhow::Result<bool>;

    async fn tls_status(&self, domain: &CustomDomain) -> anyhow::Result<TlsState>;

    /// Ask the issuer for a certificate. Only called for verified domains.
    async fn request_tls(&self, domain: &CustomDomain, issuer: &str) -> anyhow::Result<()>;
}

/// Trusts the states recorded in the spec; used when no external domain
/// service is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordedDomains;

#[async_trait]
impl DomainVerifier for RecordedDomains {
    async fn check_verification(&self, domain: &CustomDomain) -> anyhow::Result<bool> {
        Ok(domain.verification == VerificationState::Verified)
    }

    async fn tls_status(&self, domain: &CustomDomain) -> anyhow::Result<TlsState> {
        Ok(domain.tls)
    }

    async fn request_tls(&self, domain: &CustomDomain, issuer: &str) -> anyhow::Result<()> {
        debug!(domain = %domain.domain, issuer, "certificate request left to the recorded state");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DomainOverrides {
    verified: BTreeMap<String, bool>,
    tls: BTreeMap<String, TlsState>,
    requests: Vec<(String, String)>,
}

/// Scriptable verifier. Domains without an override report their
/// recorded state.
#[derive(Debug, Default)]
pub struct MemoryDomains {
    inner: Mutex<DomainOverrides>,
}

impl MemoryDomains {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_verified(&self, domain: &str, verified: bool) {
        self.inner
            .lock()
            .await
            .verified
            .insert(domain.to_ascii_lowercase(), verified);
    }

    pub async fn set_tls(&self, domain: &str, tls: TlsState) {
        self.inner
            .lock()
            .await
            .tls
            .insert(domain.to_ascii_lowercase(), tls);
    }

    /// `(domain, issuer)` pairs passed to `request_tls`, in call order.
    pub async fn requests(&self) -> Vec<(String, String)> {
        self.inner.lock().await.requests.clone()
    }
}

#[async_trait]
impl DomainVerifier for MemoryDomains {
    async fn check_verification(&self, domain: &CustomDomain) -> anyhow::Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner
            .verified
            .get(&domain.domain.to_ascii_lowercase())
            .copied()
            .unwrap_or(domain.verification == VerificationState::Verified))
    }

    async fn tls_status(&self, domain: &CustomDomain) -> anyhow::Result<TlsState> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tls
            .get(&domain.domain.to_ascii_lowercase())
            .copied()
            .unwrap_or(domain.tls))
    }

    async fn request_tls(&self, domain: &CustomDomain, issuer: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let host = domain.domain.to_ascii_lowercase();
        inner.requests.push((host.clone(), issuer.to_string()));
        inner.tls.insert(host, TlsState::Requested);
        Ok(())
    }
}

/// Refresh verification and TLS state for every domain of a service.
///
/// Certificates are requested only once a domain is verified. A verifier
/// error keeps the recorded state for that domain.
pub async fn refresh_domains(
    verifier: &dyn DomainVerifier,
    domains: &[CustomDomain],
    default_issuer: &str,
) -> Vec<CustomDomain> {
    let mut refreshed = Vec::with_capacity(domains.len());
    for domain in domains {
        let mut next = domain.clone();

        match verifier.check_verification(domain).await {
            Ok(true) => next.verification = VerificationState::Verified,
            Ok(false) if domain.verification == VerificationState::Verified => {
                warn!(domain = %domain.domain, "domain lost verification");
                next.verification = VerificationState::PendingCheck;
            }
            Ok(false) => {}
            Err(e) => warn!(domain = %domain.domain, error = %e, "verification check failed"),
        }

        if next.verification == VerificationState::Verified {
            match verifier.tls_status(&next).await {
                Ok(tls) => next.tls = tls,
                Err(e) => warn!(domain = %domain.domain, error = %e, "TLS status check failed"),
            }
            if matches!(next.tls, TlsState::None | TlsState::Expired) {
                let issuer = next.issuer.as_deref().unwrap_or(default_issuer);
                match verifier.request_tls(&next, issuer).await {
                    Ok(()) => {
                        info!(domain = %domain.domain, issuer, "certificate requested");
                        next.tls = TlsState::Requested;
                    }
                    Err(e) => {
                        warn!(domain = %domain.domain, error = %e, "certificate request failed")
                    }
                }
            }
        }
        refreshed.push(next);
    }
    refreshed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::verified_domain;
    use keel_state::SignalSnapshot;

    fn unverified(host: &str) -> CustomDomain {
        CustomDomain {
            verification: VerificationState::Unverified,
            ..verified_domain(host)
        }
    }

    #[tokio::test]
    async fn tls_is_never_requested_before_verification() {
        let domains = MemoryDomains::new();
        let refreshed =
            refresh_domains(&domains, &[unverified("new.example.com")], "letsencrypt-prod").await;
        assert_eq!(refreshed[0].verification, VerificationState::Unverified);
        assert_eq!(refreshed[0].tls, TlsState::None);
        assert!(domains.requests().await.is_empty());

        domains.set_verified("new.example.com", true).await;
        let refreshed =
            refresh_domains(&domains, &[unverified("new.example.com")], "letsencrypt-prod").await;
        assert_eq!(refreshed[0].verification, VerificationState::Verified);
        assert_eq!(refreshed[0].tls, TlsState::Requested);
        assert_eq!(
            domains.requests().await,
            vec![("new.example.com".to_string(), "letsencrypt-prod".to_string())]
        );
    }

    #[tokio::test]
    async fn issued_certificates_are_not_requested_again() {
        let domains = MemoryDomains::new();
        domains.set_tls("www.example.com", TlsState::Issued).await;
        let refreshed =
            refresh_domains(&domains, &[verified_domain("www.example.com")], "issuer").await;
        assert_eq!(refreshed[0].tls, TlsState::Issued);
        assert!(domains.requests().await.is_empty());
    }

    #[tokio::test]
    async fn lost_verification_goes_back_to_pending() {
        let domains = MemoryDomains::new();
        domains.set_verified("api.example.com", false).await;
        let refreshed =
            refresh_domains(&domains, &[verified_domain("api.example.com")], "issuer").await;
        assert_eq!(refreshed[0].verification, VerificationState::PendingCheck);
    }

    #[tokio::test]
    async fn store_signals_aggregate_the_window() {
        let store = StateStore::open_in_memory().unwrap();
        for (epoch, error_rate, requests, p99) in
            [(900, 50.0, 10, 900), (1000, 1.0, 100, 120), (1010, 4.0, 300, 300)]
        {
            store
                .put_signal(&SignalSnapshot {
                    service_id: "shop/api".into(),
                    release_id: "r2".into(),
                    error_rate,
                    p99_latency_ms: p99,
                    request_count: requests,
                    epoch,
                })
                .unwrap();
        }
        let signals = StoreSignals::new(store);

        let sample = signals.sample("shop/api", "r2", 1000).await.unwrap().unwrap();
        assert_eq!(sample.request_count, 400);
        assert_eq!(sample.p99_latency_ms, 300);
        assert!((sample.error_rate - 4.0).abs() < 1e-9);

        assert!(signals.sample("shop/api", "r2", 2000).await.unwrap().is_none());
        assert!(signals.sample("shop/api", "r1", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn a_late_breach_is_not_diluted_by_healthy_traffic() {
        let store = StateStore::open_in_memory().unwrap();
        for (epoch, error_rate, requests) in [(1000, 0.0, 5000), (1030, 20.0, 500)] {
            store
                .put_signal(&SignalSnapshot {
                    service_id: "shop/api".into(),
                    release_id: "r2".into(),
                    error_rate,
                    p99_latency_ms: 80,
                    request_count: requests,
                    epoch,
                })
                .unwrap();
        }
        let signals = StoreSignals::new(store);

        let sample = signals.sample("shop/api", "r2", 1000).await.unwrap().unwrap();
        assert_eq!(sample.request_count, 5500);
        assert!((sample.error_rate - 20.0).abs() < 1e-9);
        assert!(
            keel_rollout::CanaryConfig::default()
                .breach(sample.error_rate, sample.p99_latency_ms)
                .is_some()
        );
    }
}
