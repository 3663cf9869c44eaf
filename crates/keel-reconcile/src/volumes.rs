//! Volume lifecycle: claims are created once, reused by every later
//! release, and removed only when the service itself is deleted.

use std::sync::Arc;

use tracing::{debug, info, warn};

use keel_cluster::{ClusterError, LabelSelector, Resource, ResourceClient, ResourceKind};
use keel_state::Volume;

/// Claim backing `volume` of `service`. Stable across releases.
pub fn claim_name(service: &str, volume: &str) -> String {
    format!("{service}-{volume}")
}

/// Any volume that only one writer may mount at a time.
pub fn requires_exclusive_access(volumes: &[Volume]) -> bool {
    volumes.iter().any(|v| v.access_mode.is_exclusive())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Created { uid: Option<String> },
    Existing { uid: Option<String> },
    Failed { error: ClusterError },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimReport {
    pub name: String,
    pub outcome: ClaimOutcome,
    /// Current platform copy, when known.
    pub resource: Option<Resource>,
}

impl ClaimReport {
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, ClaimOutcome::Failed { .. })
    }
}

pub struct VolumeManager {
    client: Arc<dyn ResourceClient>,
}

impl VolumeManager {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self { client }
    }

    /// Make sure every desired claim exists. Existing claims are never
    /// modified, so their data survives release changes. Each claim is
    /// handled independently; one failure does not stop the others.
    pub async fn ensure(&self, claims: &[Resource]) -> Vec<ClaimReport> {
        let mut reports = Vec::with_capacity(claims.len());
        for claim in claims {
            reports.push(self.ensure_one(claim).await);
        }
        reports
    }

    async fn ensure_one(&self, claim: &Resource) -> ClaimReport {
        let name = claim.meta.name.clone();
        let namespace = &claim.meta.namespace;

        match self
            .client
            .get(ResourceKind::VolumeClaim, namespace, &name)
            .await
        {
            Ok(Some(existing)) => {
                debug!(claim = %name, uid = ?existing.meta.uid, "claim already exists");
                return ClaimReport {
                    name,
                    outcome: ClaimOutcome::Existing {
                        uid: existing.meta.uid.clone(),
                    },
                    resource: Some(existing),
                };
            }
            Ok(None) => {}
            Err(error) => {
                warn!(claim = %name, %error, "failed to read claim");
                return ClaimReport {
                    name,
                    outcome: ClaimOutcome::Failed { error },
                    resource: None,
                };
            }
        }

        match self.client.create(claim.clone()).await {
            Ok(created) => {
                info!(claim = %name, uid = ?created.meta.uid, "claim created");
                ClaimReport {
                    name,
                    outcome: ClaimOutcome::Created {
                        uid: created.meta.uid.clone(),
                    },
                    resource: Some(created),
                }
            }
            // Lost a race with another writer; their claim is ours to reuse.
            Err(ClusterError::AlreadyExists { .. }) => {
                let existing = self
                    .client
                    .get(ResourceKind::VolumeClaim, namespace, &name)
                    .await
                    .ok()
                    .flatten();
                ClaimReport {
                    name,
                    outcome: ClaimOutcome::Existing {
                        uid: existing.as_ref().and_then(|r| r.meta.uid.clone()),
                    },
                    resource: existing,
                }
            }
            Err(error) => {
                warn!(claim = %name, %error, "failed to create claim");
                ClaimReport {
                    name,
                    outcome: ClaimOutcome::Failed { error },
                    resource: None,
                }
            }
        }
    }

    /// Delete every claim matching `selector`. Only called on service deletion.
    pub async fn delete_all(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<u32, ClusterError> {
        let claims = self
            .client
            .list(ResourceKind::VolumeClaim, namespace, selector)
            .await?;
        let mut deleted = 0;
        for claim in claims {
            match self
                .client
                .delete(ResourceKind::VolumeClaim, namespace, &claim.meta.name)
                .await
            {
                Ok(()) => {
                    info!(claim = %claim.meta.name, "claim deleted");
                    deleted += 1;
                }
                Err(ClusterError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }
}
