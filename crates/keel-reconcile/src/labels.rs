//! Labels and annotations the engine stamps on managed resources.

use std::collections::BTreeMap;

use keel_cluster::LabelSelector;
use keel_rollout::Track;

pub const APP: &str = "app";
pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGER: &str = "keel";
pub const PROJECT: &str = "keel.dev/project";
pub const SERVICE: &str = "keel.dev/service";
pub const TRACK: &str = "keel.dev/track";
pub const RELEASE: &str = "keel.dev/release";

pub const RELEASE_VERSION: &str = "keel.dev/release-version";
pub const SOURCE_REVISION: &str = "keel.dev/source-revision";
/// Present when an autoscaler owns the workload's replica count.
pub const REPLICAS_OWNER: &str = "keel.dev/replicas-owner";

/// Labels shared by every resource of a service. Also the selector used to
/// find them again.
pub fn managed(project: &str, service: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP.to_string(), service.to_string()),
        (MANAGED_BY.to_string(), MANAGER.to_string()),
        (PROJECT.to_string(), project.to_string()),
        (SERVICE.to_string(), service.to_string()),
    ])
}

pub fn service_selector(project: &str, service: &str) -> LabelSelector {
    managed(project, service)
}

/// Pods of every track of a service.
pub fn pod_selector(service: &str) -> LabelSelector {
    BTreeMap::from([
        (APP.to_string(), service.to_string()),
        (SERVICE.to_string(), service.to_string()),
    ])
}

/// Pod selector for one track. Never changes for the life of the workload.
pub fn track_selector(service: &str, track: Track) -> LabelSelector {
    BTreeMap::from([
        (APP.to_string(), service.to_string()),
        (SERVICE.to_string(), service.to_string()),
        (TRACK.to_string(), track.as_str().to_string()),
    ])
}

/// Name of a service's workload/exposure on a track.
pub fn track_name(service: &str, track: Track) -> String {
    match track {
        Track::Stable => service.to_string(),
        Track::Canary => format!("{service}-canary"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_names_and_selectors() {
        assert_eq!(track_name("api", Track::Stable), "api");
        assert_eq!(track_name("api", Track::Canary), "api-canary");
        let selector = track_selector("api", Track::Canary);
        assert_eq!(selector.get(TRACK).map(String::as_str), Some("canary"));
        assert!(!selector.contains_key(RELEASE));
    }

    #[test]
    fn managed_labels_select_everything_of_a_service() {
        let labels = managed("shop", "api");
        assert_eq!(labels.get(MANAGED_BY).map(String::as_str), Some("keel"));
        assert_eq!(service_selector("shop", "api"), labels);
    }
}
