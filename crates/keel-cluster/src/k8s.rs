//! KubeCluster — [`ResourceClient`] backed by a Kubernetes API server.
//!
//! Writes go through server-side apply under one field manager. Every
//! object carries the engine's own rendering in the `keel.dev/resource`
//! annotation, so reads decode back to the same [`Resource`]. Live replica
//! count, image and status are overlaid from the object so drift stays
//! visible to the planner.
//!
//! Weighted routing is expressed the ingress-nginx way: the main Ingress
//! points at the stable backend and a companion `{name}-canary` Ingress
//! carries the canary backend and its weight.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ContainerStatus, Namespace, Pod};
use kube::Client;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
};
use kube::core::GroupVersionKind;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use keel_state::ScalingMetric;

use crate::client::{ClusterError, ClusterResult, ResourceClient};
use crate::resource::*;

/// Annotation holding the engine-owned JSON of the object.
pub const RESOURCE_ANNOTATION: &str = "keel.dev/resource";
/// Marks the generated canary Ingress; such objects are not listed.
const COMPANION_ANNOTATION: &str = "keel.dev/companion-of";
const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
const REPLICAS_OWNER: &str = "keel.dev/replicas-owner";
const CANARY_SUFFIX: &str = "-canary";
/// Restarts after which a crash-looping container is treated as broken.
const CRASH_LOOP_RESTARTS: i32 = 5;

fn api_resource(kind: ResourceKind) -> ApiResource {
    let (group, version, name, plural) = match kind {
        ResourceKind::Workload => ("apps", "v1", "Deployment", "deployments"),
        ResourceKind::Exposure => ("", "v1", "Service", "services"),
        ResourceKind::Routing => ("networking.k8s.io", "v1", "Ingress", "ingresses"),
        ResourceKind::VolumeClaim => {
            ("", "v1", "PersistentVolumeClaim", "persistentvolumeclaims")
        }
        ResourceKind::Autoscaler => (
            "autoscaling",
            "v2",
            "HorizontalPodAutoscaler",
            "horizontalpodautoscalers",
        ),
        ResourceKind::NetworkPolicy => {
            ("networking.k8s.io", "v1", "NetworkPolicy", "networkpolicies")
        }
    };
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(group, version, name), plural)
}

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    field_manager: String,
}

impl KubeCluster {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    /// Connect with the in-cluster service account or the local kubeconfig.
    pub async fn try_default(field_manager: impl Into<String>) -> ClusterResult<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Unavailable(format!("kubernetes client: {e}")))?;
        Ok(Self::new(client, field_manager))
    }

    fn api(&self, kind: ResourceKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &api_resource(kind))
    }

    fn apply_params(&self) -> PatchParams {
        PatchParams::apply(&self.field_manager).force()
    }

    /// Decode a live object and attach what only the pods can tell.
    async fn observe(&self, kind: ResourceKind, obj: DynamicObject) -> ClusterResult<Resource> {
        let namespace = obj.metadata.namespace.clone().unwrap_or_default();
        let name = obj.metadata.name.clone().unwrap_or_default();
        let Some(mut resource) = decode(kind, &obj) else {
            return Err(ClusterError::Invalid(format!(
                "{kind} {namespace}/{name} exists but was not written by keel"
            )));
        };
        if let ResourceSpec::Workload(w) = &resource.spec {
            resource.status.failure = self.workload_failure(&namespace, &w.selector).await;
        }
        Ok(resource)
    }

    /// First pod of the workload stuck in a state it will not leave on
    /// its own. Pod listing errors are logged and treated as healthy.
    async fn workload_failure(&self, namespace: &str, selector: &LabelSelector) -> Option<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&selector_string(selector));
        let list = match pods.list(&params).await {
            Ok(list) => list,
            Err(e) => {
                warn!(%namespace, error = %e, "pod status unavailable");
                return None;
            }
        };
        list.items.iter().find_map(|pod| {
            let status = pod.status.as_ref()?;
            status
                .init_container_statuses
                .iter()
                .flatten()
                .chain(status.container_statuses.iter().flatten())
                .find_map(container_failure)
        })
    }

    /// Keep the companion canary Ingress in step with a routing resource.
    async fn sync_companion(&self, resource: &Resource) -> ClusterResult<()> {
        let api = self.api(ResourceKind::Routing, &resource.meta.namespace);
        let name = format!("{}{CANARY_SUFFIX}", resource.meta.name);
        match render_canary(resource) {
            Some(manifest) => {
                api.patch(&name, &self.apply_params(), &Patch::Apply(&manifest))
                    .await
                    .map_err(|e| {
                        map_error(ResourceKind::Routing, &resource.meta.namespace, &name, 0, e)
                    })?;
                debug!(namespace = %resource.meta.namespace, %name, "canary ingress applied");
            }
            None => match api.delete(&name, &DeleteParams::background()).await {
                Ok(_) => {
                    debug!(namespace = %resource.meta.namespace, %name, "canary ingress removed")
                }
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => {
                    return Err(map_error(
                        ResourceKind::Routing,
                        &resource.meta.namespace,
                        &name,
                        0,
                        e,
                    ));
                }
            },
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceClient for KubeCluster {
    async fn create(&self, resource: Resource) -> ClusterResult<Resource> {
        let kind = resource.kind();
        let (namespace, name) = (resource.meta.namespace.clone(), resource.meta.name.clone());
        let obj: DynamicObject = serde_json::from_value(render(&resource, None))
            .map_err(|e| ClusterError::Invalid(format!("{kind} {namespace}/{name}: {e}")))?;
        let created = self
            .api(kind, &namespace)
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_error(kind, &namespace, &name, 0, e))?;
        if kind == ResourceKind::Routing {
            self.sync_companion(&resource).await?;
        }
        debug!(%kind, %namespace, %name, "created");
        self.observe(kind, created).await
    }

    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Option<Resource>> {
        let obj = self
            .api(kind, namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_error(kind, namespace, name, 0, e))?;
        match obj {
            Some(obj) => Ok(Some(self.observe(kind, obj).await?)),
            None => Ok(None),
        }
    }

    async fn update(&self, resource: Resource) -> ClusterResult<Resource> {
        let kind = resource.kind();
        let (namespace, name) = (resource.meta.namespace.clone(), resource.meta.name.clone());
        let expected = resource.meta.resource_version;
        let manifest = render(&resource, Some(expected));
        let updated = self
            .api(kind, &namespace)
            .patch(&name, &self.apply_params(), &Patch::Apply(&manifest))
            .await
            .map_err(|e| map_error(kind, &namespace, &name, expected, e))?;
        if kind == ResourceKind::Routing {
            self.sync_companion(&resource).await?;
        }
        debug!(%kind, %namespace, %name, "applied");
        self.observe(kind, updated).await
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> ClusterResult<()> {
        self.api(kind, namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| map_error(kind, namespace, name, 0, e))?;
        if kind == ResourceKind::Routing {
            let companion = format!("{name}{CANARY_SUFFIX}");
            match self
                .api(kind, namespace)
                .delete(&companion, &DeleteParams::background())
                .await
            {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => warn!(%namespace, %companion, error = %e, "canary ingress not removed"),
            }
        }
        debug!(%kind, %namespace, %name, "deleted");
        Ok(())
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &LabelSelector,
    ) -> ClusterResult<Vec<Resource>> {
        let params = ListParams::default().labels(&selector_string(selector));
        let list = self
            .api(kind, namespace)
            .list(&params)
            .await
            .map_err(|e| map_error(kind, namespace, "", 0, e))?;
        let mut resources = Vec::with_capacity(list.items.len());
        for obj in list.items {
            let companion = obj
                .metadata
                .annotations
                .as_ref()
                .is_some_and(|a| a.contains_key(COMPANION_ANNOTATION));
            if companion {
                continue;
            }
            match self.observe(kind, obj).await {
                Ok(resource) => resources.push(resource),
                Err(e) => debug!(%kind, %namespace, error = %e, "skipping object"),
            }
        }
        Ok(resources)
    }

    async fn ensure_namespace(&self, namespace: &str) -> ClusterResult<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let unavailable =
            |e: kube::Error| ClusterError::Unavailable(format!("namespace {namespace}: {e}"));
        if api.get_opt(namespace).await.map_err(unavailable)?.is_some() {
            return Ok(false);
        }
        let ns: Namespace = serde_json::from_value(json!({
            "metadata": {
                "name": namespace,
                "labels": { MANAGED_BY: "keel" },
            }
        }))
        .map_err(|e| ClusterError::Invalid(format!("namespace {namespace}: {e}")))?;
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                info!(%namespace, "namespace created");
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(unavailable(e)),
        }
    }
}

fn map_error(
    kind: ResourceKind,
    namespace: &str,
    name: &str,
    expected: u64,
    err: kube::Error,
) -> ClusterError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            ClusterError::AlreadyExists {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(ae) if ae.code == 409 => ClusterError::Conflict {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
            expected,
            actual: 0,
        },
        kube::Error::Api(ae) if ae.code == 400 || ae.code == 422 => {
            ClusterError::Invalid(format!("{kind} {namespace}/{name}: {}", ae.message))
        }
        other => ClusterError::Unavailable(other.to_string()),
    }
}

fn selector_string(selector: &LabelSelector) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

// ── Pod states ─────────────────────────────────────────────────────

fn container_failure(status: &ContainerStatus) -> Option<String> {
    let waiting = status.state.as_ref()?.waiting.as_ref()?;
    let reason = waiting.reason.as_deref()?;
    let message = waiting.message.as_deref().unwrap_or_default();
    fatal_state(&status.name, reason, message, status.restart_count)
}

/// Waiting states that need a new image or configuration to clear.
pub fn fatal_state(
    container: &str,
    reason: &str,
    message: &str,
    restarts: i32,
) -> Option<String> {
    let lower = message.to_ascii_lowercase();
    match reason {
        "ImagePullBackOff" | "ErrImagePull" => {
            let cause = if ["401", "unauthorized", "403", "forbidden"]
                .iter()
                .any(|m| lower.contains(m))
            {
                "registry credentials rejected"
            } else if lower.contains("not found") || lower.contains("manifest unknown") {
                "image not found"
            } else {
                "image could not be pulled"
            };
            Some(format!("{container}: {reason}: {cause}"))
        }
        "InvalidImageName" => Some(format!("{container}: invalid image name")),
        "CreateContainerConfigError" => {
            Some(format!("{container}: container configuration error: {message}"))
        }
        "CrashLoopBackOff" if restarts >= CRASH_LOOP_RESTARTS => Some(format!(
            "{container}: crash looping after {restarts} restarts"
        )),
        _ => None,
    }
}

// ── Decoding ───────────────────────────────────────────────────────

/// Rebuild the engine's view of a live object. `None` for objects keel
/// did not write.
fn decode(kind: ResourceKind, obj: &DynamicObject) -> Option<Resource> {
    let encoded = obj.metadata.annotations.as_ref()?.get(RESOURCE_ANNOTATION)?;
    let mut resource: Resource = serde_json::from_str(encoded).ok()?;
    if resource.kind() != kind {
        return None;
    }
    resource.meta.uid = obj.metadata.uid.clone();
    resource.meta.resource_version = obj
        .metadata
        .resource_version
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or_default();

    let data = &obj.data;
    match &mut resource.spec {
        ResourceSpec::Workload(w) => {
            if let Some(replicas) = data["spec"]["replicas"].as_u64() {
                w.replicas = u32::try_from(replicas).unwrap_or(u32::MAX);
            }
            let image = &data["spec"]["template"]["spec"]["containers"][0]["image"];
            if let Some(image) = image.as_str() {
                w.container.image = image.to_string();
            }
            resource.status.ready_replicas = data["status"]["readyReplicas"]
                .as_u64()
                .and_then(|r| u32::try_from(r).ok())
                .unwrap_or_default();
        }
        ResourceSpec::VolumeClaim(_) => {
            resource.status.bound = data["status"]["phase"].as_str() == Some("Bound");
            resource.status.volume_handle =
                data["spec"]["volumeName"].as_str().map(str::to_string);
        }
        _ => {}
    }
    Some(resource)
}

// ── Rendering ──────────────────────────────────────────────────────

/// Kubernetes manifest for a resource. `resource_version` makes the write
/// conditional on the object not having changed since it was read.
fn render(resource: &Resource, resource_version: Option<u64>) -> Value {
    let ar = api_resource(resource.kind());
    let mut owned = resource.clone();
    owned.meta.uid = None;
    owned.meta.resource_version = 0;
    owned.status = ResourceStatus::default();

    let mut annotations = resource.meta.annotations.clone();
    annotations.insert(
        RESOURCE_ANNOTATION.to_string(),
        serde_json::to_string(&owned).unwrap_or_default(),
    );
    let mut metadata = json!({
        "name": resource.meta.name,
        "namespace": resource.meta.namespace,
        "labels": resource.meta.labels,
        "annotations": annotations,
    });
    if let Some(version) = resource_version {
        metadata["resourceVersion"] = json!(version.to_string());
    }

    let mut manifest = json!({
        "apiVersion": ar.api_version,
        "kind": ar.kind,
        "metadata": metadata,
    });
    let body = match &resource.spec {
        ResourceSpec::Workload(w) => json!({ "spec": deployment_spec(w, &resource.meta) }),
        ResourceSpec::Exposure(e) => json!({ "spec": {
            "selector": e.selector,
            "ports": e.ports.iter().map(|p| json!({
                "name": p.name,
                "port": p.port,
                "targetPort": p.target_port,
                "protocol": p.protocol,
            })).collect::<Vec<_>>(),
        }}),
        ResourceSpec::Routing(r) => json!({ "spec": ingress_spec(r, 0) }),
        ResourceSpec::VolumeClaim(c) => json!({ "spec": {
            "accessModes": c.access_modes,
            "storageClassName": c.storage_class,
            "resources": { "requests": { "storage": c.size } },
        }}),
        ResourceSpec::Autoscaler(a) => json!({ "spec": {
            "scaleTargetRef": { "apiVersion": "apps/v1", "kind": "Deployment", "name": a.target },
            "minReplicas": a.min_replicas,
            "maxReplicas": a.max_replicas,
            "metrics": [autoscaler_metric(a)],
        }}),
        ResourceSpec::NetworkPolicy(p) => json!({ "spec": policy_spec(p) }),
    };
    merge(&mut manifest, body);
    manifest
}

fn merge(target: &mut Value, body: Value) {
    if let (Some(target), Value::Object(body)) = (target.as_object_mut(), body) {
        target.extend(body);
    }
}

fn deployment_spec(w: &WorkloadSpec, meta: &ObjectMeta) -> Value {
    let c = &w.container;
    let env: Vec<Value> = c
        .env
        .iter()
        .map(|e| match &e.secret_ref {
            Some(secret) => json!({
                "name": e.name,
                "valueFrom": { "secretKeyRef": { "name": secret.name, "key": secret.key } },
            }),
            None => json!({ "name": e.name, "value": e.value.clone().unwrap_or_default() }),
        })
        .collect();

    let mut container = json!({
        "name": c.name,
        "image": c.image,
        "ports": c.ports.iter().map(|p| json!({
            "name": p.name,
            "containerPort": p.container_port,
            "protocol": p.protocol,
        })).collect::<Vec<_>>(),
        "env": env,
        "resources": { "requests": c.resources.requests, "limits": c.resources.limits },
        "volumeMounts": c.volume_mounts.iter().map(|m| json!({
            "name": m.name,
            "mountPath": m.mount_path,
        })).collect::<Vec<_>>(),
    });
    if let Some(probe) = &c.liveness {
        container["livenessProbe"] = probe_json(probe);
    }
    if let Some(probe) = &c.readiness {
        container["readinessProbe"] = probe_json(probe);
    }

    let strategy = match &w.strategy {
        UpdateStrategy::RollingUpdate {
            max_surge,
            max_unavailable,
        } => json!({
            "type": "RollingUpdate",
            "rollingUpdate": { "maxSurge": max_surge, "maxUnavailable": max_unavailable },
        }),
        UpdateStrategy::Recreate => json!({ "type": "Recreate" }),
    };

    let mut spec = json!({
        "selector": { "matchLabels": w.selector },
        "strategy": strategy,
        "template": {
            "metadata": { "labels": w.template_labels },
            "spec": {
                "containers": [container],
                "volumes": w.volumes.iter().map(|v| json!({
                    "name": v.name,
                    "persistentVolumeClaim": { "claimName": v.claim_name },
                })).collect::<Vec<_>>(),
                "imagePullSecrets": w.image_pull_secrets.iter()
                    .map(|s| json!({ "name": s }))
                    .collect::<Vec<_>>(),
            },
        },
    });
    // The autoscaler owns the replica count once it exists.
    if !meta.annotations.contains_key(REPLICAS_OWNER) {
        spec["replicas"] = json!(w.replicas);
    }
    spec
}

fn probe_json(probe: &Probe) -> Value {
    json!({
        "httpGet": { "path": probe.path, "port": probe.port },
        "initialDelaySeconds": probe.initial_delay_secs,
        "timeoutSeconds": probe.timeout_secs,
        "periodSeconds": probe.period_secs,
        "failureThreshold": probe.failure_threshold,
    })
}

/// Ingress spec using backend `index` of every path; paths without that
/// backend are left out.
fn ingress_spec(r: &RoutingSpec, index: usize) -> Value {
    let rules: Vec<Value> = r
        .rules
        .iter()
        .filter_map(|rule| {
            let paths: Vec<Value> = rule
                .paths
                .iter()
                .filter_map(|p| {
                    let backend = p.backends.get(index)?;
                    Some(json!({
                        "path": p.path,
                        "pathType": p.path_type,
                        "backend": { "service": {
                            "name": backend.service,
                            "port": { "number": backend.port },
                        }},
                    }))
                })
                .collect();
            (!paths.is_empty()).then(|| json!({ "host": rule.host, "http": { "paths": paths } }))
        })
        .collect();
    let tls: Vec<Value> = r
        .tls
        .iter()
        .map(|t| json!({ "hosts": t.hosts, "secretName": t.secret_name }))
        .collect();
    json!({ "ingressClassName": r.ingress_class, "rules": rules, "tls": tls })
}

/// Companion Ingress for the canary backend, or `None` when no path is
/// split.
fn render_canary(resource: &Resource) -> Option<Value> {
    let routing = resource.as_routing()?;
    let weight = routing
        .rules
        .iter()
        .flat_map(|r| r.paths.iter())
        .find_map(|p| p.backends.get(1))?
        .weight;

    let mut annotations: BTreeMap<String, String> = resource.meta.annotations.clone();
    annotations.insert("nginx.ingress.kubernetes.io/canary".into(), "true".into());
    annotations.insert(
        "nginx.ingress.kubernetes.io/canary-weight".into(),
        weight.to_string(),
    );
    annotations.insert(COMPANION_ANNOTATION.into(), resource.meta.name.clone());

    let mut spec = ingress_spec(routing, 1);
    // TLS stays on the main Ingress.
    spec["tls"] = json!([]);
    Some(json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": {
            "name": format!("{}{CANARY_SUFFIX}", resource.meta.name),
            "namespace": resource.meta.namespace,
            "labels": resource.meta.labels,
            "annotations": annotations,
        },
        "spec": spec,
    }))
}

fn autoscaler_metric(a: &AutoscalerSpec) -> Value {
    let utilization = |name: &str| {
        json!({
            "type": "Resource",
            "resource": {
                "name": name,
                "target": { "type": "Utilization", "averageUtilization": a.target_value },
            },
        })
    };
    match a.metric {
        ScalingMetric::Cpu => utilization("cpu"),
        ScalingMetric::Memory => utilization("memory"),
        ScalingMetric::RequestsPerSecond => json!({
            "type": "Pods",
            "pods": {
                "metric": { "name": "http_requests_per_second" },
                "target": { "type": "AverageValue", "averageValue": a.target_value.to_string() },
            },
        }),
    }
}

fn policy_spec(p: &NetworkPolicySpec) -> Value {
    let rules: Vec<Value> = p
        .rules
        .iter()
        .map(|rule| {
            let peers: Vec<Value> = rule.peers.iter().map(peer_json).collect();
            let ports: Vec<Value> = rule
                .ports
                .iter()
                .map(|port| json!({ "port": port.port, "protocol": port.protocol }))
                .collect();
            let mut out = Map::new();
            if !peers.is_empty() {
                let key = match p.direction {
                    PolicyDirection::Ingress => "from",
                    PolicyDirection::Egress => "to",
                };
                out.insert(key.to_string(), Value::Array(peers));
            }
            if !ports.is_empty() {
                out.insert("ports".to_string(), Value::Array(ports));
            }
            Value::Object(out)
        })
        .collect();
    let (policy_type, key) = match p.direction {
        PolicyDirection::Ingress => ("Ingress", "ingress"),
        PolicyDirection::Egress => ("Egress", "egress"),
    };
    let mut spec = json!({
        "podSelector": { "matchLabels": p.pod_selector },
        "policyTypes": [policy_type],
    });
    spec[key] = Value::Array(rules);
    spec
}

fn peer_json(peer: &PolicyPeer) -> Value {
    let namespace = |name: &str| {
        json!({ "matchLabels": { "kubernetes.io/metadata.name": name } })
    };
    match peer {
        PolicyPeer::Namespace { name } => json!({ "namespaceSelector": namespace(name) }),
        PolicyPeer::NamespacePods { name, pods } => json!({
            "namespaceSelector": namespace(name),
            "podSelector": { "matchLabels": pods },
        }),
        PolicyPeer::IpBlock { cidr } => json!({ "ipBlock": { "cidr": cidr } }),
    }
}
