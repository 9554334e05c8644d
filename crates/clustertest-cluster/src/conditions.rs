//! Named checks built on [`WaitCondition`].
//!
//! Every constructor captures what it needs (a store handle, an object
//! reference, the expected value) and returns a condition that performs one
//! fetch per call. Drive them with [`clustertest_common::poll`].

use std::sync::Arc;

use clustertest_app::render::{APP_API_VERSION, APP_KIND};
use clustertest_common::store::get_opt;
use clustertest_common::{Error, ErrorKind, ObjectRef, ObjectStore, Result, Selector, WaitCondition};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::DynamicObject;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::credentials::{bootstrap_kubeconfig, ClusterConnector};

/// apiVersion of Cluster API clusters
pub const CAPI_API_VERSION: &str = "cluster.x-k8s.io/v1beta1";
/// Kind of Cluster API clusters
pub const CAPI_CLUSTER_KIND: &str = "Cluster";
/// Release status of a successfully installed App
pub const DEPLOYED: &str = "deployed";

/// The Cluster API object backing a workload cluster
pub fn capi_cluster_ref(cluster: &str, namespace: &str) -> ObjectRef {
    ObjectRef::namespaced(CAPI_API_VERSION, CAPI_CLUSTER_KIND, namespace, cluster)
}

/// An App CR
pub fn app_ref(name: &str, namespace: &str) -> ObjectRef {
    ObjectRef::namespaced(APP_API_VERSION, APP_KIND, namespace, name)
}

fn typed<K: DeserializeOwned>(object: DynamicObject) -> Result<K> {
    let kind = object
        .types
        .as_ref()
        .map(|t| t.kind.clone())
        .unwrap_or_default();
    let value = serde_json::to_value(object)?;
    serde_json::from_value(value).map_err(|e| Error::serialization_for_kind(kind, e.to_string()))
}

/// Satisfied once `target` no longer exists.
///
/// Transient API errors count as "still there" so a flaky API server does
/// not abort a deletion wait.
pub fn resource_gone(store: Arc<dyn ObjectStore>, target: ObjectRef) -> WaitCondition {
    WaitCondition::new(format!("{} to be deleted", target), move || {
        let store = store.clone();
        let target = target.clone();
        async move {
            match store.get(&target).await {
                Ok(object) => {
                    let finalizers = object.metadata.finalizers.unwrap_or_default();
                    debug!(object = %target, finalizers = ?finalizers, "Still exists");
                    Ok(false)
                }
                Err(e) if e.is_not_found() => {
                    debug!(object = %target, "No longer exists");
                    Ok(true)
                }
                Err(e) if e.is_transient() => {
                    debug!(object = %target, error = %e, "Unable to check if object still exists");
                    Ok(false)
                }
                Err(e) => Err(e.into()),
            }
        }
    })
}

/// Satisfied once `target` exists
pub fn resource_exists(store: Arc<dyn ObjectStore>, target: ObjectRef) -> WaitCondition {
    WaitCondition::new(format!("{} to exist", target), move || {
        let store = store.clone();
        let target = target.clone();
        async move {
            let found = get_opt(store.as_ref(), &target).await?.is_some();
            if !found {
                debug!(object = %target, "Waiting for object to be created");
            }
            Ok(found)
        }
    })
}

/// Available and desired replica counts of a workload object
fn replica_counts(object: DynamicObject) -> Result<Option<(i32, i32)>> {
    let kind = object.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default();
    let counts = match kind.as_str() {
        "Deployment" => {
            let d: Deployment = typed(object)?;
            let desired = d.spec.and_then(|s| s.replicas).unwrap_or(1);
            let available = d.status.and_then(|s| s.available_replicas).unwrap_or(0);
            Some((available, desired))
        }
        "StatefulSet" => {
            let s: StatefulSet = typed(object)?;
            let desired = s.spec.and_then(|s| s.replicas).unwrap_or(1);
            let available = s.status.and_then(|s| s.available_replicas).unwrap_or(0);
            Some((available, desired))
        }
        "DaemonSet" => {
            let d: DaemonSet = typed(object)?;
            let status = d.status.unwrap_or_default();
            Some((status.number_available.unwrap_or(0), status.desired_number_scheduled))
        }
        _ => None,
    };
    Ok(counts)
}

/// Satisfied when every workload matched by `selector` has all replicas
/// available.
///
/// `desired` replaces each object's own desired count when set. A mismatch
/// is returned as [`Error::ReplicasMismatch`] naming the object, so the
/// caller sees which workload is behind. No matching workloads means not
/// yet satisfied.
pub fn replicas_ready(
    store: Arc<dyn ObjectStore>,
    selector: Selector,
    desired: Option<i32>,
) -> WaitCondition {
    WaitCondition::new(format!("{} replicas to be ready", selector), move || {
        let store = store.clone();
        let selector = selector.clone();
        async move {
            let objects = store.list(&selector).await?;
            if objects.is_empty() {
                debug!(selector = %selector, "No workloads found yet");
                return Ok(false);
            }
            for object in objects {
                let resource = ObjectRef::from_object(&object)
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| selector.to_string());
                let Some((available, own_desired)) = replica_counts(object)? else {
                    return Err(Error::validation_field(
                        "selector",
                        format!("{} is not a replicated workload kind", selector.kind),
                    ));
                };
                let desired = desired.unwrap_or(own_desired);
                if available != desired {
                    return Err(Error::ReplicasMismatch {
                        resource,
                        available,
                        desired,
                    });
                }
            }
            Ok(true)
        }
    })
}

fn release_status(app: &DynamicObject) -> (&str, &str) {
    let release = &app.data["status"]["release"];
    (
        release["status"].as_str().unwrap_or_default(),
        release["reason"].as_str().unwrap_or_default(),
    )
}

/// Satisfied when the App's release status equals `expected`.
///
/// A different status is logged and reported as not yet satisfied; errors
/// fetching the App propagate.
pub fn rollout_status(
    store: Arc<dyn ObjectStore>,
    app: ObjectRef,
    expected: impl Into<String>,
) -> WaitCondition {
    let expected = expected.into();
    WaitCondition::new(format!("{} to be {}", app, expected), move || {
        let store = store.clone();
        let app = app.clone();
        let expected = expected.clone();
        async move {
            let object = store.get(&app).await?;
            let (actual, reason) = release_status(&object);
            if actual == expected {
                info!(app = %app, status = actual, "App status is as expected");
                Ok(true)
            } else {
                info!(app = %app, expected = %expected, actual, reason, "App status is not yet as expected");
                Ok(false)
            }
        }
    })
}

/// Satisfied when the App is `deployed`
pub fn app_deployed(store: Arc<dyn ObjectStore>, app: ObjectRef) -> WaitCondition {
    rollout_status(store, app, DEPLOYED)
}

/// Satisfied when every App in `apps` has release status `expected`.
///
/// Apps that do not exist yet count as not satisfied.
pub fn all_apps_status(
    store: Arc<dyn ObjectStore>,
    apps: Vec<ObjectRef>,
    expected: impl Into<String>,
) -> WaitCondition {
    let expected = expected.into();
    let apps = Arc::new(apps);
    WaitCondition::new(format!("{} apps to be {}", apps.len(), expected), move || {
        let store = store.clone();
        let apps = apps.clone();
        let expected = expected.clone();
        async move {
            let mut all = true;
            for app in apps.iter() {
                let Some(object) = get_opt(store.as_ref(), app).await? else {
                    debug!(app = %app, "App not found yet");
                    all = false;
                    continue;
                };
                let (actual, reason) = release_status(&object);
                if actual != expected {
                    debug!(app = %app, expected = %expected, actual, reason, "App status is not yet as expected");
                    all = false;
                }
            }
            Ok(all)
        }
    })
}

/// Satisfied when the App reports version `expected`, ignoring a leading `v`
pub fn app_version(
    store: Arc<dyn ObjectStore>,
    app: ObjectRef,
    expected: impl Into<String>,
) -> WaitCondition {
    let expected = expected.into();
    WaitCondition::new(format!("{} to run version {}", app, expected), move || {
        let store = store.clone();
        let app = app.clone();
        let expected = expected.clone();
        async move {
            let object = store.get(&app).await?;
            let actual = object.data["status"]["version"].as_str().unwrap_or_default();
            debug!(app = %app, expected = %expected, actual, "Checking App version");
            Ok(expected.trim_start_matches('v') == actual.trim_start_matches('v'))
        }
    })
}

/// Accepted number of ready nodes, inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRange {
    /// Lower bound
    pub min: usize,
    /// Upper bound
    pub max: usize,
}

impl NodeRange {
    /// Range with both bounds
    pub fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }

    /// Range with no upper bound
    pub fn at_least(min: usize) -> Self {
        Self {
            min,
            max: usize::MAX,
        }
    }

    /// Whether `count` lies within the range
    pub fn contains(&self, count: usize) -> bool {
        count >= self.min && count <= self.max
    }
}

fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Satisfied when the number of Ready nodes matched by `selector` is in `range`
pub fn nodes_ready(store: Arc<dyn ObjectStore>, selector: Selector, range: NodeRange) -> WaitCondition {
    WaitCondition::new(format!("{}..={} nodes to be ready", range.min, range.max), move || {
        let store = store.clone();
        let selector = selector.clone();
        async move {
            let mut ready = 0;
            for object in store.list(&selector).await? {
                let node: Node = typed(object)?;
                if is_node_ready(&node) {
                    ready += 1;
                }
            }
            info!(ready, min = range.min, max = range.max, "Checking ready nodes");
            Ok(range.contains(ready))
        }
    })
}

/// Satisfied when at least `min` nodes matched by `selector` are Ready
pub fn nodes_ready_at_least(store: Arc<dyn ObjectStore>, selector: Selector, min: usize) -> WaitCondition {
    nodes_ready(store, selector, NodeRange::at_least(min))
        .named(format!("at least {} nodes to be ready", min))
}

/// Select core/v1 Nodes
pub fn node_selector() -> Selector {
    Selector::new("v1", "Node")
}

fn job_succeeded(job: &Job) -> bool {
    let completions = job.spec.as_ref().and_then(|s| s.completions).unwrap_or(1);
    let succeeded = job.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0);
    succeeded >= completions
}

/// Satisfied when every Job matched by `selector` has reached its
/// completion count.
///
/// No matching Jobs means not yet satisfied.
pub fn jobs_succeeded(store: Arc<dyn ObjectStore>, selector: Selector) -> WaitCondition {
    WaitCondition::new(format!("{} jobs to succeed", selector), move || {
        let store = store.clone();
        let selector = selector.clone();
        async move {
            let objects = store.list(&selector).await?;
            if objects.is_empty() {
                debug!(selector = %selector, "No jobs found yet");
                return Ok(false);
            }
            let total = objects.len();
            let mut pending = Vec::new();
            for object in objects {
                let resource = ObjectRef::from_object(&object).map(|r| r.to_string());
                let job: Job = typed(object)?;
                if !job_succeeded(&job) {
                    pending.push(resource.unwrap_or_default());
                }
            }
            if !pending.is_empty() {
                debug!(pending = ?pending, "Jobs have not succeeded");
                return Ok(false);
            }
            info!(total, "All jobs have succeeded");
            Ok(true)
        }
    })
}

/// Select batch/v1 Jobs
pub fn job_selector() -> Selector {
    Selector::new("batch/v1", "Job")
}

fn pod_settled(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Running" | "Succeeded")
    )
}

/// Satisfied when every Pod matched by `selector` is Running or Succeeded.
///
/// No matching Pods means not yet satisfied.
pub fn pods_succeeded(store: Arc<dyn ObjectStore>, selector: Selector) -> WaitCondition {
    WaitCondition::new(format!("{} pods to be running or completed", selector), move || {
        let store = store.clone();
        let selector = selector.clone();
        async move {
            let objects = store.list(&selector).await?;
            if objects.is_empty() {
                debug!(selector = %selector, "No pods found yet");
                return Ok(false);
            }
            let total = objects.len();
            let mut pending = Vec::new();
            for object in objects {
                let resource = ObjectRef::from_object(&object).map(|r| r.to_string());
                let pod: Pod = typed(object)?;
                if !pod_settled(&pod) {
                    pending.push(resource.unwrap_or_default());
                }
            }
            if !pending.is_empty() {
                debug!(pending = ?pending, "Pods are not running or completed");
                return Ok(false);
            }
            info!(total, "All pods are running or completed");
            Ok(true)
        }
    })
}

/// Select core/v1 Pods
pub fn pod_selector() -> Selector {
    Selector::new("v1", "Pod")
}

/// Satisfied when the object's `status.conditions` entry of `type_` has
/// `status` and `reason`.
///
/// An absent condition is treated as status `Unknown`, so waiting for
/// `Unknown` is satisfied by a missing condition.
pub fn cluster_condition(
    store: Arc<dyn ObjectStore>,
    target: ObjectRef,
    type_: impl Into<String>,
    status: impl Into<String>,
    reason: impl Into<String>,
) -> WaitCondition {
    let (type_, status, reason) = (type_.into(), status.into(), reason.into());
    WaitCondition::new(format!("{} condition {}={}", target, type_, status), move || {
        let store = store.clone();
        let target = target.clone();
        let (type_, status, reason) = (type_.clone(), status.clone(), reason.clone());
        async move {
            let object = store.get(&target).await?;
            let found = object.data["status"]["conditions"]
                .as_array()
                .and_then(|conditions| {
                    conditions
                        .iter()
                        .find(|c| c["type"].as_str() == Some(type_.as_str()))
                });
            let Some(condition) = found else {
                debug!(object = %target, condition = %type_, "Condition is not set");
                return Ok(status == "Unknown");
            };
            let actual_status = condition["status"].as_str().unwrap_or_default();
            let actual_reason = condition["reason"].as_str().unwrap_or_default();
            debug!(
                object = %target,
                condition = %type_,
                status = actual_status,
                reason = actual_reason,
                "Found condition"
            );
            Ok(actual_status == status && actual_reason == reason)
        }
    })
}

/// Classify the outcome of a probe call against a workload cluster.
///
/// Any well-formed API response proves transport and authentication work;
/// only transient server states and connection failures mean "not yet".
pub fn is_successful_connection(result: &std::result::Result<(), clustertest_common::StoreError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => e.is_api_response() && e.kind != ErrorKind::Transient,
    }
}

async fn probe(store: &dyn ObjectStore) -> bool {
    let result = store
        .list(&Selector::new("v1", "Namespace"))
        .await
        .map(|_| ());
    if let Err(e) = &result {
        debug!(error = %e, "Probe call failed");
    }
    is_successful_connection(&result)
}

/// Satisfied when a client built from `kubeconfig` gets an answer from the
/// API server
pub fn endpoint_reachable(
    connector: Arc<dyn ClusterConnector>,
    cluster: impl Into<String>,
    kubeconfig: impl Into<String>,
) -> WaitCondition {
    let (cluster, kubeconfig) = (cluster.into(), kubeconfig.into());
    WaitCondition::new(format!("{} API to be reachable", cluster), move || {
        let connector = connector.clone();
        let cluster = cluster.clone();
        let kubeconfig = kubeconfig.clone();
        async move {
            let store = connector.connect(&cluster, &kubeconfig).await?;
            Ok(probe(store.as_ref()).await)
        }
    })
}

/// Satisfied when the cluster's bootstrap kubeconfig is published and the
/// API server it points at answers.
pub fn cluster_ready(
    mc: Arc<dyn ObjectStore>,
    connector: Arc<dyn ClusterConnector>,
    cluster: impl Into<String>,
    namespace: impl Into<String>,
) -> WaitCondition {
    let (cluster, namespace) = (cluster.into(), namespace.into());
    WaitCondition::new(format!("cluster {} to be ready", cluster), move || {
        let mc = mc.clone();
        let connector = connector.clone();
        let cluster = cluster.clone();
        let namespace = namespace.clone();
        async move {
            let Some(kubeconfig) = bootstrap_kubeconfig(mc.as_ref(), &cluster, &namespace).await? else {
                info!(cluster = %cluster, "Kubeconfig secret not yet available");
                return Ok(false);
            };
            let store = connector.connect(&cluster, &kubeconfig).await?;
            if !probe(store.as_ref()).await {
                info!(cluster = %cluster, "Connection to API server not yet available");
                return Ok(false);
            }
            info!(cluster = %cluster, "Got valid kubeconfig");
            Ok(true)
        }
    })
}
