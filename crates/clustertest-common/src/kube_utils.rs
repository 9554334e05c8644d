//! kube-rs backed [`ObjectStore`] and client helpers.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use crate::store::{ErrorKind, ObjectRef, ObjectStore, Selector, StoreError};
use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// API status codes that indicate the server is overloaded or still starting
const TRANSIENT_STATUS_CODES: &[u16] = &[429, 500, 502, 503, 504];

/// [`ObjectStore`] backed by a kube-rs client
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// The underlying client
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = build_api_resource(api_version, kind);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get(&self, object: &ObjectRef) -> Result<DynamicObject, StoreError> {
        let api = self.api(&object.api_version, &object.kind, object.namespace.as_deref());
        Ok(api.get(&object.name).await?)
    }

    async fn list(&self, selector: &Selector) -> Result<Vec<DynamicObject>, StoreError> {
        let api = self.api(
            &selector.api_version,
            &selector.kind,
            selector.namespace.as_deref(),
        );
        let mut params = ListParams::default();
        if let Some(labels) = &selector.label_selector {
            params = params.labels(labels);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn create(&self, object: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let target = ObjectRef::from_object(object).ok_or_else(|| {
            StoreError::new(
                ErrorKind::Permanent,
                "object must carry apiVersion, kind and name",
            )
        })?;
        let api = self.api(&target.api_version, &target.kind, target.namespace.as_deref());
        debug!(object = %target, "Creating object");
        Ok(api.create(&PostParams::default(), object).await?)
    }

    async fn patch(
        &self,
        object: &ObjectRef,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject, StoreError> {
        let api = self.api(&object.api_version, &object.kind, object.namespace.as_deref());
        debug!(object = %object, "Patching object");
        Ok(api
            .patch(&object.name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    async fn delete(&self, object: &ObjectRef) -> Result<(), StoreError> {
        let api = self.api(&object.api_version, &object.kind, object.namespace.as_deref());
        debug!(object = %object, "Deleting object");
        api.delete(&object.name, &DeleteParams::default()).await?;
        Ok(())
    }
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => {
                let kind = classify_status(resp.code, &resp.reason);
                StoreError::api(kind, resp.code, resp.message)
            }
            kube::Error::HyperError(e) => StoreError::unreachable(e.to_string()),
            kube::Error::Service(e) => StoreError::unreachable(e.to_string()),
            other => StoreError::new(ErrorKind::Permanent, other.to_string()),
        }
    }
}

/// Classify an API status code and reason into an [`ErrorKind`]
pub fn classify_status(code: u16, reason: &str) -> ErrorKind {
    match code {
        404 => ErrorKind::NotFound,
        409 if reason == "AlreadyExists" => ErrorKind::AlreadyExists,
        c if TRANSIENT_STATUS_CODES.contains(&c) => ErrorKind::Transient,
        _ => ErrorKind::Permanent,
    }
}

/// Create a kube client from a kubeconfig file with default timeouts
pub async fn client_from_path(path: &Path, context: Option<&str>) -> Result<Client, Error> {
    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
        Error::internal_with_context(
            "client_from_path",
            format!("failed to read kubeconfig {}: {}", path.display(), e),
        )
    })?;
    client_from_kubeconfig(kubeconfig, context).await
}

/// Create a kube client from kubeconfig YAML with default timeouts
pub async fn client_from_yaml(yaml: &str, context: Option<&str>) -> Result<Client, Error> {
    let kubeconfig = Kubeconfig::from_yaml(yaml).map_err(|e| {
        Error::internal_with_context(
            "client_from_yaml",
            format!("failed to parse kubeconfig: {}", e),
        )
    })?;
    client_from_kubeconfig(kubeconfig, context).await
}

/// Create a kube client from a parsed kubeconfig with default timeouts
pub async fn client_from_kubeconfig(
    kubeconfig: Kubeconfig,
    context: Option<&str>,
) -> Result<Client, Error> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("failed to load kubeconfig: {}", e),
            )
        })?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Build an ApiResource from a known apiVersion and kind.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Build an empty object of the given type with name and namespace set
pub fn dynamic_object(
    api_version: &str,
    kind: &str,
    name: &str,
    namespace: Option<&str>,
) -> DynamicObject {
    let ar = build_api_resource(api_version, kind);
    let obj = DynamicObject::new(name, &ar);
    match namespace {
        Some(ns) => obj.within(ns),
        None => obj,
    }
}

/// Split an apiVersion into (group, version); the core group is empty
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Known Kind -> plural mappings that don't follow simple rules
const KIND_PLURALS: &[(&str, &str)] = &[
    ("endpoints", "endpoints"),
    ("ingress", "ingresses"),
    ("networkpolicy", "networkpolicies"),
    ("podsecuritypolicy", "podsecuritypolicies"),
    ("clusterclass", "clusterclasses"),
    ("awsmanagedmachinepool", "awsmanagedmachinepools"),
];

/// Pluralize a Kubernetes resource kind
///
/// Uses a lookup table for irregular kinds, falling back to simple
/// pluralization rules.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(singular, _)| *singular == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}
