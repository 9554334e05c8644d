//! Workload cluster credentials.
//!
//! A freshly created cluster publishes a bootstrap kubeconfig in a Secret on
//! the management cluster. The harness reads it, optionally points it at the
//! cluster's public API hostname, and then trades it for a scoped identity
//! created inside the workload cluster.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clustertest_common::kube_utils::{client_from_yaml, dynamic_object, KubeObjectStore};
use clustertest_common::store::get_opt;
use clustertest_common::yaml::{parse_yaml, to_yaml_string};
use clustertest_common::{poll, Error, ObjectRef, ObjectStore, PollOptions, Result};
use kube::api::DynamicObject;
use kube::config::Kubeconfig;
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::{Host, Url};

use crate::apply::create_if_absent;
use crate::conditions::resource_exists;

/// Key of the kubeconfig inside the bootstrap Secret
pub const KUBECONFIG_KEY: &str = "value";
/// Service account created inside every workload cluster
pub const SERVICE_ACCOUNT_NAME: &str = "e2e-test-account";
/// Token Secret bound to [`SERVICE_ACCOUNT_NAME`]
pub const SERVICE_ACCOUNT_SECRET: &str = "e2e-test-account-secret";
/// Namespace holding the service account
pub const SERVICE_ACCOUNT_NAMESPACE: &str = "default";
/// Cluster name used inside generated kubeconfigs
pub const GENERATED_CLUSTER_NAME: &str = "e2e-wc";

const AWS_LOAD_BALANCER_SUFFIX: &str = "elb.amazonaws.com";
const SERVICE_ACCOUNT_ANNOTATION: &str = "kubernetes.io/service-account.name";
const TOKEN_SECRET_TYPE: &str = "kubernetes.io/service-account-token";

/// Secret on the management cluster holding the bootstrap kubeconfig
pub fn kubeconfig_secret_ref(cluster: &str, namespace: &str) -> ObjectRef {
    ObjectRef::secret(namespace, format!("{}-kubeconfig", cluster))
}

/// ConfigMap on the management cluster holding the cluster's rendered values
pub fn cluster_values_ref(cluster: &str, namespace: &str) -> ObjectRef {
    ObjectRef::config_map(namespace, format!("{}-cluster-values", cluster))
}

/// Decode `data[key]` of a Secret; `None` if the key is missing or empty
pub fn secret_data(secret: &DynamicObject, key: &str) -> Result<Option<Vec<u8>>> {
    let Some(encoded) = secret.data["data"][key].as_str() else {
        return Ok(None);
    };
    if encoded.is_empty() {
        return Ok(None);
    }
    let decoded = STANDARD.decode(encoded).map_err(|e| {
        Error::serialization_for_kind("Secret", format!("data.{} is not base64: {}", key, e))
    })?;
    Ok(Some(decoded))
}

/// Read the bootstrap kubeconfig of a workload cluster.
///
/// Returns `Ok(None)` while the Secret does not exist yet or carries no
/// kubeconfig. Servers addressed by IP or by an AWS load balancer name are
/// rewritten to `api.<baseDomain>`, read from the cluster values ConfigMap.
pub async fn bootstrap_kubeconfig(
    mc: &dyn ObjectStore,
    cluster: &str,
    namespace: &str,
) -> Result<Option<String>> {
    let Some(secret) = get_opt(mc, &kubeconfig_secret_ref(cluster, namespace)).await? else {
        return Ok(None);
    };
    let Some(raw) = secret_data(&secret, KUBECONFIG_KEY)? else {
        return Ok(None);
    };
    let yaml = String::from_utf8(raw)
        .map_err(|e| Error::credential(cluster, format!("kubeconfig is not UTF-8: {}", e)))?;

    let mut kubeconfig = Kubeconfig::from_yaml(&yaml)
        .map_err(|e| Error::credential(cluster, format!("invalid kubeconfig: {}", e)))?;

    let needs_rewrite = kubeconfig.clusters.iter().any(|c| {
        c.cluster
            .as_ref()
            .and_then(|c| c.server.as_deref())
            .is_some_and(needs_public_hostname)
    });
    if !needs_rewrite {
        return Ok(Some(yaml));
    }

    let base_domain = base_domain(mc, cluster, namespace).await?;
    for named in kubeconfig.clusters.iter_mut() {
        if let Some(server) = named.cluster.as_mut().and_then(|c| c.server.as_mut()) {
            if needs_public_hostname(server) {
                let rewritten = rewrite_server(server, &base_domain)?;
                debug!(cluster, from = %server, to = %rewritten, "Rewriting kubeconfig server");
                *server = rewritten;
            }
        }
    }
    kubeconfig_to_yaml(&kubeconfig).map(Some)
}

/// Whether a server URL needs to be replaced by the public API hostname
pub fn needs_public_hostname(server: &str) -> bool {
    match Url::parse(server).ok().and_then(|u| u.host().map(|h| h.to_owned())) {
        Some(Host::Ipv4(_)) | Some(Host::Ipv6(_)) => true,
        Some(Host::Domain(d)) => d.ends_with(AWS_LOAD_BALANCER_SUFFIX),
        None => false,
    }
}

/// Replace the host of `server` with `api.<base_domain>`, keeping the port
pub fn rewrite_server(server: &str, base_domain: &str) -> Result<String> {
    let url = Url::parse(server)
        .map_err(|e| Error::validation_field("server", format!("{}: {}", server, e)))?;
    let port = url.port_or_known_default().unwrap_or(443);
    Ok(format!("https://api.{}:{}", base_domain, port))
}

async fn base_domain(mc: &dyn ObjectStore, cluster: &str, namespace: &str) -> Result<String> {
    let cm = mc.get(&cluster_values_ref(cluster, namespace)).await?;
    let values = cm.data["data"]["values"].as_str().ok_or_else(|| {
        Error::credential(cluster, "cluster values ConfigMap has no values")
    })?;
    let values = parse_yaml(values)
        .map_err(|e| Error::serialization_for_kind("ConfigMap", e.to_string()))?;
    values["baseDomain"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::credential(cluster, "cluster values do not set baseDomain"))
}

fn kubeconfig_to_yaml(kubeconfig: &Kubeconfig) -> Result<String> {
    let value = serde_json::to_value(kubeconfig)?;
    to_yaml_string(&value).map_err(|e| Error::serialization_for_kind("Kubeconfig", e.to_string()))
}

/// A client connected to one workload cluster
#[derive(Clone)]
pub struct WorkloadClient {
    /// Cluster name
    pub cluster: String,
    /// Kubeconfig the client was built from
    pub kubeconfig: String,
    /// Store talking to the workload cluster API
    pub store: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for WorkloadClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadClient")
            .field("cluster", &self.cluster)
            .finish_non_exhaustive()
    }
}

/// Turns kubeconfig text into a live store
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Build a store for `cluster` from its kubeconfig
    async fn connect(&self, cluster: &str, kubeconfig: &str) -> Result<Arc<dyn ObjectStore>>;
}

/// [`ClusterConnector`] building kube-rs clients
#[derive(Debug, Default, Clone)]
pub struct KubeConnector;

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, cluster: &str, kubeconfig: &str) -> Result<Arc<dyn ObjectStore>> {
        let client = client_from_yaml(kubeconfig, None)
            .await
            .map_err(|e| Error::credential(cluster, e.to_string()))?;
        Ok(Arc::new(KubeObjectStore::new(client)))
    }
}

/// Creates a long-lived identity inside a workload cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ScopedIdentityProvisioner: Send + Sync {
    /// Provision the identity through `wc` and return a kubeconfig using it.
    ///
    /// `bootstrap` is the kubeconfig `wc` was built from; its server address
    /// is reused.
    async fn provision(
        &self,
        cluster: &str,
        wc: Arc<dyn ObjectStore>,
        bootstrap: &str,
        cancel: CancellationToken,
    ) -> Result<String>;
}

/// Provisions a cluster-admin ServiceAccount with a token Secret
#[derive(Debug, Clone)]
pub struct ServiceAccountProvisioner {
    /// Limit for the default namespace to appear
    pub namespace_timeout: Duration,
    /// Interval between default namespace checks
    pub namespace_interval: Duration,
    /// Limit for the token controller to populate the Secret
    pub token_timeout: Duration,
    /// Interval between token checks
    pub token_interval: Duration,
}

impl Default for ServiceAccountProvisioner {
    fn default() -> Self {
        Self {
            namespace_timeout: Duration::from_secs(5 * 60),
            namespace_interval: Duration::from_secs(5),
            token_timeout: Duration::from_secs(5 * 60),
            token_interval: Duration::from_secs(1),
        }
    }
}

impl ServiceAccountProvisioner {
    fn identity_objects() -> Vec<DynamicObject> {
        let mut account = dynamic_object(
            "v1",
            "ServiceAccount",
            SERVICE_ACCOUNT_NAME,
            Some(SERVICE_ACCOUNT_NAMESPACE),
        );
        account.data = json!({});

        let mut secret = dynamic_object(
            "v1",
            "Secret",
            SERVICE_ACCOUNT_SECRET,
            Some(SERVICE_ACCOUNT_NAMESPACE),
        );
        secret.metadata.annotations = Some(BTreeMap::from([(
            SERVICE_ACCOUNT_ANNOTATION.to_string(),
            SERVICE_ACCOUNT_NAME.to_string(),
        )]));
        secret.data = json!({ "type": TOKEN_SECRET_TYPE });

        let mut binding = dynamic_object(
            "rbac.authorization.k8s.io/v1",
            "ClusterRoleBinding",
            SERVICE_ACCOUNT_NAME,
            None,
        );
        binding.data = json!({
            "roleRef": {
                "apiGroup": "rbac.authorization.k8s.io",
                "kind": "ClusterRole",
                "name": "cluster-admin",
            },
            "subjects": [{
                "kind": "ServiceAccount",
                "name": SERVICE_ACCOUNT_NAME,
                "namespace": SERVICE_ACCOUNT_NAMESPACE,
            }],
        });

        vec![account, secret, binding]
    }
}

#[async_trait]
impl ScopedIdentityProvisioner for ServiceAccountProvisioner {
    async fn provision(
        &self,
        cluster: &str,
        wc: Arc<dyn ObjectStore>,
        bootstrap: &str,
        cancel: CancellationToken,
    ) -> Result<String> {
        let default_ns = resource_exists(wc.clone(), ObjectRef::namespace(SERVICE_ACCOUNT_NAMESPACE));
        poll(
            &default_ns,
            &PollOptions::new(self.namespace_timeout, self.namespace_interval)
                .with_cancellation(cancel.clone()),
        )
        .await?;

        for object in Self::identity_objects() {
            create_if_absent(wc.as_ref(), &object).await?;
        }

        let secret_ref = ObjectRef::secret(SERVICE_ACCOUNT_NAMESPACE, SERVICE_ACCOUNT_SECRET);
        let token_ready = {
            let wc = wc.clone();
            let secret_ref = secret_ref.clone();
            clustertest_common::WaitCondition::new(
                format!("token in {}", secret_ref),
                move || {
                    let wc = wc.clone();
                    let secret_ref = secret_ref.clone();
                    async move {
                        let Some(secret) = get_opt(wc.as_ref(), &secret_ref).await? else {
                            return Ok(false);
                        };
                        Ok(secret_data(&secret, "ca.crt")?.is_some()
                            && secret_data(&secret, "token")?.is_some())
                    }
                },
            )
        };
        poll(
            &token_ready,
            &PollOptions::new(self.token_timeout, self.token_interval).with_cancellation(cancel),
        )
        .await?;

        let secret = wc.get(&secret_ref).await?;
        let ca = secret.data["data"]["ca.crt"]
            .as_str()
            .ok_or_else(|| Error::credential(cluster, "token Secret lost its ca.crt"))?
            .to_string();
        let token = secret_data(&secret, "token")?
            .ok_or_else(|| Error::credential(cluster, "token Secret lost its token"))?;
        let token = String::from_utf8(token)
            .map_err(|e| Error::credential(cluster, format!("token is not UTF-8: {}", e)))?;

        let server = bootstrap_server(cluster, bootstrap)?;
        info!(cluster, account = SERVICE_ACCOUNT_NAME, "Provisioned scoped identity");
        scoped_kubeconfig(&server, &ca, &token)
    }
}

fn bootstrap_server(cluster: &str, bootstrap: &str) -> Result<String> {
    let kubeconfig = Kubeconfig::from_yaml(bootstrap)
        .map_err(|e| Error::credential(cluster, format!("invalid kubeconfig: {}", e)))?;
    let context = kubeconfig
        .current_context
        .as_deref()
        .and_then(|name| kubeconfig.contexts.iter().find(|c| c.name == name))
        .and_then(|c| c.context.as_ref())
        .map(|c| c.cluster.clone());
    kubeconfig
        .clusters
        .iter()
        .find(|c| context.as_deref().map_or(true, |name| c.name == name))
        .and_then(|c| c.cluster.as_ref())
        .and_then(|c| c.server.clone())
        .ok_or_else(|| Error::credential(cluster, "kubeconfig has no server"))
}

/// Kubeconfig for the provisioned service account.
///
/// `ca_data` is the base64 CA bundle as stored in the token Secret.
pub fn scoped_kubeconfig(server: &str, ca_data: &str, token: &str) -> Result<String> {
    let context = format!("{}@{}", SERVICE_ACCOUNT_NAME, GENERATED_CLUSTER_NAME);
    let value = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": GENERATED_CLUSTER_NAME,
            "cluster": {
                "server": server,
                "certificate-authority-data": ca_data,
            },
        }],
        "users": [{
            "name": SERVICE_ACCOUNT_NAME,
            "user": { "token": token },
        }],
        "contexts": [{
            "name": context,
            "context": {
                "cluster": GENERATED_CLUSTER_NAME,
                "user": SERVICE_ACCOUNT_NAME,
            },
        }],
        "current-context": context,
    });
    to_yaml_string(&value).map_err(|e| Error::serialization_for_kind("Kubeconfig", e.to_string()))
}
