//! Cluster lifecycle state machine.
//!
//! Creation walks `Initialized -> OrgEnsured -> UnitsDeployed ->
//! ReachabilityConfirmed -> CredentialExchanged`. Deletion walks `Ready ->
//! UnitDeleted -> ClusterResourceGone -> FinalizersCleared ->
//! DependentsCleaned -> OrgEvaluated`. Every step runs after the previous
//! one's postcondition holds; a failing step ends the sequence with an
//! [`Error::Step`] naming it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use clustertest_app::organization::is_safe_to_delete;
use clustertest_app::render::{AppCatalogRenderer, ManifestRenderer, APP_API_VERSION, APP_KIND};
use clustertest_app::{Application, BuiltCluster, Organization, VersionResolver};
use clustertest_common::config::{ExistingCluster, PollDefaults};
use clustertest_common::store::{delete_if_exists, get_opt};
use clustertest_common::{
    poll, Error, ObjectRef, ObjectStore, PollOptions, Result, Selector, CLUSTER_LABEL,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::apply::create_or_update;
use crate::conditions::{app_ref, capi_cluster_ref, cluster_ready, resource_exists, resource_gone};
use crate::credentials::{
    bootstrap_kubeconfig, ClusterConnector, ScopedIdentityProvisioner, ServiceAccountProvisioner,
    WorkloadClient,
};
use crate::registry::ClusterRegistry;

/// Default interval for the organization namespace to appear
pub const NAMESPACE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Progress of a creation sequence
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum CreatePhase {
    /// Nothing applied yet
    #[default]
    Initialized,
    /// Organization exists and its namespace is provisioned
    OrgEnsured,
    /// Every unit's values and manifest are applied
    UnitsDeployed,
    /// The bootstrap kubeconfig reaches the API server
    ReachabilityConfirmed,
    /// A scoped client is registered; the cluster is ready
    CredentialExchanged,
}

impl fmt::Display for CreatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialized => write!(f, "Initialized"),
            Self::OrgEnsured => write!(f, "OrgEnsured"),
            Self::UnitsDeployed => write!(f, "UnitsDeployed"),
            Self::ReachabilityConfirmed => write!(f, "ReachabilityConfirmed"),
            Self::CredentialExchanged => write!(f, "CredentialExchanged"),
        }
    }
}

/// Progress of a deletion sequence
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeletePhase {
    /// Cluster is ready; nothing deleted
    #[default]
    Ready,
    /// Top-level unit manifest deleted
    UnitDeleted,
    /// Cluster API object is gone
    ClusterResourceGone,
    /// Kubeconfig secret no longer blocks deletion
    FinalizersCleared,
    /// Marked resources labelled with the cluster are deleted
    DependentsCleaned,
    /// Organization deleted or deliberately kept
    OrgEvaluated,
}

impl fmt::Display for DeletePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "Ready"),
            Self::UnitDeleted => write!(f, "UnitDeleted"),
            Self::ClusterResourceGone => write!(f, "ClusterResourceGone"),
            Self::FinalizersCleared => write!(f, "FinalizersCleared"),
            Self::DependentsCleaned => write!(f, "DependentsCleaned"),
            Self::OrgEvaluated => write!(f, "OrgEvaluated"),
        }
    }
}

/// Working state of one cluster
#[derive(Debug, Clone)]
pub struct ClusterLifecycleRecord {
    /// Cluster name
    pub name: String,
    /// Organization owning the cluster namespace
    pub organization: Organization,
    /// Resolved units, cluster unit first
    pub units: Vec<Application>,
    /// Applied unit manifests, cluster unit first
    pub manifests: Vec<ObjectRef>,
    /// Applied release object
    pub release: Option<ObjectRef>,
    /// Client, set once the cluster is reachable
    pub client: Option<WorkloadClient>,
    /// Last completed creation step
    pub phase: CreatePhase,
}

impl ClusterLifecycleRecord {
    /// Empty record for a cluster about to be created
    pub fn new(name: impl Into<String>, organization: Organization) -> Self {
        Self {
            name: name.into(),
            organization,
            units: Vec::new(),
            manifests: Vec::new(),
            release: None,
            client: None,
            phase: CreatePhase::Initialized,
        }
    }

    /// Record for a cluster created outside this run.
    ///
    /// The organization is derived from the namespace and is never
    /// deletion-safe; the cluster unit is assumed to be the App named after
    /// the cluster.
    pub fn attached(existing: &ExistingCluster) -> Self {
        let mut record = Self::new(
            existing.name.clone(),
            Organization::from_namespace(&existing.namespace),
        );
        record.manifests.push(app_ref(&existing.name, &existing.namespace));
        record.phase = CreatePhase::UnitsDeployed;
        record
    }

    /// Namespace holding the cluster resources
    pub fn namespace(&self) -> String {
        self.organization.namespace()
    }

    fn advance(&mut self, phase: CreatePhase) {
        info!(cluster = %self.name, from = %self.phase, to = %phase, "Cluster creation progressed");
        self.phase = phase;
    }
}

/// How a deletion sequence ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Teardown was skipped on request
    Kept,
    /// Teardown ran to completion
    Deleted {
        /// Marked dependents removed
        dependents_deleted: usize,
        /// Whether the organization was removed
        organization_deleted: bool,
    },
}

/// A kind swept during dependent cleanup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependentKind {
    /// apiVersion of the kind
    pub api_version: String,
    /// Kind name
    pub kind: String,
    /// Whether objects live in the cluster namespace
    pub namespaced: bool,
}

impl DependentKind {
    /// Kind listed inside the cluster namespace
    pub fn namespaced(api_version: &str, kind: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespaced: true,
        }
    }

    /// Kind listed cluster-wide
    pub fn cluster_scoped(api_version: &str, kind: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespaced: false,
        }
    }
}

/// Kinds the harness labels with the cluster and marks deletion-safe
pub fn default_dependent_kinds() -> Vec<DependentKind> {
    vec![
        DependentKind::namespaced("v1", "ConfigMap"),
        DependentKind::namespaced("v1", "Secret"),
        DependentKind::namespaced(APP_API_VERSION, APP_KIND),
        DependentKind::cluster_scoped("release.giantswarm.io/v1alpha1", "Release"),
    ]
}

/// Orchestrator settings
#[derive(Clone, Debug)]
pub struct LifecycleConfig {
    /// Labels added to created organizations
    pub base_labels: BTreeMap<String, String>,
    /// Skip teardown entirely
    pub keep_workload_cluster: bool,
    /// Bootstrap credentials are already scoped; skip the exchange
    pub scoped_credentials: bool,
    /// Wait for the organization namespace
    pub namespace_wait: PollDefaults,
    /// Wait for the cluster to become reachable
    pub reachability: PollDefaults,
    /// Wait for the cluster resource to disappear
    pub deletion: PollDefaults,
    /// Suffix of the secret whose finalizers are cleared on teardown
    pub finalizer_secret_suffix: String,
    /// Kinds swept during dependent cleanup
    pub dependent_kinds: Vec<DependentKind>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            base_labels: BTreeMap::new(),
            keep_workload_cluster: false,
            scoped_credentials: false,
            namespace_wait: PollDefaults {
                interval: NAMESPACE_POLL_INTERVAL,
                ..PollDefaults::default()
            },
            reachability: PollDefaults::default(),
            deletion: PollDefaults::default(),
            finalizer_secret_suffix: "-kubeconfig".to_string(),
            dependent_kinds: default_dependent_kinds(),
        }
    }
}

/// Drives cluster creation and deletion against the management cluster
pub struct LifecycleOrchestrator {
    mc: Arc<dyn ObjectStore>,
    resolver: VersionResolver,
    renderer: Arc<dyn ManifestRenderer>,
    connector: Arc<dyn ClusterConnector>,
    provisioner: Arc<dyn ScopedIdentityProvisioner>,
    registry: Arc<ClusterRegistry>,
    config: LifecycleConfig,
}

impl LifecycleOrchestrator {
    /// Orchestrator with the App catalog renderer, service account
    /// provisioning and a fresh registry
    pub fn new(
        mc: Arc<dyn ObjectStore>,
        resolver: VersionResolver,
        connector: Arc<dyn ClusterConnector>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            mc,
            resolver,
            renderer: Arc::new(AppCatalogRenderer::new(config.base_labels.clone())),
            connector,
            provisioner: Arc::new(ServiceAccountProvisioner::default()),
            registry: Arc::new(ClusterRegistry::new()),
            config,
        }
    }

    /// Replace the manifest renderer
    pub fn with_renderer(mut self, renderer: Arc<dyn ManifestRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Replace the identity provisioner
    pub fn with_provisioner(mut self, provisioner: Arc<dyn ScopedIdentityProvisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    /// Share an existing registry
    pub fn with_registry(mut self, registry: Arc<ClusterRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Registry of reachable clusters
    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    /// Resolver used for unit versions
    pub fn resolver(&self) -> &VersionResolver {
        &self.resolver
    }

    /// Settings
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Create a cluster and return its record once a client is registered
    pub async fn create(
        &self,
        cluster: BuiltCluster,
        cancel: CancellationToken,
    ) -> Result<ClusterLifecycleRecord> {
        let mut record = ClusterLifecycleRecord::new(cluster.name.clone(), cluster.organization.clone());
        info!(cluster = %record.name, namespace = %record.namespace(), "Creating cluster");

        self.ensure_organization(&record.organization, &cancel)
            .await
            .map_err(|e| Error::step("ensure organization", e))?;
        record.advance(CreatePhase::OrgEnsured);

        if let Some(release) = &cluster.release {
            create_or_update(self.mc.as_ref(), release)
                .await
                .map_err(|e| Error::step("apply release", e))?;
            record.release = ObjectRef::from_object(release);
        }

        for unit in cluster.units {
            let (unit, manifest) = self.deploy_unit(unit).await?;
            record.units.push(unit);
            record.manifests.push(manifest);
        }
        record.advance(CreatePhase::UnitsDeployed);

        self.connect(&mut record, &cancel).await?;
        Ok(record)
    }

    /// Attach to a cluster created outside this run
    pub async fn attach(
        &self,
        existing: &ExistingCluster,
        cancel: CancellationToken,
    ) -> Result<ClusterLifecycleRecord> {
        info!(cluster = %existing.name, namespace = %existing.namespace, "Attaching to existing cluster");
        let mut record = ClusterLifecycleRecord::attached(existing);
        self.connect(&mut record, &cancel).await?;
        Ok(record)
    }

    async fn ensure_organization(&self, org: &Organization, cancel: &CancellationToken) -> Result<()> {
        let org_ref = org.object_ref();
        match self.mc.get(&org_ref).await {
            Ok(_) => debug!(organization = %org.name(), "Organization already exists"),
            Err(e) if e.is_not_found() => {
                info!(organization = %org.name(), "Creating organization");
                match self.mc.create(&org.to_object(&self.config.base_labels)).await {
                    Ok(_) => {}
                    Err(e) if e.is_already_exists() => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        }

        let namespace = resource_exists(self.mc.clone(), ObjectRef::namespace(org.namespace()));
        poll(&namespace, &self.options(self.config.namespace_wait, cancel)).await
    }

    async fn deploy_unit(&self, mut unit: Application) -> Result<(Application, ObjectRef)> {
        self.resolver
            .resolve_application(&mut unit)
            .await
            .map_err(|e| Error::step(format!("resolve {} version", unit.app_name), e))?;

        let rendered = self
            .renderer
            .render(&unit)
            .map_err(|e| Error::step(format!("render {}", unit.app_name), e))?;

        create_or_update(self.mc.as_ref(), &rendered.values)
            .await
            .map_err(|e| Error::step(format!("apply {} values", unit.app_name), e))?;
        create_or_update(self.mc.as_ref(), &rendered.manifest)
            .await
            .map_err(|e| Error::step(format!("apply {} manifest", unit.app_name), e))?;

        let manifest = ObjectRef::from_object(&rendered.manifest).ok_or_else(|| {
            Error::internal_with_context("deploy_unit", "rendered manifest has no name")
        })?;
        info!(unit = %unit.install_name, version = %unit.version, catalog = %unit.catalog, "Applied unit");
        Ok((unit, manifest))
    }

    /// Wait for reachability, exchange credentials and register the client
    async fn connect(&self, record: &mut ClusterLifecycleRecord, cancel: &CancellationToken) -> Result<()> {
        let namespace = record.namespace();
        let ready = cluster_ready(
            self.mc.clone(),
            self.connector.clone(),
            record.name.clone(),
            namespace.clone(),
        );
        poll(&ready, &self.options(self.config.reachability, cancel))
            .await
            .map_err(|e| Error::step("wait for cluster to become reachable", e))?;

        let bootstrap = self
            .bootstrap_client(&record.name, &namespace)
            .await
            .map_err(|e| Error::step("build bootstrap client", e))?;
        record.client = Some(bootstrap.clone());
        record.advance(CreatePhase::ReachabilityConfirmed);

        let client = if self.config.scoped_credentials {
            debug!(cluster = %record.name, "Bootstrap credentials are already scoped");
            bootstrap
        } else {
            self.exchange_credentials(bootstrap, cancel)
                .await
                .map_err(|e| Error::step("exchange cluster credentials", e))?
        };

        self.registry.insert(client.clone());
        record.client = Some(client);
        record.advance(CreatePhase::CredentialExchanged);
        Ok(())
    }

    async fn bootstrap_client(&self, cluster: &str, namespace: &str) -> Result<WorkloadClient> {
        let kubeconfig = bootstrap_kubeconfig(self.mc.as_ref(), cluster, namespace)
            .await?
            .ok_or_else(|| Error::credential(cluster, "kubeconfig secret disappeared"))?;
        let store = self.connector.connect(cluster, &kubeconfig).await?;
        Ok(WorkloadClient {
            cluster: cluster.to_string(),
            kubeconfig,
            store,
        })
    }

    async fn exchange_credentials(
        &self,
        bootstrap: WorkloadClient,
        cancel: &CancellationToken,
    ) -> Result<WorkloadClient> {
        let kubeconfig = self
            .provisioner
            .provision(
                &bootstrap.cluster,
                bootstrap.store.clone(),
                &bootstrap.kubeconfig,
                cancel.clone(),
            )
            .await?;
        let store = self.connector.connect(&bootstrap.cluster, &kubeconfig).await?;
        Ok(WorkloadClient {
            cluster: bootstrap.cluster,
            kubeconfig,
            store,
        })
    }

    /// Tear a cluster down.
    ///
    /// Resources that are already gone count as deleted at every step.
    pub async fn delete(
        &self,
        record: &ClusterLifecycleRecord,
        cancel: CancellationToken,
    ) -> Result<DeleteOutcome> {
        if self.config.keep_workload_cluster {
            warn!(cluster = %record.name, "Keeping workload cluster, skipping teardown");
            return Ok(DeleteOutcome::Kept);
        }

        let name = record.name.as_str();
        let namespace = record.namespace();
        let mut phase = DeletePhase::Ready;
        info!(cluster = %name, namespace = %namespace, "Deleting cluster");

        if let Some(manifest) = record.manifests.first() {
            let existed = delete_if_exists(self.mc.as_ref(), manifest)
                .await
                .map_err(|e| Error::step("delete cluster manifest", e))?;
            debug!(cluster = %name, manifest = %manifest, existed, "Deleted cluster manifest");
        }
        phase = transition(name, phase, DeletePhase::UnitDeleted);

        let gone = resource_gone(self.mc.clone(), capi_cluster_ref(name, &namespace));
        poll(&gone, &self.options(self.config.deletion, &cancel))
            .await
            .map_err(|e| Error::step("wait for cluster resource deletion", e))?;
        phase = transition(name, phase, DeletePhase::ClusterResourceGone);

        self.clear_finalizers(name, &namespace)
            .await
            .map_err(|e| Error::step("clear secret finalizers", e))?;
        phase = transition(name, phase, DeletePhase::FinalizersCleared);

        let dependents_deleted = self
            .delete_dependents(name, &namespace)
            .await
            .map_err(|e| Error::step(format!("clean up dependents of {}", name), e))?;
        phase = transition(name, phase, DeletePhase::DependentsCleaned);

        let organization_deleted = self
            .evaluate_organization(&record.organization)
            .await
            .map_err(|e| Error::step("delete organization", e))?;
        transition(name, phase, DeletePhase::OrgEvaluated);

        self.registry.remove(name);
        Ok(DeleteOutcome::Deleted {
            dependents_deleted,
            organization_deleted,
        })
    }

    async fn clear_finalizers(&self, cluster: &str, namespace: &str) -> Result<()> {
        let secret = ObjectRef::secret(
            namespace,
            format!("{}{}", cluster, self.config.finalizer_secret_suffix),
        );
        let Some(object) = get_opt(self.mc.as_ref(), &secret).await? else {
            debug!(secret = %secret, "Secret already gone");
            return Ok(());
        };
        if object.metadata.finalizers.as_ref().map_or(true, Vec::is_empty) {
            return Ok(());
        }

        match self
            .mc
            .patch(&secret, &json!({ "metadata": { "finalizers": null } }))
            .await
        {
            Ok(_) => {
                info!(secret = %secret, "Removed finalizers");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every marked object labelled with the cluster.
    ///
    /// Continues past failures and returns the first one.
    async fn delete_dependents(&self, cluster: &str, namespace: &str) -> Result<usize> {
        let labels = format!("{}={}", CLUSTER_LABEL, cluster);
        let mut deleted = 0;
        let mut first_error: Option<Error> = None;

        for kind in &self.config.dependent_kinds {
            let mut selector =
                Selector::new(kind.api_version.as_str(), kind.kind.as_str()).with_labels(labels.as_str());
            if kind.namespaced {
                selector = selector.in_namespace(namespace);
            }

            let objects = match self.mc.list(&selector).await {
                Ok(objects) => objects,
                Err(e) => {
                    warn!(selector = %selector, error = %e, "Failed to list dependents");
                    first_error.get_or_insert(e.into());
                    continue;
                }
            };

            for object in objects.iter().filter(|o| is_safe_to_delete(o)) {
                let Some(target) = ObjectRef::from_object(object) else {
                    continue;
                };
                match delete_if_exists(self.mc.as_ref(), &target).await {
                    Ok(_) => {
                        debug!(object = %target, "Deleted dependent");
                        deleted += 1;
                    }
                    Err(e) => {
                        warn!(object = %target, error = %e, "Failed to delete dependent");
                        first_error.get_or_insert(e.into());
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(deleted),
        }
    }

    /// Delete the organization only if this run created it and it still
    /// carries the marker.
    async fn evaluate_organization(&self, org: &Organization) -> Result<bool> {
        if !org.deletion_safe() {
            info!(organization = %org.name(), "Leaving organization that this run did not create");
            return Ok(false);
        }
        let org_ref = org.object_ref();
        match get_opt(self.mc.as_ref(), &org_ref).await? {
            None => Ok(false),
            Some(object) if !is_safe_to_delete(&object) => {
                warn!(organization = %org.name(), "Organization lacks the cleanup marker, leaving it");
                Ok(false)
            }
            Some(_) => {
                let deleted = delete_if_exists(self.mc.as_ref(), &org_ref).await?;
                info!(organization = %org.name(), "Deleted organization");
                Ok(deleted)
            }
        }
    }

    fn options(&self, defaults: PollDefaults, cancel: &CancellationToken) -> PollOptions {
        PollOptions::new(defaults.timeout, defaults.interval).with_cancellation(cancel.clone())
    }
}

fn transition(cluster: &str, from: DeletePhase, to: DeletePhase) -> DeletePhase {
    info!(cluster = %cluster, from = %from, to = %to, "Cluster deletion progressed");
    to
}
